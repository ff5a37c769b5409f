//! Inference pipeline: decode, preprocess, generate, postprocess, encode.

use std::path::Path;

use ::image::{DynamicImage, RgbImage};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::error::{Error, Result};
use crate::image::{self, ImageTensor, OutputFormat};
use crate::model::{Architecture, CheckpointLocation, Generator, Mode};

use super::data_url::DataUrl;

/// Configuration for the prediction pipeline.
#[derive(Debug, Clone)]
pub struct Config {
    /// Where the trained generator weights live.
    pub checkpoint: CheckpointLocation,

    /// Base channel width of the generator (64 for published checkpoints).
    pub base_filters: usize,

    /// Evaluation (deterministic) or training-mode execution.
    pub mode: Mode,

    /// Random seed for training-mode dropout. None for a fresh seed per request.
    pub seed: Option<u64>,

    /// Raster format of generated images.
    pub output_format: OutputFormat,

    /// JPEG quality (1-100), used whenever an output is encoded as JPEG.
    pub output_quality: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            checkpoint: CheckpointLocation::default(),
            base_filters: crate::model::DEFAULT_BASE_FILTERS,
            mode: Mode::Evaluation,
            seed: None,
            output_format: OutputFormat::Png,
            output_quality: 95,
        }
    }
}

impl Config {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any parameter is out of valid range.
    pub fn validate(&self) -> Result<()> {
        if self.base_filters == 0 {
            return Err(Error::InvalidParameter {
                name: "base_filters".to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }

        if !(1..=100).contains(&self.output_quality) {
            return Err(Error::InvalidParameter {
                name: "output_quality".to_string(),
                reason: "must be between 1 and 100".to_string(),
            });
        }

        Ok(())
    }

    /// Generator layout implied by this configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the base width is invalid.
    pub fn architecture(&self) -> Result<Architecture> {
        Architecture::with_base_filters(self.base_filters)
    }
}

/// The prediction pipeline around one restored generator.
#[derive(Debug)]
pub struct Predictor {
    config: Config,
    generator: Generator,
}

impl Predictor {
    /// Restore the generator named by the configuration.
    ///
    /// This is the only place the checkpoint is read; a failure here means the
    /// service cannot start.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the checkpoint is
    /// missing or incompatible.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        tracing::info!("Initializing predictor with config: {config:?}");

        let generator = Generator::restore(config.architecture()?, config.checkpoint.path())?;

        Self::with_generator(config, generator)
    }

    /// Wrap an already constructed generator.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn with_generator(config: Config, generator: Generator) -> Result<Self> {
        config.validate()?;

        if config.mode == Mode::Training {
            tracing::warn!(
                "Training-mode inference enabled: outputs use per-request normalization \
                 statistics and random dropout"
            );
        }

        Ok(Self { config, generator })
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub const fn generator(&self) -> &Generator {
        &self.generator
    }

    /// Run the generator on a normalized tensor in the configured mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the forward pass fails.
    pub fn translate(&self, tensor: &ImageTensor) -> Result<ImageTensor> {
        match self.config.mode {
            Mode::Evaluation => self.generator.generate(tensor),
            Mode::Training => {
                let mut rng = self
                    .config
                    .seed
                    .map_or_else(StdRng::from_os_rng, StdRng::seed_from_u64);
                self.generator.generate_training(tensor, &mut rng)
            }
        }
    }

    /// Translate a decoded image of any size and color mode into a 256x256 RGB image.
    ///
    /// # Errors
    ///
    /// Returns an error if the forward pass fails.
    pub fn predict_image(&self, img: &DynamicImage) -> Result<RgbImage> {
        let input = image::preprocess(img);
        let output = self.translate(&input)?;
        image::postprocess(&output)
    }

    /// Translate encoded raster bytes into encoded raster bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ImageDecode`] for undecodable input, or any pipeline error.
    pub fn predict_bytes(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        let img = image::decode_image(bytes)?;
        let output = self.predict_image(&img)?;
        image::encode_image(&output, self.config.output_format, self.config.output_quality)
    }

    /// Translate a base64 image data URL into a data URL of the generated image.
    ///
    /// # Errors
    ///
    /// Returns a request error for malformed URLs, base64 or raster data.
    pub fn predict_data_url(&self, data_url: &str) -> Result<String> {
        let input = DataUrl::parse(data_url)?;
        tracing::debug!(
            "Predicting from {} bytes ({})",
            input.data().len(),
            input.mime().unwrap_or("unknown mime")
        );

        let bytes = self.predict_bytes(input.data())?;
        let format = self.config.output_format;

        Ok(DataUrl::new(format.mime(), bytes).to_string())
    }

    /// Translate an image file and save the result.
    ///
    /// # Arguments
    ///
    /// * `input_path` - Path to the input image
    /// * `output_path` - Path to save the generated image (PNG or JPEG by extension)
    ///
    /// # Errors
    ///
    /// Returns an error if processing fails.
    pub fn process<P: AsRef<Path>, Q: AsRef<Path>>(&self, input_path: P, output_path: Q) -> Result<()> {
        let input_path = input_path.as_ref();
        let output_path = output_path.as_ref();

        tracing::info!("Processing image: {}", input_path.display());

        let img = image::load_image(input_path)?;
        let input = image::preprocess(&img);
        let output = self.translate(&input)?;

        tracing::info!("Saving output to: {}", output_path.display());
        image::save_image(&output, output_path, self.config.output_quality)?;

        Ok(())
    }
}
