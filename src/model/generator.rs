//! The U-Net generator: encoder stack, decoder stack with skip links, output head.

use std::path::Path;

use rand::RngCore;

use crate::error::{Error, Result};
use crate::image::{ImageTensor, IMAGE_SIZE, RGB_CHANNELS};

use super::architecture::{Architecture, DECODER_DEPTH, ENCODER_DEPTH};
use super::checkpoint::Checkpoint;
use super::ops::{self, FeatureMap};
use super::stage::{Regime, Stage};

/// An immutable, fully restored generator.
///
/// Built once at startup and shared by reference; forward passes never
/// mutate it, so concurrent calls need no locking.
#[derive(Debug, Clone, PartialEq)]
pub struct Generator {
    architecture: Architecture,
    encoder: Vec<Stage>,
    decoder: Vec<Stage>,
    head: Stage,
}

impl Generator {
    /// Restore a generator from a checkpoint file.
    ///
    /// Loading is all-or-nothing: any missing or mis-shaped parameter fails
    /// the whole restore.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is absent, unreadable, or does not match
    /// the architecture.
    pub fn restore<P: AsRef<Path>>(architecture: Architecture, path: P) -> Result<Self> {
        let path = path.as_ref();
        tracing::info!("Restoring generator from {}", path.display());

        let checkpoint = Checkpoint::read(path)?;
        let generator = Self::from_checkpoint(architecture, checkpoint)?;

        tracing::info!(
            "Generator restored: {} parameters, base width {}",
            architecture.parameter_count(),
            architecture.base_filters()
        );

        Ok(generator)
    }

    /// Build a generator from in-memory parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if any parameter the architecture needs is missing or
    /// has the wrong shape.
    pub fn from_checkpoint(architecture: Architecture, mut checkpoint: Checkpoint) -> Result<Self> {
        let encoder = architecture
            .encoder_plan()
            .iter()
            .enumerate()
            .map(|(i, plan)| Stage::load_down(&mut checkpoint, &encoder_prefix(i), plan))
            .collect::<Result<Vec<_>>>()?;

        let decoder = architecture
            .decoder_plan()
            .iter()
            .enumerate()
            .map(|(i, plan)| Stage::load_up(&mut checkpoint, &decoder_prefix(i), plan))
            .collect::<Result<Vec<_>>>()?;

        let head = Stage::load_head(&mut checkpoint, HEAD_PREFIX, &architecture.head_plan())?;

        if !checkpoint.is_empty() {
            tracing::warn!(
                "Ignoring {} checkpoint entries the generator does not use: {:?}",
                checkpoint.len(),
                checkpoint.names()
            );
        }

        Self::assemble(architecture, encoder, decoder, head)
    }

    /// Build a generator with freshly initialized weights.
    ///
    /// Kernels are drawn from N(0, 0.02); normalization starts as the identity.
    ///
    /// # Errors
    ///
    /// Returns an error if the stages cannot be assembled.
    pub fn initialized(architecture: Architecture, rng: &mut dyn RngCore) -> Result<Self> {
        let encoder = architecture
            .encoder_plan()
            .iter()
            .map(|plan| Stage::init_down(plan, &mut *rng))
            .collect::<Result<Vec<_>>>()?;

        let decoder = architecture
            .decoder_plan()
            .iter()
            .map(|plan| Stage::init_up(plan, &mut *rng))
            .collect::<Result<Vec<_>>>()?;

        let head = Stage::init_head(&architecture.head_plan(), rng)?;

        Self::assemble(architecture, encoder, decoder, head)
    }

    /// Check the stage chain against the architecture and skip table.
    fn assemble(
        architecture: Architecture,
        encoder: Vec<Stage>,
        decoder: Vec<Stage>,
        head: Stage,
    ) -> Result<Self> {
        if encoder.len() != ENCODER_DEPTH || decoder.len() != DECODER_DEPTH {
            return Err(Error::Architecture {
                reason: format!(
                    "expected {ENCODER_DEPTH} encoder and {DECODER_DEPTH} decoder stages, got {} and {}",
                    encoder.len(),
                    decoder.len()
                ),
            });
        }

        let mut channels = RGB_CHANNELS;
        for (i, stage) in encoder.iter().enumerate() {
            check_input(&format!("encoder stage {i}"), stage, channels)?;
            channels = stage.out_channels();
        }
        for (i, stage) in decoder.iter().enumerate() {
            check_input(&format!("decoder stage {i}"), stage, channels)?;
            let skip = &encoder[architecture.skips().source(i)];
            channels = stage.out_channels() + skip.out_channels();
        }
        check_input("output head", &head, channels)?;

        if head.out_channels() != RGB_CHANNELS {
            return Err(Error::Architecture {
                reason: format!("output head produces {} channels", head.out_channels()),
            });
        }

        Ok(Self {
            architecture,
            encoder,
            decoder,
            head,
        })
    }

    #[must_use]
    pub const fn architecture(&self) -> &Architecture {
        &self.architecture
    }

    /// All parameters in checkpoint form.
    ///
    /// # Errors
    ///
    /// Returns an error if a kernel cannot be reshaped into checkpoint layout.
    pub fn to_checkpoint(&self) -> Result<Checkpoint> {
        let mut checkpoint = Checkpoint::new();
        for (i, stage) in self.encoder.iter().enumerate() {
            stage.export(&mut checkpoint, &encoder_prefix(i))?;
        }
        for (i, stage) in self.decoder.iter().enumerate() {
            stage.export(&mut checkpoint, &decoder_prefix(i))?;
        }
        self.head.export(&mut checkpoint, HEAD_PREFIX)?;
        Ok(checkpoint)
    }

    /// Write all parameters to a checkpoint file.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.to_checkpoint()?.write(path)?;
        tracing::info!("Saved generator checkpoint to {}", path.display());
        Ok(())
    }

    /// Translate a `(256, 256, 3)` tensor in evaluation mode. Deterministic.
    ///
    /// # Errors
    ///
    /// Returns an error if the input has the wrong shape or the network
    /// wiring is violated.
    pub fn generate(&self, input: &ImageTensor) -> Result<ImageTensor> {
        self.forward(input, &mut Regime::Evaluation)
    }

    /// Translate in training mode: per-call normalization statistics and
    /// dropout driven by `rng`.
    ///
    /// # Errors
    ///
    /// Same as [`Generator::generate`].
    pub fn generate_training(&self, input: &ImageTensor, rng: &mut dyn RngCore) -> Result<ImageTensor> {
        self.forward(input, &mut Regime::Training(rng))
    }

    fn forward(&self, input: &ImageTensor, regime: &mut Regime<'_>) -> Result<ImageTensor> {
        let size = IMAGE_SIZE as usize;
        if input.dim() != (size, size, RGB_CHANNELS) {
            return Err(Error::ShapeMismatch {
                expected: format!("({size}, {size}, {RGB_CHANNELS})"),
                actual: format!("{:?}", input.dim()),
            });
        }

        let mut encoded: Vec<FeatureMap> = Vec::with_capacity(ENCODER_DEPTH);
        for (i, stage) in self.encoder.iter().enumerate() {
            let source = encoded.last().unwrap_or(input);
            let output = stage.forward(source, regime)?;
            tracing::trace!("encoder stage {i}: {:?}", output.dim());
            encoded.push(output);
        }

        let mut x = encoded.pop().ok_or_else(|| Error::Architecture {
            reason: "encoder produced no features".to_string(),
        })?;

        for (i, stage) in self.decoder.iter().enumerate() {
            let upsampled = stage.forward(&x, regime)?;
            let skip = &encoded[self.architecture.skips().source(i)];
            x = ops::concat_channels(&upsampled, skip).inspect_err(|err| {
                tracing::error!("decoder stage {i}: {err}");
            })?;
            tracing::trace!("decoder stage {i}: {:?}", x.dim());
        }

        self.head.forward(&x, regime)
    }
}

const HEAD_PREFIX: &str = "head";

fn encoder_prefix(index: usize) -> String {
    format!("encoder.{index}")
}

fn decoder_prefix(index: usize) -> String {
    format!("decoder.{index}")
}

fn check_input(name: &str, stage: &Stage, channels: usize) -> Result<()> {
    if stage.in_channels() == channels {
        Ok(())
    } else {
        Err(Error::Architecture {
            reason: format!(
                "{name} consumes {} channels but receives {channels}",
                stage.in_channels()
            ),
        })
    }
}
