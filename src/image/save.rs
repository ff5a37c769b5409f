//! Postprocessing, raster encoding and saving.

use std::path::Path;

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{Rgb, RgbImage};

use crate::error::{Error, Result};

use super::{ImageTensor, RGB_CHANNELS};

/// Compressed raster format used for generator output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Lossless PNG.
    #[default]
    Png,
    /// Lossy JPEG.
    Jpeg,
}

impl OutputFormat {
    /// Mime type declared in data URLs for this format.
    #[must_use]
    pub const fn mime(&self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
        }
    }

    /// Short human-readable name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpeg",
        }
    }

    /// Pick a format from a file extension, defaulting to PNG.
    #[must_use]
    pub fn from_path(path: &Path) -> Self {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("png")
            .to_lowercase();

        match extension.as_str() {
            "jpg" | "jpeg" => Self::Jpeg,
            _ => Self::Png,
        }
    }
}

/// Convert a normalized HWC tensor to an RGB image.
///
/// # Errors
///
/// Returns [`Error::ShapeMismatch`] if the tensor does not have 3 channels.
#[allow(clippy::cast_possible_truncation)]
pub fn postprocess(tensor: &ImageTensor) -> Result<RgbImage> {
    let (height, width, channels) = tensor.dim();

    if channels != RGB_CHANNELS {
        return Err(Error::ShapeMismatch {
            expected: format!("{RGB_CHANNELS} channels"),
            actual: format!("{channels} channels"),
        });
    }

    // Safe: generator output is 256x256 which fits in u32
    let img = RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let (x, y) = (x as usize, y as usize);
        Rgb([
            denormalize(tensor[[y, x, 0]]),
            denormalize(tensor[[y, x, 1]]),
            denormalize(tensor[[y, x, 2]]),
        ])
    });

    Ok(img)
}

/// Encode an RGB image into compressed raster bytes.
///
/// `quality` (1-100) only applies to JPEG.
///
/// # Errors
///
/// Returns an error if the encoder fails.
pub fn encode_image(img: &RgbImage, format: OutputFormat, quality: u8) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();

    let written = match format {
        OutputFormat::Png => img.write_with_encoder(PngEncoder::new(&mut buffer)),
        OutputFormat::Jpeg => {
            img.write_with_encoder(JpegEncoder::new_with_quality(&mut buffer, quality))
        }
    };

    written.map_err(|source| Error::ImageEncode {
        format: format.name(),
        source,
    })?;

    Ok(buffer)
}

/// Save a tensor as an image file.
///
/// The format is inferred from the extension; `quality` only applies to JPEG.
///
/// # Errors
///
/// Returns an error if the image cannot be encoded or written.
pub fn save_image<P: AsRef<Path>>(tensor: &ImageTensor, path: P, quality: u8) -> Result<()> {
    let path = path.as_ref();

    let img = postprocess(tensor)?;
    let format = OutputFormat::from_path(path);

    let bytes = encode_image(&img, format, quality).map_err(|err| match err {
        Error::ImageEncode { source, .. } => Error::ImageSave {
            path: path.to_path_buf(),
            source,
        },
        other => other,
    })?;

    std::fs::write(path, bytes)?;

    Ok(())
}

/// Denormalize a value from [-1, 1] to [0, 255] with rounding and clamping.
#[inline]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
#[must_use]
pub fn denormalize(value: f32) -> u8 {
    // Safe: clamped to [0, 255] range before casting
    let scaled = (value + 1.0) * 127.5;
    scaled.round().clamp(0.0, 255.0) as u8
}
