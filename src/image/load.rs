//! Image decoding and preprocessing.

use std::path::Path;

use image::{imageops::FilterType, DynamicImage};
use ndarray::Array3;

use crate::error::{Error, Result};

use super::{ImageTensor, IMAGE_SIZE, RGB_CHANNELS};

/// Decode raster bytes (PNG, JPEG, ...) into an image.
///
/// # Errors
///
/// Returns [`Error::ImageDecode`] if the bytes are not a supported raster format.
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage> {
    image::load_from_memory(bytes).map_err(|source| Error::ImageDecode { source })
}

/// Load an image from disk.
///
/// # Errors
///
/// Returns an error if the file cannot be read or decoded.
pub fn load_image<P: AsRef<Path>>(path: P) -> Result<DynamicImage> {
    let path = path.as_ref();

    image::open(path).map_err(|source| Error::ImageLoad {
        path: path.to_path_buf(),
        source,
    })
}

/// Convert an image of any size and color mode to the generator's input tensor.
///
/// The image is:
/// 1. Forced to 3-channel RGB (grayscale and alpha inputs included)
/// 2. Resized to 256x256 with nearest-neighbor sampling, matching the training data
/// 3. Normalized from [0, 255] to [-1, 1]
///
/// The result has shape `(256, 256, 3)`.
#[allow(clippy::cast_possible_truncation)]
#[must_use]
pub fn preprocess(img: &DynamicImage) -> ImageTensor {
    let rgb = img.to_rgb8();
    let resized = image::imageops::resize(&rgb, IMAGE_SIZE, IMAGE_SIZE, FilterType::Nearest);

    let size = IMAGE_SIZE as usize;

    Array3::from_shape_fn((size, size, RGB_CHANNELS), |(y, x, c)| {
        // Safe: x and y are bounded by IMAGE_SIZE (256) which fits in u32
        normalize(resized.get_pixel(x as u32, y as u32)[c])
    })
}

/// Map a channel value from [0, 255] to [-1, 1].
#[inline]
#[must_use]
pub fn normalize(value: u8) -> f32 {
    (f32::from(value) / 127.5) - 1.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma, Rgb, RgbImage};

    #[test]
    fn test_tensor_shape() {
        let img = DynamicImage::new_rgb8(100, 37);
        let tensor = preprocess(&img);

        assert_eq!(tensor.shape(), &[256, 256, 3]);
    }

    #[test]
    fn test_large_input_is_downsampled() {
        let img = DynamicImage::new_rgb8(1024, 512);
        let tensor = preprocess(&img);

        assert_eq!(tensor.shape(), &[256, 256, 3]);
    }

    #[test]
    fn test_normalization_range() {
        let img = DynamicImage::new_rgb8(100, 100);
        let tensor = preprocess(&img);

        // Black image should be all -1.0
        assert!(tensor.iter().all(|&v| (v - (-1.0)).abs() < 1e-6));

        let white = DynamicImage::ImageRgb8(RgbImage::from_pixel(10, 10, Rgb([255, 255, 255])));
        let tensor = preprocess(&white);
        assert!(tensor.iter().all(|&v| (v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_grayscale_is_expanded_to_rgb() {
        let gray = DynamicImage::ImageLuma8(GrayImage::from_pixel(64, 64, Luma([51])));
        let tensor = preprocess(&gray);

        assert_eq!(tensor.shape(), &[256, 256, 3]);
        let expected = normalize(51);
        assert!(tensor.iter().all(|&v| (v - expected).abs() < 1e-6));
    }

    #[test]
    fn test_nearest_neighbor_keeps_hard_edges() {
        // Left half black, right half white: no intermediate values may appear.
        let img = RgbImage::from_fn(32, 32, |x, _| {
            if x < 16 {
                Rgb([0, 0, 0])
            } else {
                Rgb([255, 255, 255])
            }
        });
        let tensor = preprocess(&DynamicImage::ImageRgb8(img));

        assert!(tensor
            .iter()
            .all(|&v| (v + 1.0).abs() < 1e-6 || (v - 1.0).abs() < 1e-6));
        assert!((tensor[[0, 0, 0]] + 1.0).abs() < 1e-6);
        assert!((tensor[[0, 255, 0]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = decode_image(b"definitely not a png").unwrap_err();
        assert!(matches!(err, Error::ImageDecode { .. }));
    }
}
