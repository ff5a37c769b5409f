//! Image decoding, preprocessing, postprocessing and encoding.
//!
//! The network consumes and produces [`ImageTensor`]s in `(height, width, channels)`
//! layout with values in `[-1, 1]`. Everything outside the network speaks 8-bit RGB.

mod load;
mod save;

pub use load::{decode_image, load_image, normalize, preprocess};
pub use save::{denormalize, encode_image, postprocess, save_image, OutputFormat};

use ndarray::Array3;

/// Image tensor in HWC format (height, width, channels).
/// Values are normalized to [-1, 1] while inside the generator.
pub type ImageTensor = Array3<f32>;

/// Side length of the square resolution the generator was trained at.
pub const IMAGE_SIZE: u32 = 256;

/// Number of channels in RGB images.
pub const RGB_CHANNELS: usize = 3;
