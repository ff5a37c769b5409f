//! # `pix2pix`
//!
//! Sketch-to-image translation with a pix2pix U-Net generator.
//!
//! A [`Predictor`] restores a trained [`Generator`] from a checkpoint once,
//! then turns sketches into images: decode, resize to 256x256, normalize,
//! run the encoder/decoder with skip connections, denormalize, encode.
//! The [`server`] module exposes the same call as `POST /predict`.
//!
//! ## Example
//!
//! ```no_run
//! use pix2pix::{Config, Predictor};
//!
//! # fn main() -> pix2pix::Result<()> {
//! let predictor = Predictor::new(Config::default())?;
//!
//! predictor.process("sketch.png", "photo.png")?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod image;
pub mod model;
pub mod pipeline;
pub mod server;

pub use error::{Error, Result};
pub use model::{Architecture, CheckpointLocation, Generator, Mode};
pub use pipeline::{Config, DataUrl, Predictor};
