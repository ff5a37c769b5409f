//! Image-to-image prediction pipeline.

mod data_url;
mod predictor;

pub use data_url::DataUrl;
pub use predictor::{Config, Predictor};
