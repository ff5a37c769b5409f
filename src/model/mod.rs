//! The pix2pix generator: architecture table, stages, checkpoints.

mod architecture;
mod checkpoint;
mod generator;
mod ops;
mod stage;

pub use architecture::{
    decoder_resolution, encoder_resolution, Architecture, SkipTable, StagePlan, DECODER_DEPTH,
    DEFAULT_BASE_FILTERS, ENCODER_DEPTH,
};
pub use checkpoint::{Checkpoint, CheckpointLocation};
pub use generator::Generator;
pub use ops::FeatureMap;
pub use stage::{Mode, Stage};
