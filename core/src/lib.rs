pub mod error;
pub mod config;
pub mod tensor;
pub mod conv1d;
pub mod stage;
pub mod model;
pub mod loss;
pub mod adam;
pub mod dataset;
pub mod batch;
pub mod checkpoint;
pub mod trainer;
pub mod predict;

pub use error::{Result, SegError};
pub use config::{Device, ModelConfig, TrainConfig};
pub use model::MultiStageModel;
pub use dataset::{ClassMap, DiskSource, ExampleSource, MemorySource};
pub use batch::{Batch, BatchAssembler, IGNORE_INDEX};
pub use checkpoint::CheckpointStore;
pub use trainer::{EpochReport, SplitStats, Trainer};
pub use predict::Predictor;
