pub mod config;
pub mod labels;
#[cfg(feature = "ml")]
pub mod checkpoint;

pub use config::{AppConfig, DataSettings, DeviceType, ModelSettings, TrainingSettings};
pub use labels::{ClassNames, LabelFile, LabelProvider};
#[cfg(feature = "ml")]
pub use checkpoint::{
    load_checkpoint, load_metadata, load_weights, print_metadata_info, save_checkpoint,
    save_weights, Checkpoint, CheckpointMetadata,
};
