pub mod augment;
pub mod weed_dataset;
#[cfg(feature = "ml")]
pub mod batcher;

pub use augment::{Transform, IMAGENET_MEAN, IMAGENET_STD};
pub use weed_dataset::{
    partition_directory, stratified_split, Partition, SplitOptions, WeedDataset,
    DEFAULT_SEED, DEFAULT_VAL_SPLIT,
};
#[cfg(feature = "ml")]
pub use batcher::{WeedBatch, WeedBatcher};
