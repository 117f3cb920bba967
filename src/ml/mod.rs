pub mod backbone;
pub mod vit_head;
pub mod ml_model;
pub mod scheduler;
pub mod persistence;
pub mod training;
pub mod inference;
pub mod evaluation;
pub mod export;

pub use ml_model::{default_class_names, TinyResVit, WeedClassifierConfig, CLASS_NAMES, IMAGE_SIZE};
pub use scheduler::ReduceOnPlateau;
pub use persistence::Precision;
pub use training::{train, TrainingOptions, TrainingSummary};
pub use inference::InferenceEngine;
pub use evaluation::{evaluate, EvaluationReport};
pub use export::{benchmark, export_model, BenchmarkResult, ExportReport};
