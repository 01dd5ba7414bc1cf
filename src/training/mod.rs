pub mod artifact;
pub mod cv;
pub mod dataset;
pub mod metrics;
pub mod model;
pub mod model_cache;
pub mod service;

pub use artifact::ModelArtifact;
pub use dataset::{build_dataset, Dataset, Sample};
pub use model::TrainedModel;
pub use model_cache::{LoadedModel, ModelCache};
pub use service::{LabelTarget, TrainingOutcome, TrainingService, FEATURE_ORDER};
