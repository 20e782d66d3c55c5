pub mod ml_model;
pub mod augment;
pub mod training;
pub mod inference;

pub use ml_model::{MathSymbolCnn, ModelConfig};
pub use training::{
    checkpoint_path, save_all, train, EpochReport, Evaluation, SavedArtifacts, TrainingPhase,
    TrainingReport,
};
pub use inference::{load_classifier, InferenceEngine};
