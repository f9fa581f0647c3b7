pub mod config;
pub mod corpus;
pub mod error;
pub mod model;
pub mod train;
pub mod types;

pub use config::{AudioPooling, Objective, TrainConfig};
pub use corpus::{BatchSampler, ClipStore};
pub use error::TrainError;
pub use model::{AlignmentModel, SpeechEncoder};
pub use train::{EvalReport, RunOutcome, Trainer};
pub use types::{Batch, BatchTensors, Clip, Split};
