pub(crate) mod checkpoint;
pub(crate) mod metrics;
pub(crate) mod optim;
pub mod trainer;

pub use metrics::EvalReport;
pub use trainer::{RunOutcome, Trainer};
