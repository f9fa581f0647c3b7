use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrainError {
    #[error("invalid configuration: {message}")]
    ConfigInvalid { message: String },
    #[error("corrupt corpus entry '{clip_id}': {reason}")]
    CorruptCorpus { clip_id: String, reason: String },
    #[error("missing file for clip '{clip_id}': {path}")]
    MissingFile { clip_id: String, path: PathBuf },
    #[error("incompatible pretrained weights at '{path}': {reason}")]
    IncompatibleWeights { path: PathBuf, reason: String },
    #[error("checkpoint at '{path}' does not match the current run: {reason}")]
    CheckpointMismatch { path: PathBuf, reason: String },
    #[error("training diverged at step {step}: loss = {loss}")]
    Diverged { step: u64, loss: f64 },
    #[error("I/O error while {context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("JSON parse error while {context}: {source}")]
    Json {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("{context}: {message}")]
    Runtime {
        context: &'static str,
        message: String,
    },
}

impl TrainError {
    pub(crate) fn config_invalid(message: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            message: message.into(),
        }
    }

    pub(crate) fn corrupt_corpus(clip_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CorruptCorpus {
            clip_id: clip_id.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn missing_file(clip_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::MissingFile {
            clip_id: clip_id.into(),
            path: path.into(),
        }
    }

    pub(crate) fn incompatible_weights(
        path: impl Into<PathBuf>,
        reason: impl std::fmt::Display,
    ) -> Self {
        Self::IncompatibleWeights {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn checkpoint_mismatch(
        path: impl Into<PathBuf>,
        reason: impl std::fmt::Display,
    ) -> Self {
        Self::CheckpointMismatch {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }

    pub(crate) fn json(context: &'static str, source: serde_json::Error) -> Self {
        Self::Json { context, source }
    }

    pub(crate) fn runtime(context: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Runtime {
            context,
            message: err.to_string(),
        }
    }
}
