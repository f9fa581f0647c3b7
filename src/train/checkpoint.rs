//! Atomic checkpoint directories with a latest-pointer for resume.
//!
//! Every snapshot is staged in a `.tmp` sibling, fsynced, and renamed into
//! place, so a crash mid-write never leaves a checkpoint that resume could
//! mistake for a complete one. The checkpoint root is fsynced after each
//! rename so a published snapshot also survives power loss.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use candle_core::Tensor;
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};

use crate::config::TrainConfig;
use crate::error::TrainError;
use crate::model::SpeechEncoder;

pub(crate) const SCHEMA_VERSION: u32 = 1;

pub(crate) const MODEL_FILE: &str = "model.safetensors";
pub(crate) const ENCODER_FILE: &str = "encoder.safetensors";
pub(crate) const OPTIMIZER_FILE: &str = "optimizer.safetensors";
pub(crate) const STATE_FILE: &str = "state.json";
const LATEST_FILE: &str = "latest.json";

/// Training position and configuration captured alongside the weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct CheckpointState {
    pub(crate) schema_version: u32,
    pub(crate) epoch: usize,
    pub(crate) step: u64,
    pub(crate) step_in_epoch: usize,
    pub(crate) optimizer_steps: usize,
    pub(crate) written_at: String,
    pub(crate) config: TrainConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct LatestPointer {
    checkpoint: String,
}

pub(crate) struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    /// Creates `<output_dir>/checkpoints` and returns a store rooted there.
    pub(crate) fn new(output_dir: &Path) -> Result<Self, TrainError> {
        let root = output_dir.join("checkpoints");
        fs::create_dir_all(&root).map_err(|e| TrainError::io("creating checkpoint root", e))?;
        Ok(Self { root })
    }

    pub(crate) fn checkpoint_name(epoch: usize, step: u64) -> String {
        format!("epoch{epoch:04}-step{step:07}")
    }

    /// Writes one complete snapshot and repoints `latest.json` at it.
    pub(crate) fn save(
        &self,
        state: &CheckpointState,
        head: &VarMap,
        encoder: Option<&SpeechEncoder>,
        optimizer: &HashMap<String, Tensor>,
    ) -> Result<PathBuf, TrainError> {
        let name = Self::checkpoint_name(state.epoch, state.step);
        let final_dir = self.root.join(&name);
        let tmp_dir = self.root.join(format!("{name}.tmp"));
        if tmp_dir.exists() {
            fs::remove_dir_all(&tmp_dir)
                .map_err(|e| TrainError::io("clearing stale checkpoint staging", e))?;
        }
        fs::create_dir_all(&tmp_dir)
            .map_err(|e| TrainError::io("creating checkpoint staging", e))?;

        head.save(tmp_dir.join(MODEL_FILE))
            .map_err(|e| TrainError::runtime("writing alignment weights", e))?;
        if let Some(speech) = encoder {
            speech
                .save_vars(&tmp_dir.join(ENCODER_FILE))
                .map_err(|e| TrainError::runtime("writing encoder weights", e))?;
        }
        candle_core::safetensors::save(optimizer, tmp_dir.join(OPTIMIZER_FILE))
            .map_err(|e| TrainError::runtime("writing optimizer state", e))?;

        let encoded = serde_json::to_vec_pretty(state)
            .map_err(|e| TrainError::json("encoding checkpoint state", e))?;
        write_synced(&tmp_dir.join(STATE_FILE), &encoded)?;
        sync_directory_files(&tmp_dir)?;
        sync_dir(&tmp_dir)?;

        if final_dir.exists() {
            fs::remove_dir_all(&final_dir)
                .map_err(|e| TrainError::io("clearing superseded checkpoint", e))?;
        }
        fs::rename(&tmp_dir, &final_dir)
            .map_err(|e| TrainError::io("publishing checkpoint", e))?;
        // The snapshot rename must be durable before latest.json can name
        // it, or the pointer could outlive the directory it points at.
        sync_dir(&self.root)?;

        let pointer = LatestPointer { checkpoint: name };
        let encoded = serde_json::to_vec_pretty(&pointer)
            .map_err(|e| TrainError::json("encoding latest pointer", e))?;
        let pointer_tmp = self.root.join(format!("{LATEST_FILE}.tmp"));
        write_synced(&pointer_tmp, &encoded)?;
        fs::rename(&pointer_tmp, self.root.join(LATEST_FILE))
            .map_err(|e| TrainError::io("publishing latest pointer", e))?;
        sync_dir(&self.root)?;

        tracing::info!(
            checkpoint = %final_dir.display(),
            epoch = state.epoch,
            step = state.step,
            "checkpoint written"
        );
        Ok(final_dir)
    }

    /// Directory named by `latest.json`, or `CheckpointMismatch` when no
    /// checkpoint has been written under this output directory yet.
    pub(crate) fn resolve_latest(&self) -> Result<PathBuf, TrainError> {
        let pointer_path = self.root.join(LATEST_FILE);
        let raw = fs::read(&pointer_path).map_err(|e| {
            TrainError::checkpoint_mismatch(
                &pointer_path,
                format!("no latest checkpoint recorded ({e})"),
            )
        })?;
        let pointer: LatestPointer = serde_json::from_slice(&raw)
            .map_err(|e| TrainError::checkpoint_mismatch(&pointer_path, e))?;
        let dir = self.root.join(&pointer.checkpoint);
        if !dir.is_dir() {
            return Err(TrainError::checkpoint_mismatch(
                dir,
                "latest pointer references a missing checkpoint directory",
            ));
        }
        Ok(dir)
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<(), TrainError> {
    let mut file =
        File::create(path).map_err(|e| TrainError::io("creating checkpoint file", e))?;
    file.write_all(bytes)
        .map_err(|e| TrainError::io("writing checkpoint file", e))?;
    file.sync_all()
        .map_err(|e| TrainError::io("syncing checkpoint file", e))?;
    Ok(())
}

fn sync_directory_files(dir: &Path) -> Result<(), TrainError> {
    let entries =
        fs::read_dir(dir).map_err(|e| TrainError::io("listing checkpoint staging", e))?;
    for entry in entries {
        let entry = entry.map_err(|e| TrainError::io("listing checkpoint staging", e))?;
        let file = File::open(entry.path())
            .map_err(|e| TrainError::io("opening checkpoint file for sync", e))?;
        file.sync_all()
            .map_err(|e| TrainError::io("syncing checkpoint file", e))?;
    }
    Ok(())
}

/// Fsyncs a directory so renames and entry creations inside it are durable.
fn sync_dir(dir: &Path) -> Result<(), TrainError> {
    File::open(dir)
        .map_err(|e| TrainError::io("opening checkpoint directory for sync", e))?
        .sync_all()
        .map_err(|e| TrainError::io("syncing checkpoint directory", e))?;
    Ok(())
}

pub(crate) fn model_file(dir: &Path) -> PathBuf {
    dir.join(MODEL_FILE)
}

pub(crate) fn encoder_file(dir: &Path) -> PathBuf {
    dir.join(ENCODER_FILE)
}

pub(crate) fn optimizer_file(dir: &Path) -> PathBuf {
    dir.join(OPTIMIZER_FILE)
}

/// Reads and schema-checks `state.json` from a checkpoint directory.
pub(crate) fn read_state(dir: &Path) -> Result<CheckpointState, TrainError> {
    let path = dir.join(STATE_FILE);
    let raw = fs::read(&path).map_err(|e| TrainError::checkpoint_mismatch(&path, e))?;
    let state: CheckpointState =
        serde_json::from_slice(&raw).map_err(|e| TrainError::checkpoint_mismatch(&path, e))?;
    if state.schema_version != SCHEMA_VERSION {
        return Err(TrainError::checkpoint_mismatch(
            path,
            format!(
                "unsupported schema version {} (expected {SCHEMA_VERSION})",
                state.schema_version
            ),
        ));
    }
    Ok(state)
}

/// Rejects resumes whose architecture-relevant configuration differs from
/// the checkpointed one. Run-length fields may change freely.
pub(crate) fn validate_compatible(
    dir: &Path,
    saved: &TrainConfig,
    current: &TrainConfig,
) -> Result<(), TrainError> {
    let mismatch = |field: &str, saved: String, current: String| {
        TrainError::checkpoint_mismatch(
            dir,
            format!("{field} differs between checkpoint ({saved}) and configuration ({current})"),
        )
    };
    if saved.fine_tune_encoder != current.fine_tune_encoder {
        return Err(mismatch(
            "fine_tune_encoder",
            saved.fine_tune_encoder.to_string(),
            current.fine_tune_encoder.to_string(),
        ));
    }
    if saved.embed_dim != current.embed_dim {
        return Err(mismatch(
            "embed_dim",
            saved.embed_dim.to_string(),
            current.embed_dim.to_string(),
        ));
    }
    if saved.audio_pooling != current.audio_pooling {
        return Err(mismatch(
            "audio_pooling",
            format!("{:?}", saved.audio_pooling),
            format!("{:?}", current.audio_pooling),
        ));
    }
    if saved.freeze_feature_extractor != current.freeze_feature_extractor {
        return Err(mismatch(
            "freeze_feature_extractor",
            saved.freeze_feature_extractor.to_string(),
            current.freeze_feature_extractor.to_string(),
        ));
    }
    if saved.freeze_encoder_layers != current.freeze_encoder_layers {
        return Err(mismatch(
            "freeze_encoder_layers",
            format!("{:?}", saved.freeze_encoder_layers),
            format!("{:?}", current.freeze_encoder_layers),
        ));
    }
    Ok(())
}
