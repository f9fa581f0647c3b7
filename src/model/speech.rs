//! Loads the pretrained speech encoder and runs waveform batches through
//! it, either as a frozen feature source or as a fine-tunable module.

use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};

use crate::config::{TrainConfig, Wav2Vec2ModelConfig};
use crate::error::TrainError;
use crate::model::encoder::Encoder;
use crate::model::feature_extractor::FeatureExtractor;
use crate::model::feature_projection::FeatureProjection;

/// Root prefix of every tensor name in published wav2vec2 exports.
const WEIGHT_ROOT: &str = "wav2vec2";

/// Sample rate published wav2vec2 checkpoints are trained at; used to report
/// the encoder's frame stride in time units.
const PRETRAIN_SAMPLE_RATE_HZ: u32 = 16_000;

pub struct SpeechEncoder {
    feature_extractor: FeatureExtractor,
    feature_projection: FeatureProjection,
    encoder: Encoder,
    hidden_size: usize,
    /// Present iff fine-tuning; holds every encoder parameter as a var.
    vars: Option<VarMap>,
    /// Name-sorted subset of `vars` the optimizer may update.
    trainable: Vec<(String, Var)>,
}

impl SpeechEncoder {
    /// Loads pretrained weights. `weights_path` is either the safetensors
    /// file itself (a sibling `config.json` is expected) or a model
    /// directory holding `model.safetensors` and `config.json`. Every load
    /// failure surfaces as `IncompatibleWeights` naming the artifact.
    pub fn load(config: &TrainConfig, device: &Device) -> Result<Self, TrainError> {
        let (weights_file, config_file) = locate_artifacts(&config.weights_path);
        let model_config = Wav2Vec2ModelConfig::load(&config_file)?;
        validate_geometry(&model_config, &weights_file)?;

        if config.fine_tune_encoder {
            Self::load_fine_tunable(config, &model_config, &weights_file, device)
        } else {
            Self::load_frozen(&model_config, &weights_file, device)
        }
    }

    fn load_frozen(
        model_config: &Wav2Vec2ModelConfig,
        weights_file: &Path,
        device: &Device,
    ) -> Result<Self, TrainError> {
        let data = std::fs::read(weights_file).map_err(|e| {
            TrainError::incompatible_weights(weights_file, format!("unreadable weights: {e}"))
        })?;
        let vb = VarBuilder::from_buffered_safetensors(data, DType::F32, device)
            .map_err(|e| TrainError::incompatible_weights(weights_file, e))?;
        let (feature_extractor, feature_projection, encoder) = build_modules(model_config, vb)
            .map_err(|e| TrainError::incompatible_weights(weights_file, e))?;
        tracing::info!(
            hidden_size = model_config.hidden_size,
            layers = model_config.num_hidden_layers,
            frame_stride_ms = model_config.frame_stride_ms(PRETRAIN_SAMPLE_RATE_HZ),
            mode = "frozen",
            "speech encoder loaded"
        );
        Ok(Self {
            feature_extractor,
            feature_projection,
            encoder,
            hidden_size: model_config.hidden_size,
            vars: None,
            trainable: Vec::new(),
        })
    }

    fn load_fine_tunable(
        config: &TrainConfig,
        model_config: &Wav2Vec2ModelConfig,
        weights_file: &Path,
        device: &Device,
    ) -> Result<Self, TrainError> {
        if let Some(frozen) = config.freeze_encoder_layers {
            if frozen > model_config.num_hidden_layers {
                return Err(TrainError::config_invalid(format!(
                    "freeze_encoder_layers = {frozen} exceeds the model's {} transformer layers",
                    model_config.num_hidden_layers
                )));
            }
        }

        let mut vars = VarMap::new();
        let vb = VarBuilder::from_varmap(&vars, DType::F32, device);
        let (feature_extractor, feature_projection, encoder) = build_modules(model_config, vb)
            .map_err(|e| TrainError::incompatible_weights(weights_file, e))?;
        // The var map now knows every parameter name; fill in the
        // pretrained values.
        vars.load(weights_file)
            .map_err(|e| TrainError::incompatible_weights(weights_file, e))?;

        let trainable = trainable_slots(&vars, config);
        tracing::info!(
            hidden_size = model_config.hidden_size,
            layers = model_config.num_hidden_layers,
            frame_stride_ms = model_config.frame_stride_ms(PRETRAIN_SAMPLE_RATE_HZ),
            trainable_tensors = trainable.len(),
            mode = "fine-tune",
            "speech encoder loaded"
        );
        Ok(Self {
            feature_extractor,
            feature_projection,
            encoder,
            hidden_size: model_config.hidden_size,
            vars: Some(vars),
            trainable,
        })
    }

    /// `(batch, samples)` waveform in, `(batch, frames, hidden)` frame
    /// features out. Frozen mode detaches the output, so gradients stop at
    /// the alignment head.
    pub fn encode(&self, audio: &Tensor) -> candle_core::Result<Tensor> {
        let h = self.feature_extractor.forward(&audio.unsqueeze(1)?)?;
        let h = self.feature_projection.forward(&h.transpose(1, 2)?.contiguous()?)?;
        let h = self.encoder.forward(&h)?;
        if self.vars.is_some() {
            Ok(h)
        } else {
            Ok(h.detach())
        }
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    pub fn is_fine_tune(&self) -> bool {
        self.vars.is_some()
    }

    /// Optimizer slots: empty when frozen, name-sorted when fine-tuning.
    pub(crate) fn trainable(&self) -> &[(String, Var)] {
        &self.trainable
    }

    /// Writes all encoder parameters (trainable or not) to a safetensors
    /// file. Only meaningful in fine-tune mode.
    pub(crate) fn save_vars(&self, path: &Path) -> candle_core::Result<()> {
        match &self.vars {
            Some(vars) => vars.save(path),
            None => Err(candle_core::Error::Msg(
                "speech encoder is frozen; nothing to save".to_string(),
            )),
        }
    }

    /// Overwrites encoder parameters from a safetensors file written by
    /// `save_vars`.
    pub(crate) fn restore_vars(&mut self, path: &Path) -> candle_core::Result<()> {
        match self.vars.as_mut() {
            Some(vars) => vars.load(path),
            None => Err(candle_core::Error::Msg(
                "speech encoder is frozen; nothing to restore".to_string(),
            )),
        }
    }
}

fn locate_artifacts(weights_path: &Path) -> (PathBuf, PathBuf) {
    if weights_path.is_dir() {
        (
            weights_path.join("model.safetensors"),
            weights_path.join("config.json"),
        )
    } else {
        let parent = weights_path.parent().unwrap_or_else(|| Path::new("."));
        (weights_path.to_path_buf(), parent.join("config.json"))
    }
}

fn validate_geometry(
    model_config: &Wav2Vec2ModelConfig,
    weights_file: &Path,
) -> Result<(), TrainError> {
    let dims = model_config.conv_dim.len();
    if dims == 0 || model_config.conv_kernel.len() != dims || model_config.conv_stride.len() != dims
    {
        return Err(TrainError::incompatible_weights(
            weights_file,
            format!(
                "conv geometry arrays disagree: {dims} dims, {} kernels, {} strides",
                model_config.conv_kernel.len(),
                model_config.conv_stride.len()
            ),
        ));
    }
    if model_config.num_attention_heads == 0
        || model_config.hidden_size % model_config.num_attention_heads != 0
    {
        return Err(TrainError::incompatible_weights(
            weights_file,
            format!(
                "hidden size {} does not divide into {} attention heads",
                model_config.hidden_size, model_config.num_attention_heads
            ),
        ));
    }
    Ok(())
}

fn build_modules(
    cfg: &Wav2Vec2ModelConfig,
    vb: VarBuilder,
) -> candle_core::Result<(FeatureExtractor, FeatureProjection, Encoder)> {
    let root = vb.pp(WEIGHT_ROOT);
    Ok((
        FeatureExtractor::load(cfg, root.pp("feature_extractor"))?,
        FeatureProjection::load(cfg, root.pp("feature_projection"))?,
        Encoder::load(cfg, root.pp("encoder"))?,
    ))
}

fn trainable_slots(vars: &VarMap, config: &TrainConfig) -> Vec<(String, Var)> {
    let frozen_layers = config.freeze_encoder_layers.unwrap_or(0);
    let data = vars.data().lock().unwrap();
    let mut slots: Vec<(String, Var)> = data
        .iter()
        .filter(|(name, _)| {
            if config.freeze_feature_extractor
                && name.starts_with("wav2vec2.feature_extractor.")
            {
                return false;
            }
            if let Some(rest) = name.strip_prefix("wav2vec2.encoder.layers.") {
                let index = rest.split('.').next().and_then(|s| s.parse::<usize>().ok());
                if matches!(index, Some(i) if i < frozen_layers) {
                    return false;
                }
            }
            true
        })
        .map(|(name, var)| (name.clone(), var.clone()))
        .collect();
    slots.sort_by(|a, b| a.0.cmp(&b.0));
    slots
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_paths_for_dir_and_file_inputs() {
        let dir = std::env::temp_dir();
        let (weights, config) = locate_artifacts(&dir);
        assert_eq!(weights, dir.join("model.safetensors"));
        assert_eq!(config, dir.join("config.json"));

        let file = Path::new("models/w2v/model.safetensors");
        let (weights, config) = locate_artifacts(file);
        assert_eq!(weights, file.to_path_buf());
        assert_eq!(config, Path::new("models/w2v/config.json"));
    }

    #[test]
    fn mismatched_conv_geometry_is_rejected() {
        let json = r#"{
            "hidden_size": 64,
            "num_hidden_layers": 1,
            "num_attention_heads": 4,
            "intermediate_size": 128,
            "conv_dim": [32, 64],
            "conv_kernel": [3],
            "conv_stride": [2, 2],
            "num_conv_pos_embeddings": 8,
            "num_conv_pos_embedding_groups": 4
        }"#;
        let model_config: Wav2Vec2ModelConfig = serde_json::from_str(json).unwrap();
        let err = validate_geometry(&model_config, Path::new("w.safetensors"))
            .expect_err("geometry mismatch must fail");
        assert!(matches!(err, TrainError::IncompatibleWeights { .. }));
    }
}
