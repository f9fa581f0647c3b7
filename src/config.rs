use std::path::{Path, PathBuf};

use candle_core::Device;

use crate::error::TrainError;

/// Audio pooling applied over encoder frames before projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioPooling {
    Average,
    Attention,
    Last,
}

/// Contrastive objective computed over the score matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Objective {
    #[serde(rename = "infonce")]
    InfoNce,
    Triplet,
}

/// Training run configuration. Parsed from a flat JSON document; keys not
/// listed here are rejected. `corpus_dir` and `weights_path` have no
/// file-level default and must be present in a config file.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainConfig {
    pub corpus_dir: PathBuf,
    /// Pretrained speech-encoder weights: either the safetensors file
    /// (with a sibling config.json) or a model directory holding both.
    pub weights_path: PathBuf,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_num_epochs")]
    pub num_epochs: usize,
    #[serde(default = "default_interval")]
    pub checkpoint_interval: u64,
    #[serde(default = "default_interval")]
    pub eval_interval: u64,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub fine_tune_encoder: bool,
    /// Only consulted when `fine_tune_encoder` is set: the conv feature
    /// extractor stays frozen even while the transformer fine-tunes.
    #[serde(default = "default_true")]
    pub freeze_feature_extractor: bool,
    /// Only consulted when `fine_tune_encoder` is set: freezes the first N
    /// transformer layers.
    #[serde(default)]
    pub freeze_encoder_layers: Option<usize>,
    #[serde(default = "default_embed_dim")]
    pub embed_dim: usize,
    #[serde(default = "default_audio_pooling")]
    pub audio_pooling: AudioPooling,
    #[serde(default = "default_objective")]
    pub objective: Objective,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_margin")]
    pub margin: f64,
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default = "default_prefetch_workers")]
    pub prefetch_workers: usize,
    #[serde(default = "default_prefetch_depth")]
    pub prefetch_depth: usize,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("runs/avalign")
}
fn default_batch_size() -> usize {
    8
}
fn default_learning_rate() -> f64 {
    1e-4
}
fn default_num_epochs() -> usize {
    1
}
fn default_interval() -> u64 {
    500
}
fn default_seed() -> u64 {
    666
}
fn default_true() -> bool {
    true
}
fn default_embed_dim() -> usize {
    512
}
fn default_audio_pooling() -> AudioPooling {
    AudioPooling::Average
}
fn default_objective() -> Objective {
    Objective::InfoNce
}
fn default_temperature() -> f64 {
    0.07
}
fn default_margin() -> f64 {
    0.2
}
fn default_device() -> String {
    "cpu".to_string()
}
fn default_prefetch_workers() -> usize {
    2
}
fn default_prefetch_depth() -> usize {
    4
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            corpus_dir: PathBuf::from("data/corpus"),
            weights_path: PathBuf::from("models/wav2vec2-base"),
            output_dir: default_output_dir(),
            batch_size: default_batch_size(),
            learning_rate: default_learning_rate(),
            num_epochs: default_num_epochs(),
            checkpoint_interval: default_interval(),
            eval_interval: default_interval(),
            seed: default_seed(),
            fine_tune_encoder: false,
            freeze_feature_extractor: default_true(),
            freeze_encoder_layers: None,
            embed_dim: default_embed_dim(),
            audio_pooling: default_audio_pooling(),
            objective: default_objective(),
            temperature: default_temperature(),
            margin: default_margin(),
            device: default_device(),
            prefetch_workers: default_prefetch_workers(),
            prefetch_depth: default_prefetch_depth(),
        }
    }
}

impl TrainConfig {
    /// Reads and validates a config file. Unknown keys, missing required
    /// keys and malformed values all surface as `ConfigInvalid`.
    pub fn load(path: &Path) -> Result<Self, TrainError> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| TrainError::io("reading training config", e))?;
        let config: TrainConfig = serde_json::from_str(&data)
            .map_err(|e| TrainError::config_invalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), TrainError> {
        if self.batch_size < 2 {
            return Err(TrainError::config_invalid(format!(
                "batch_size must be at least 2 to provide in-batch negatives, got {}",
                self.batch_size
            )));
        }
        if !self.learning_rate.is_finite() || self.learning_rate < 0.0 {
            return Err(TrainError::config_invalid(format!(
                "learning_rate must be finite and non-negative, got {}",
                self.learning_rate
            )));
        }
        if self.num_epochs == 0 {
            return Err(TrainError::config_invalid("num_epochs must be at least 1"));
        }
        if self.checkpoint_interval == 0 {
            return Err(TrainError::config_invalid(
                "checkpoint_interval must be at least 1",
            ));
        }
        if self.eval_interval == 0 {
            return Err(TrainError::config_invalid("eval_interval must be at least 1"));
        }
        if self.embed_dim == 0 {
            return Err(TrainError::config_invalid("embed_dim must be at least 1"));
        }
        if !self.temperature.is_finite() || self.temperature <= 0.0 {
            return Err(TrainError::config_invalid(format!(
                "temperature must be finite and positive, got {}",
                self.temperature
            )));
        }
        if !self.margin.is_finite() || self.margin <= 0.0 {
            return Err(TrainError::config_invalid(format!(
                "margin must be finite and positive, got {}",
                self.margin
            )));
        }
        if self.device != "cpu" && self.device != "cuda" {
            return Err(TrainError::config_invalid(format!(
                "device must be \"cpu\" or \"cuda\", got \"{}\"",
                self.device
            )));
        }
        if self.prefetch_workers == 0 {
            return Err(TrainError::config_invalid(
                "prefetch_workers must be at least 1",
            ));
        }
        if self.prefetch_depth == 0 {
            return Err(TrainError::config_invalid(
                "prefetch_depth must be at least 1",
            ));
        }
        Ok(())
    }

    pub(crate) fn resolve_device(&self) -> Result<Device, TrainError> {
        match self.device.as_str() {
            "cpu" => Ok(Device::Cpu),
            "cuda" => Device::new_cuda(0).map_err(|e| TrainError::runtime("opening cuda device", e)),
            other => Err(TrainError::config_invalid(format!(
                "device must be \"cpu\" or \"cuda\", got \"{other}\""
            ))),
        }
    }
}

/// Shape of the pretrained speech model, read from the `config.json`
/// shipped next to its weights.
#[derive(Debug, Clone, serde::Deserialize)]
pub(crate) struct Wav2Vec2ModelConfig {
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    pub conv_dim: Vec<usize>,
    pub conv_kernel: Vec<usize>,
    pub conv_stride: Vec<usize>,
    pub num_conv_pos_embeddings: usize,
    pub num_conv_pos_embedding_groups: usize,
    #[serde(default)]
    pub do_stable_layer_norm: bool,
    #[serde(default = "default_eps")]
    pub layer_norm_eps: f64,
    #[serde(default = "default_feat_norm")]
    pub feat_extract_norm: String,
    #[serde(default = "default_conv_bias")]
    pub conv_bias: bool,
}

fn default_eps() -> f64 {
    1e-5
}
fn default_feat_norm() -> String {
    "layer".to_string()
}
fn default_conv_bias() -> bool {
    true
}

impl Wav2Vec2ModelConfig {
    pub(crate) fn load(path: &Path) -> Result<Self, TrainError> {
        let data = std::fs::read_to_string(path)
            .map_err(|_| TrainError::incompatible_weights(path, "missing or unreadable config.json"))?;
        serde_json::from_str(&data)
            .map_err(|e| TrainError::incompatible_weights(path, format!("invalid config.json: {e}")))
    }

    pub(crate) fn frame_stride_ms(&self, sample_rate: u32) -> f64 {
        let stride_samples: usize = self.conv_stride.iter().product();
        stride_samples as f64 / sample_rate as f64 * 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_temp_config(name: &str, json: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("avalign-config-{name}-{}", std::process::id()));
        std::fs::write(&path, json).expect("write temp config");
        path
    }

    #[test]
    fn default_config_is_valid() {
        let config = TrainConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.batch_size, 8);
        assert_eq!(config.seed, 666);
        assert_eq!(config.audio_pooling, AudioPooling::Average);
        assert_eq!(config.objective, Objective::InfoNce);
        assert!(!config.fine_tune_encoder);
        assert!(config.freeze_feature_extractor);
        assert_eq!(config.device, "cpu");
    }

    #[test]
    fn load_minimal_config_applies_defaults() {
        let path = write_temp_config(
            "minimal",
            r#"{"corpus_dir": "clips", "weights_path": "w2v/model.safetensors"}"#,
        );
        let config = TrainConfig::load(&path).expect("minimal config loads");
        std::fs::remove_file(&path).ok();
        assert_eq!(config.corpus_dir, PathBuf::from("clips"));
        assert_eq!(config.num_epochs, 1);
        assert_eq!(config.checkpoint_interval, 500);
        assert_eq!(config.temperature, 0.07);
    }

    #[test]
    fn unknown_key_is_rejected() {
        let path = write_temp_config(
            "unknown",
            r#"{"corpus_dir": "clips", "weights_path": "w", "learning_rte": 0.1}"#,
        );
        let err = TrainConfig::load(&path).expect_err("unknown key must fail");
        std::fs::remove_file(&path).ok();
        match err {
            TrainError::ConfigInvalid { message } => assert!(message.contains("learning_rte")),
            other => panic!("expected ConfigInvalid, got {other:?}"),
        }
    }

    #[test]
    fn missing_required_key_is_rejected() {
        let path = write_temp_config("missing", r#"{"weights_path": "w"}"#);
        let err = TrainConfig::load(&path).expect_err("missing corpus_dir must fail");
        std::fs::remove_file(&path).ok();
        match err {
            TrainError::ConfigInvalid { message } => assert!(message.contains("corpus_dir")),
            other => panic!("expected ConfigInvalid, got {other:?}"),
        }
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let mut config = TrainConfig::default();
        config.batch_size = 1;
        assert!(config.validate().is_err());

        let mut config = TrainConfig::default();
        config.learning_rate = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = TrainConfig::default();
        config.eval_interval = 0;
        assert!(config.validate().is_err());

        let mut config = TrainConfig::default();
        config.device = "tpu".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn pooling_and_objective_parse_lowercase() {
        let path = write_temp_config(
            "enums",
            r#"{
                "corpus_dir": "clips",
                "weights_path": "w",
                "audio_pooling": "attention",
                "objective": "triplet"
            }"#,
        );
        let config = TrainConfig::load(&path).expect("enum values parse");
        std::fs::remove_file(&path).ok();
        assert_eq!(config.audio_pooling, AudioPooling::Attention);
        assert_eq!(config.objective, Objective::Triplet);
    }

    #[test]
    fn model_config_frame_stride_ms() {
        let json = r#"{
            "hidden_size": 768,
            "num_hidden_layers": 12,
            "num_attention_heads": 12,
            "intermediate_size": 3072,
            "conv_dim": [512],
            "conv_kernel": [10],
            "conv_stride": [2, 2, 2, 2, 2],
            "num_conv_pos_embeddings": 128,
            "num_conv_pos_embedding_groups": 16
        }"#;
        let model_config: Wav2Vec2ModelConfig =
            serde_json::from_str(json).expect("valid config json");
        // stride product = 32, 32 / 16000 * 1000 = 2.0 ms
        let stride_ms = model_config.frame_stride_ms(16_000);
        assert!((stride_ms - 2.0).abs() < 1e-9);
    }
}
