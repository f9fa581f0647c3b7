use candle_core::{Module, Tensor};
use candle_nn::{Linear, VarBuilder};

use crate::config::Wav2Vec2ModelConfig;
use crate::model::layers::{layer_norm, LayerNorm};

/// Bridges the conv feature space into the transformer width. The
/// checkpoint's projection dropout is omitted; forward passes stay
/// deterministic so resumed runs replay exactly.
pub(crate) struct FeatureProjection {
    layer_norm: LayerNorm,
    projection: Linear,
}

impl FeatureProjection {
    pub(crate) fn load(cfg: &Wav2Vec2ModelConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let conv_out = cfg.conv_dim.last().copied().unwrap_or(cfg.hidden_size);
        Ok(Self {
            layer_norm: layer_norm(conv_out, cfg.layer_norm_eps, vb.pp("layer_norm"))?,
            projection: candle_nn::linear(conv_out, cfg.hidden_size, vb.pp("projection"))?,
        })
    }

    /// `(batch, frames, conv_out)` in, `(batch, frames, hidden)` out.
    pub(crate) fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        self.projection.forward(&self.layer_norm.forward(xs)?)
    }
}
