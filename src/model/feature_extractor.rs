use candle_core::{Module, Tensor};
use candle_nn::{Conv1d, Conv1dConfig, VarBuilder};

use crate::config::Wav2Vec2ModelConfig;
use crate::model::layers::{group_norm_1d, layer_norm, GroupNorm1d, LayerNorm};

/// Normalization applied after each conv, set by the checkpoint's
/// `feat_extract_norm` mode: "layer" normalizes every block over channels,
/// "group" puts a single GroupNorm on the first block only.
enum ConvNorm {
    None,
    Layer(LayerNorm),
    Group(GroupNorm1d),
}

struct ConvBlock {
    conv: Conv1d,
    norm: ConvNorm,
}

impl ConvBlock {
    #[allow(clippy::too_many_arguments)]
    fn load(
        in_c: usize,
        out_c: usize,
        kernel: usize,
        stride: usize,
        use_bias: bool,
        norm_mode: &str,
        first: bool,
        eps: f64,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        let cfg = Conv1dConfig {
            stride,
            ..Default::default()
        };
        let conv = if use_bias {
            candle_nn::conv1d(in_c, out_c, kernel, cfg, vb.pp("conv"))?
        } else {
            candle_nn::conv1d_no_bias(in_c, out_c, kernel, cfg, vb.pp("conv"))?
        };
        // Both norm variants live under the "layer_norm" name in the
        // checkpoint, whichever one the mode selects.
        let norm = match norm_mode {
            "layer" => ConvNorm::Layer(layer_norm(out_c, eps, vb.pp("layer_norm"))?),
            "group" if first => ConvNorm::Group(group_norm_1d(out_c, out_c, eps, vb.pp("layer_norm"))?),
            _ => ConvNorm::None,
        };
        Ok(Self { conv, norm })
    }

    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let xs = self.conv.forward(xs)?;
        let xs = match &self.norm {
            ConvNorm::None => xs,
            // GroupNorm runs directly on (batch, channels, time).
            ConvNorm::Group(gn) => gn.forward(&xs)?,
            // LayerNorm normalizes channels per time step, so swap axes
            // around it.
            ConvNorm::Layer(ln) => ln
                .forward(&xs.transpose(1, 2)?)?
                .transpose(1, 2)?
                .contiguous()?,
        };
        xs.gelu()
    }
}

/// The strided conv stack that turns raw waveform samples into frame
/// features, downsampling by the product of the conv strides.
pub(crate) struct FeatureExtractor {
    blocks: Vec<ConvBlock>,
}

impl FeatureExtractor {
    pub(crate) fn load(cfg: &Wav2Vec2ModelConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let geometry = cfg
            .conv_dim
            .iter()
            .zip(cfg.conv_kernel.iter())
            .zip(cfg.conv_stride.iter());
        let mut blocks = Vec::with_capacity(cfg.conv_dim.len());
        let mut in_c = 1;
        for (i, ((&out_c, &kernel), &stride)) in geometry.enumerate() {
            blocks.push(ConvBlock::load(
                in_c,
                out_c,
                kernel,
                stride,
                cfg.conv_bias,
                &cfg.feat_extract_norm,
                i == 0,
                cfg.layer_norm_eps,
                vb.pp(format!("conv_layers.{i}")),
            )?);
            in_c = out_c;
        }
        Ok(Self { blocks })
    }

    /// `(batch, 1, samples)` waveform in, `(batch, channels, frames)` out.
    pub(crate) fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        self.blocks
            .iter()
            .try_fold(xs.clone(), |h, block| block.forward(&h))
    }
}
