//! Transformer encoder of the pretrained speech model: convolutional
//! relative-position embedding followed by self-attention layers. Supports
//! both layer-norm placements found in published checkpoints (post-norm
//! "base" models and `do_stable_layer_norm` pre-norm models).

use candle_core::{Module, Tensor, D};
use candle_nn::{Conv1dConfig, Linear, VarBuilder};

use crate::config::Wav2Vec2ModelConfig;
use crate::model::layers::{layer_norm, LayerNorm, WeightNormConv1d};

struct PosConvEmbed {
    conv: WeightNormConv1d,
    pad: usize,
}

impl PosConvEmbed {
    fn load(cfg: &Wav2Vec2ModelConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let conv_cfg = Conv1dConfig {
            groups: cfg.num_conv_pos_embedding_groups,
            ..Default::default()
        };
        let conv = WeightNormConv1d::load(
            cfg.hidden_size,
            cfg.hidden_size,
            cfg.num_conv_pos_embeddings,
            conv_cfg,
            vb.pp("conv"),
        )?;
        Ok(Self {
            conv,
            pad: cfg.num_conv_pos_embeddings / 2,
        })
    }

    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        // The kernel/2 padding is applied by hand so fine-tune backprop
        // also works on clips shorter than the kernel. An even kernel
        // still emits one extra frame; trim back to the input length
        // before the residual add.
        let seq_len = xs.dim(1)?;
        let h = xs
            .transpose(1, 2)?
            .contiguous()?
            .pad_with_zeros(D::Minus1, self.pad, self.pad)?;
        let h = self.conv.forward(&h)?;
        h.narrow(2, 0, seq_len)?
            .gelu()?
            .transpose(1, 2)?
            .contiguous()
    }
}

struct SelfAttention {
    q: Linear,
    k: Linear,
    v: Linear,
    out: Linear,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl SelfAttention {
    fn load(cfg: &Wav2Vec2ModelConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let head_dim = cfg.hidden_size / cfg.num_attention_heads;
        Ok(Self {
            q: candle_nn::linear(cfg.hidden_size, cfg.hidden_size, vb.pp("q_proj"))?,
            k: candle_nn::linear(cfg.hidden_size, cfg.hidden_size, vb.pp("k_proj"))?,
            v: candle_nn::linear(cfg.hidden_size, cfg.hidden_size, vb.pp("v_proj"))?,
            out: candle_nn::linear(cfg.hidden_size, cfg.hidden_size, vb.pp("out_proj"))?,
            num_heads: cfg.num_attention_heads,
            head_dim,
            scale: (head_dim as f64).powf(-0.5),
        })
    }

    fn split_heads(&self, x: &Tensor, b: usize, t: usize) -> candle_core::Result<Tensor> {
        x.reshape((b, t, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    fn merge_heads(&self, x: &Tensor, b: usize, t: usize) -> candle_core::Result<Tensor> {
        x.transpose(1, 2)?
            .contiguous()?
            .reshape((b, t, self.num_heads * self.head_dim))
    }

    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let (b, t, _) = xs.dims3()?;
        let q = self.split_heads(&(self.q.forward(xs)? * self.scale)?, b, t)?;
        let k = self.split_heads(&self.k.forward(xs)?, b, t)?;
        let v = self.split_heads(&self.v.forward(xs)?, b, t)?;

        let weights = q.matmul(&k.transpose(2, 3)?.contiguous()?)?;
        let weights = candle_nn::ops::softmax(&weights, D::Minus1)?;
        self.out.forward(&self.merge_heads(&weights.matmul(&v)?, b, t)?)
    }
}

struct FeedForward {
    up: Linear,
    down: Linear,
}

impl FeedForward {
    fn load(cfg: &Wav2Vec2ModelConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            up: candle_nn::linear(
                cfg.hidden_size,
                cfg.intermediate_size,
                vb.pp("intermediate_dense"),
            )?,
            down: candle_nn::linear(
                cfg.intermediate_size,
                cfg.hidden_size,
                vb.pp("output_dense"),
            )?,
        })
    }

    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        self.down.forward(&self.up.forward(xs)?.gelu()?)
    }
}

struct EncoderLayer {
    attn: SelfAttention,
    ln_attn: LayerNorm,
    ff: FeedForward,
    ln_ff: LayerNorm,
    stable_pre_norm: bool,
}

impl EncoderLayer {
    fn load(cfg: &Wav2Vec2ModelConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            attn: SelfAttention::load(cfg, vb.pp("attention"))?,
            ln_attn: layer_norm(cfg.hidden_size, cfg.layer_norm_eps, vb.pp("layer_norm"))?,
            ff: FeedForward::load(cfg, vb.pp("feed_forward"))?,
            ln_ff: layer_norm(
                cfg.hidden_size,
                cfg.layer_norm_eps,
                vb.pp("final_layer_norm"),
            )?,
            stable_pre_norm: cfg.do_stable_layer_norm,
        })
    }

    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        if self.stable_pre_norm {
            // h = x + attn(ln(x)); y = h + ff(ln(h))
            let h = (xs + self.attn.forward(&self.ln_attn.forward(xs)?)?)?;
            &h + self.ff.forward(&self.ln_ff.forward(&h)?)?
        } else {
            // h = ln(x + attn(x)); y = ln(h + ff(h))
            let h = self.ln_attn.forward(&(xs + self.attn.forward(xs)?)?)?;
            self.ln_ff.forward(&(&h + self.ff.forward(&h)?)?)
        }
    }
}

pub(crate) struct Encoder {
    pos_conv: PosConvEmbed,
    layer_norm: LayerNorm,
    layers: Vec<EncoderLayer>,
    stable_pre_norm: bool,
}

impl Encoder {
    pub(crate) fn load(cfg: &Wav2Vec2ModelConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let mut layers = Vec::with_capacity(cfg.num_hidden_layers);
        for i in 0..cfg.num_hidden_layers {
            layers.push(EncoderLayer::load(cfg, vb.pp(format!("layers.{i}")))?);
        }
        Ok(Self {
            pos_conv: PosConvEmbed::load(cfg, vb.pp("pos_conv_embed"))?,
            layer_norm: layer_norm(cfg.hidden_size, cfg.layer_norm_eps, vb.pp("layer_norm"))?,
            layers,
            stable_pre_norm: cfg.do_stable_layer_norm,
        })
    }

    /// `(batch, frames, hidden)` in and out. The encoder-level layer norm
    /// sits where the checkpoint variant expects it: right after the
    /// positional conv for post-norm models, after the layer stack for
    /// `do_stable_layer_norm` models.
    pub(crate) fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let mut h = (xs + self.pos_conv.forward(xs)?)?;
        if !self.stable_pre_norm {
            h = self.layer_norm.forward(&h)?;
        }
        for layer in &self.layers {
            h = layer.forward(&h)?;
        }
        if self.stable_pre_norm {
            h = self.layer_norm.forward(&h)?;
        }
        Ok(h)
    }
}
