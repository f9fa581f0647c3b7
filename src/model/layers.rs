//! Normalization and convolution primitives shared by the speech encoder
//! stack. Tensor names follow the pretrained checkpoint layout, so these
//! load stock wav2vec2 exports unchanged.

use candle_core::{Tensor, D};
use candle_nn::{Conv1dConfig, VarBuilder};

pub(crate) struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    pub(crate) fn load(size: usize, eps: f64, vb: VarBuilder) -> candle_core::Result<Self> {
        let weight = vb.get(size, "weight")?;
        let bias = vb.get(size, "bias")?;
        Ok(Self { weight, bias, eps })
    }

    /// Normalizes over the last axis with biased variance, matching the
    /// checkpoint's torch semantics.
    pub(crate) fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let mean = x.mean_keepdim(D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = centered.broadcast_div(&(var + self.eps)?.sqrt()?)?;
        normed.broadcast_mul(&self.weight)?.broadcast_add(&self.bias)
    }
}

pub(crate) fn layer_norm(size: usize, eps: f64, vb: VarBuilder) -> candle_core::Result<LayerNorm> {
    LayerNorm::load(size, eps, vb)
}

/// GroupNorm over `(batch, channels, time)` input, normalizing each channel
/// group jointly over its channels and the full time axis.
pub(crate) struct GroupNorm1d {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
    num_groups: usize,
    num_channels: usize,
}

impl GroupNorm1d {
    pub(crate) fn load(
        num_groups: usize,
        num_channels: usize,
        eps: f64,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        let weight = vb.get(num_channels, "weight")?;
        let bias = vb.get(num_channels, "bias")?;
        Ok(Self {
            weight,
            bias,
            eps,
            num_groups,
            num_channels,
        })
    }

    pub(crate) fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let (b, c, t) = x.dims3()?;
        if c != self.num_channels || self.num_groups == 0 || c % self.num_groups != 0 {
            return Err(candle_core::Error::Msg(format!(
                "GroupNorm1d got {c} channels, expects {} divisible into {} groups",
                self.num_channels, self.num_groups
            )));
        }

        let grouped = x.reshape((b, self.num_groups, c / self.num_groups, t))?;
        let mean = grouped.mean_keepdim((2, 3))?;
        let centered = grouped.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim((2, 3))?;
        let normed = centered
            .broadcast_div(&(var + self.eps)?.sqrt()?)?
            .reshape((b, c, t))?;

        normed
            .broadcast_mul(&self.weight.reshape((1, c, 1))?)?
            .broadcast_add(&self.bias.reshape((1, c, 1))?)
    }
}

pub(crate) fn group_norm_1d(
    num_groups: usize,
    num_channels: usize,
    eps: f64,
    vb: VarBuilder,
) -> candle_core::Result<GroupNorm1d> {
    GroupNorm1d::load(num_groups, num_channels, eps, vb)
}

enum ConvWeight {
    Plain(Tensor),
    /// Weight-norm parametrization: `v` carries the direction, `g` the
    /// magnitude. `per_position` distinguishes the two `weight_g` layouts
    /// found in exports: `(1, 1, kernel)` normalizes per kernel position,
    /// `(out, 1, 1)` per output filter.
    Norm {
        v: Tensor,
        g: Tensor,
        per_position: bool,
    },
}

/// Conv1d whose checkpoint may store the weight-norm parametrization
/// (`weight_v` / `weight_g`) instead of a plain `weight`. The effective
/// kernel is recomputed from the parametrization on every forward, so
/// fine-tuning trains `v` and `g` themselves and values loaded into the
/// backing vars after construction are picked up.
pub(crate) struct WeightNormConv1d {
    weight: ConvWeight,
    bias: Tensor,
    config: Conv1dConfig,
}

impl WeightNormConv1d {
    pub(crate) fn load(
        in_c: usize,
        out_c: usize,
        kernel: usize,
        config: Conv1dConfig,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        let dim_per_group = in_c / config.groups;
        let weight = match vb.get((out_c, dim_per_group, kernel), "weight_v") {
            Ok(v) => {
                let g = vb
                    .get((1, 1, kernel), "weight_g")
                    .or_else(|_| vb.get((out_c, 1, 1), "weight_g"))?;
                let per_position = g.dims3()? == (1, 1, kernel);
                ConvWeight::Norm { v, g, per_position }
            }
            Err(_) => ConvWeight::Plain(vb.get((out_c, dim_per_group, kernel), "weight")?),
        };
        let bias = vb.get(out_c, "bias")?;
        Ok(Self {
            weight,
            bias,
            config,
        })
    }

    fn effective_weight(&self) -> candle_core::Result<Tensor> {
        match &self.weight {
            ConvWeight::Plain(w) => Ok(w.clone()),
            ConvWeight::Norm {
                v,
                g,
                per_position: true,
            } => {
                let norm = v.sqr()?.sum_keepdim(0)?.sum_keepdim(1)?.sqrt()?;
                v.broadcast_div(&norm)?.broadcast_mul(g)
            }
            ConvWeight::Norm {
                v,
                g,
                per_position: false,
            } => {
                let (o, i, k) = v.dims3()?;
                let norm = v
                    .reshape((o, i * k))?
                    .sqr()?
                    .sum_keepdim(1)?
                    .sqrt()?
                    .unsqueeze(2)?;
                v.broadcast_div(&norm)?.broadcast_mul(g)
            }
        }
    }

    pub(crate) fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let h = xs.conv1d(
            &self.effective_weight()?,
            self.config.padding,
            self.config.stride,
            self.config.dilation,
            self.config.groups,
        )?;
        h.broadcast_add(&self.bias.reshape((1, (), 1))?)
    }
}
