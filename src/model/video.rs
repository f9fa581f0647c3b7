use candle_core::{Module, Tensor, D};
use candle_nn::{Conv1d, Conv1dConfig, Conv2d, Conv2dConfig, Linear, VarBuilder};

use crate::model::alignment::l2_normalize;
use crate::model::pooling::AttentionPool;

/// Channel progression of the per-frame conv stack.
const FRAME_CHANNELS: [usize; 3] = [32, 64, 128];

/// Lightweight visual branch trained from scratch: a strided 2D conv stack
/// runs over each frame, spatial positions are averaged away, a temporal
/// conv mixes neighboring frames, and attention pooling reduces the clip to
/// a single unit-norm embedding.
pub(crate) struct VideoEncoder {
    frame_convs: Vec<Conv2d>,
    temporal: Conv1d,
    pool: AttentionPool,
    project: Linear,
}

impl VideoEncoder {
    pub(crate) fn load(embed_dim: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        let cfg = Conv2dConfig {
            stride: 2,
            padding: 1,
            ..Default::default()
        };
        let mut frame_convs = Vec::with_capacity(FRAME_CHANNELS.len());
        let mut in_c = 3;
        for (i, &out_c) in FRAME_CHANNELS.iter().enumerate() {
            frame_convs.push(candle_nn::conv2d(
                in_c,
                out_c,
                3,
                cfg,
                vb.pp(format!("frame_conv.{i}")),
            )?);
            in_c = out_c;
        }
        Ok(Self {
            frame_convs,
            temporal: candle_nn::conv1d(
                in_c,
                in_c,
                3,
                Conv1dConfig::default(),
                vb.pp("temporal"),
            )?,
            pool: AttentionPool::load(in_c, vb.pp("pool"))?,
            project: candle_nn::linear(in_c, embed_dim, vb.pp("project"))?,
        })
    }

    /// `(batch, frames, 3, height, width)` pixels in, unit-norm
    /// `(batch, embed_dim)` out.
    pub(crate) fn forward(&self, video: &Tensor) -> candle_core::Result<Tensor> {
        let (b, t, c, h, w) = video.dims5()?;
        let mut frames = video.reshape((b * t, c, h, w))?;
        for conv in &self.frame_convs {
            frames = conv.forward(&frames)?.gelu()?;
        }
        // One feature vector per frame: average over the spatial grid.
        let feats = frames
            .flatten_from(2)?
            .mean(D::Minus1)?
            .reshape((b, t, ()))?;
        // Pad the frame axis by hand: conv1d cannot backprop configured
        // padding over an input shorter than the kernel, and two-frame
        // clips are legal.
        let feats = feats
            .transpose(1, 2)?
            .contiguous()?
            .pad_with_zeros(D::Minus1, 1, 1)?;
        let feats = self
            .temporal
            .forward(&feats)?
            .gelu()?
            .transpose(1, 2)?
            .contiguous()?;
        let pooled = self.pool.forward(&feats)?;
        l2_normalize(&self.project.forward(&pooled)?)
    }
}
