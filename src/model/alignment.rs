//! The alignment head: projects pooled speech frames and video clips into a
//! shared embedding space and scores every pairing in a batch. Matched
//! audio/video pairs sit on the score-matrix diagonal; everything off the
//! diagonal is an in-batch negative.

use candle_core::{Module, Tensor, D};
use candle_nn::{Linear, VarBuilder};

use crate::config::{Objective, TrainConfig};
use crate::model::pooling::TemporalPool;
use crate::model::video::VideoEncoder;

/// Scales rows to unit L2 norm. A zero row stays zero instead of turning
/// into NaNs.
pub(crate) fn l2_normalize(x: &Tensor) -> candle_core::Result<Tensor> {
    let norm = x.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?;
    x.broadcast_div(&norm.maximum(1e-12)?)
}

/// Contrastive objective over the score matrix.
pub(crate) enum AlignmentObjective {
    /// Symmetric cross-entropy over temperature-scaled scores, diagonal
    /// entries as targets, averaged over the audio→video and video→audio
    /// directions.
    InfoNce { temperature: f64 },
    /// Max-margin hinge over the score matrix. Every off-diagonal entry is
    /// penalized for coming within `margin` of its row and column anchors;
    /// the mean over those hinge terms is returned.
    Triplet { margin: f64 },
}

impl AlignmentObjective {
    pub(crate) fn from_config(config: &TrainConfig) -> Self {
        match config.objective {
            Objective::InfoNce => Self::InfoNce {
                temperature: config.temperature,
            },
            Objective::Triplet => Self::Triplet {
                margin: config.margin,
            },
        }
    }

    pub(crate) fn loss(&self, scores: &Tensor) -> candle_core::Result<Tensor> {
        match *self {
            Self::InfoNce { temperature } => {
                let (batch, _) = scores.dims2()?;
                let targets = Tensor::arange(0u32, batch as u32, scores.device())?;
                let audio_to_video =
                    candle_nn::loss::cross_entropy(&(scores / temperature)?, &targets)?;
                let video_to_audio = candle_nn::loss::cross_entropy(
                    &(scores.t()?.contiguous()? / temperature)?,
                    &targets,
                )?;
                (audio_to_video + video_to_audio)? * 0.5
            }
            Self::Triplet { margin } => {
                let (batch, _) = scores.dims2()?;
                // A single pair has no in-batch negatives to hinge
                // against; its loss is zero, not 0/0.
                if batch < 2 {
                    return Tensor::zeros((), scores.dtype(), scores.device());
                }
                let diag = diagonal(scores)?;
                let row_anchor = diag.reshape((batch, 1))?;
                let col_anchor = diag.reshape((1, batch))?;
                let row_hinge = (scores.broadcast_sub(&row_anchor)? + margin)?.relu()?;
                let col_hinge = (scores.broadcast_sub(&col_anchor)? + margin)?.relu()?;

                let mut mask = vec![1f32; batch * batch];
                for i in 0..batch {
                    mask[i * batch + i] = 0.0;
                }
                let mask = Tensor::from_vec(mask, (batch, batch), scores.device())?;
                let total = ((row_hinge + col_hinge)? * mask)?.sum_all()?;
                total / (2 * batch * (batch - 1)) as f64
            }
        }
    }
}

fn diagonal(scores: &Tensor) -> candle_core::Result<Tensor> {
    let (batch, _) = scores.dims2()?;
    let idx = Tensor::arange(0u32, batch as u32, scores.device())?.reshape((batch, 1))?;
    scores.gather(&idx, 1)?.squeeze(1)
}

/// The trainable model: pooling + projection over the (possibly frozen)
/// speech encoder output, and the video branch.
pub struct AlignmentModel {
    audio_pool: TemporalPool,
    audio_project: Linear,
    video: VideoEncoder,
    objective: AlignmentObjective,
}

impl AlignmentModel {
    pub(crate) fn load(
        config: &TrainConfig,
        hidden_size: usize,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        Ok(Self {
            audio_pool: TemporalPool::load(
                config.audio_pooling,
                hidden_size,
                vb.pp("audio_pool"),
            )?,
            audio_project: candle_nn::linear(
                hidden_size,
                config.embed_dim,
                vb.pp("audio_project"),
            )?,
            video: VideoEncoder::load(config.embed_dim, vb.pp("video"))?,
            objective: AlignmentObjective::from_config(config),
        })
    }

    /// Speech-encoder frames `(batch, frames, hidden)` to unit-norm
    /// `(batch, embed_dim)` embeddings.
    pub fn embed_audio(&self, frames: &Tensor) -> candle_core::Result<Tensor> {
        let pooled = self.audio_pool.forward(frames)?;
        l2_normalize(&self.audio_project.forward(&pooled)?)
    }

    /// Pixel tensor `(batch, frames, 3, h, w)` to unit-norm
    /// `(batch, embed_dim)` embeddings.
    pub fn embed_video(&self, video: &Tensor) -> candle_core::Result<Tensor> {
        self.video.forward(video)
    }

    /// Cosine similarities between every audio row and every video row:
    /// `scores[i][j]` pairs audio clip `i` with video clip `j`, so matched
    /// pairs land on the diagonal. Embeddings are unit-norm, which makes
    /// this a plain matmul.
    pub fn score_matrix(audio: &Tensor, video: &Tensor) -> candle_core::Result<Tensor> {
        audio.matmul(&video.t()?.contiguous()?)
    }

    pub fn loss(&self, scores: &Tensor) -> candle_core::Result<Tensor> {
        self.objective.loss(scores)
    }
}
