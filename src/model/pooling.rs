use candle_core::{Module, Tensor};
use candle_nn::{Linear, VarBuilder};

use crate::config::AudioPooling;

/// Hidden width of the attention scorer MLP.
const ATTENTION_HIDDEN: usize = 128;

/// Attention pooling over the time axis: a tanh MLP scores every frame per
/// feature dimension, scores are softmaxed over time and used as weights
/// for a sum. Zero-initialized weights degrade to a plain time average.
pub(crate) struct AttentionPool {
    hidden: Linear,
    out: Linear,
}

impl AttentionPool {
    pub(crate) fn load(in_size: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            hidden: candle_nn::linear(in_size, ATTENTION_HIDDEN, vb.pp("hidden"))?,
            out: candle_nn::linear(ATTENTION_HIDDEN, in_size, vb.pp("out"))?,
        })
    }

    /// `(batch, time, features)` in, `(batch, features)` out.
    pub(crate) fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let scores = self.out.forward(&self.hidden.forward(xs)?.tanh()?)?;
        let alpha = candle_nn::ops::softmax(&scores, 1)?;
        (alpha * xs)?.sum(1)
    }
}

/// Frame pooling policy turning `(batch, time, features)` encoder output
/// into one `(batch, features)` vector per clip.
pub(crate) enum TemporalPool {
    Average,
    Attention(AttentionPool),
    Last,
}

impl TemporalPool {
    pub(crate) fn load(
        policy: AudioPooling,
        in_size: usize,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        Ok(match policy {
            AudioPooling::Average => Self::Average,
            AudioPooling::Attention => Self::Attention(AttentionPool::load(in_size, vb)?),
            AudioPooling::Last => Self::Last,
        })
    }

    pub(crate) fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        // Every policy misbehaves on zero frames: the mean of nothing is
        // NaN and there is no last frame to take. Reject up front.
        let time = xs.dim(1)?;
        if time == 0 {
            return Err(candle_core::Error::Msg(
                "cannot pool an encoder output with zero frames".to_string(),
            ));
        }
        match self {
            Self::Average => xs.mean(1),
            Self::Attention(pool) => pool.forward(xs),
            Self::Last => xs.narrow(1, time - 1, 1)?.squeeze(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor};
    use candle_nn::VarBuilder;

    use super::*;

    fn frames() -> Tensor {
        Tensor::new(
            &[[[1f32, 2.], [3., 4.], [5., 12.]], [[0., 0.], [6., 3.], [0., 0.]]],
            &Device::Cpu,
        )
        .unwrap()
    }

    #[test]
    fn average_pool_is_the_time_mean() {
        let pooled = TemporalPool::Average.forward(&frames()).unwrap();
        assert_eq!(
            pooled.to_vec2::<f32>().unwrap(),
            vec![vec![3.0, 6.0], vec![2.0, 1.0]]
        );
    }

    #[test]
    fn last_pool_takes_the_final_frame() {
        let pooled = TemporalPool::Last.forward(&frames()).unwrap();
        assert_eq!(
            pooled.to_vec2::<f32>().unwrap(),
            vec![vec![5.0, 12.0], vec![0.0, 0.0]]
        );
    }

    #[test]
    fn zeroed_attention_pool_degrades_to_the_mean() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let pool = AttentionPool::load(2, vb).unwrap();
        let pooled = pool.forward(&frames()).unwrap().to_vec2::<f32>().unwrap();
        let mean = frames().mean(1).unwrap().to_vec2::<f32>().unwrap();
        for (got, want) in pooled.iter().flatten().zip(mean.iter().flatten()) {
            assert!((got - want).abs() < 1e-6, "{got} vs {want}");
        }
    }

    #[test]
    fn every_policy_rejects_an_empty_time_axis() {
        let empty = Tensor::zeros((2, 0, 2), DType::F32, &Device::Cpu).unwrap();
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let attention = TemporalPool::Attention(AttentionPool::load(2, vb).unwrap());
        for pool in [TemporalPool::Average, attention, TemporalPool::Last] {
            assert!(pool.forward(&empty).is_err());
        }
    }
}
