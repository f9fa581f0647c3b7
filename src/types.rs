use std::path::PathBuf;

use candle_core::Tensor;

/// Corpus partition a clip belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Validation,
    Test,
}

impl Split {
    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Validation => "validation",
            Split::Test => "test",
        }
    }
}

/// One indexed audio-video pair. Paths and lengths are fixed at indexing
/// time; tensor data is only read when the clip enters a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Clip {
    pub id: String,
    pub video_path: PathBuf,
    pub audio_path: PathBuf,
    pub video_frames: usize,
    pub video_fps: f64,
    pub audio_samples: usize,
    pub audio_sample_rate_hz: u32,
    /// Canonical clip duration, derived from the audio length.
    pub duration_ms: f64,
    pub split: Split,
}

/// A sampler-issued draw: the clips of one training step plus the padding
/// targets collation must reach.
#[derive(Debug, Clone)]
pub struct Batch {
    pub epoch: usize,
    pub index_in_epoch: usize,
    pub clips: Vec<Clip>,
    pub max_video_frames: usize,
    pub max_audio_samples: usize,
}

impl Batch {
    pub fn new(epoch: usize, index_in_epoch: usize, clips: Vec<Clip>) -> Self {
        let max_video_frames = clips.iter().map(|c| c.video_frames).max().unwrap_or(0);
        let max_audio_samples = clips.iter().map(|c| c.audio_samples).max().unwrap_or(0);
        Self {
            epoch,
            index_in_epoch,
            clips,
            max_video_frames,
            max_audio_samples,
        }
    }

    pub fn len(&self) -> usize {
        self.clips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clips.is_empty()
    }
}

/// Collated dense tensors for one step. `video` is
/// (batch, frames, channels, height, width) and `audio` is
/// (batch, samples), both zero-padded to the batch maxima. Row order
/// matches `clip_ids`, so row i of both tensors is the same clip.
#[derive(Debug)]
pub struct BatchTensors {
    pub epoch: usize,
    pub index_in_epoch: usize,
    pub clip_ids: Vec<String>,
    pub video: Tensor,
    pub audio: Tensor,
}

impl BatchTensors {
    pub fn len(&self) -> usize {
        self.clip_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clip_ids.is_empty()
    }
}
