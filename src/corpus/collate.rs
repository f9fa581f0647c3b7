use std::path::Path;

use candle_core::{DType, Device, Tensor};

use crate::error::TrainError;
use crate::types::{Batch, BatchTensors, Clip};

/// Reads one clip's tensors from disk and normalizes the audio. Returns
/// `(video, audio)` with shapes `(frames, 3, h, w)` and `(samples,)`.
///
/// File reads go through `std::fs::read` so transient I/O failures surface
/// as `Io` (retryable by the prefetcher); anything wrong with the decoded
/// content is `CorruptCorpus` and fatal.
pub(crate) fn load_clip_tensors(
    clip: &Clip,
    device: &Device,
) -> Result<(Tensor, Tensor), TrainError> {
    let video = load_named_tensor(&clip.id, &clip.video_path, "video", device)?;
    let video_dims = video.dims().to_vec();
    if video_dims.len() != 4 || video_dims[1] != 3 {
        return Err(TrainError::corrupt_corpus(
            &clip.id,
            format!("video tensor must be (frames, 3, h, w), got {video_dims:?}"),
        ));
    }
    if video_dims[0] != clip.video_frames {
        return Err(TrainError::corrupt_corpus(
            &clip.id,
            format!(
                "video tensor has {} frames but meta.json promised {}",
                video_dims[0], clip.video_frames
            ),
        ));
    }

    let audio = load_named_tensor(&clip.id, &clip.audio_path, "audio", device)?;
    let audio_len = audio
        .dims1()
        .map_err(|_| {
            TrainError::corrupt_corpus(
                &clip.id,
                format!("audio tensor must be 1-dimensional, got {:?}", audio.dims()),
            )
        })?;
    if audio_len != clip.audio_samples {
        return Err(TrainError::corrupt_corpus(
            &clip.id,
            format!(
                "audio tensor has {audio_len} samples but meta.json promised {}",
                clip.audio_samples
            ),
        ));
    }

    let samples = audio
        .to_vec1::<f32>()
        .map_err(|e| TrainError::runtime("reading audio samples", e))?;
    let normalized = normalize_audio(&samples);
    let audio = Tensor::from_vec(normalized, audio_len, device)
        .map_err(|e| TrainError::runtime("rebuilding audio tensor", e))?;

    Ok((video, audio))
}

fn load_named_tensor(
    clip_id: &str,
    path: &Path,
    name: &str,
    device: &Device,
) -> Result<Tensor, TrainError> {
    let bytes = std::fs::read(path).map_err(|e| TrainError::io("reading clip tensor file", e))?;
    let mut tensors = candle_core::safetensors::load_buffer(&bytes, device)
        .map_err(|e| TrainError::corrupt_corpus(clip_id, format!("unreadable {name} file: {e}")))?;
    let tensor = tensors.remove(name).ok_or_else(|| {
        TrainError::corrupt_corpus(clip_id, format!("no tensor named \"{name}\" in {name} file"))
    })?;
    if tensor.dtype() != DType::F32 {
        return Err(TrainError::corrupt_corpus(
            clip_id,
            format!("{name} tensor must be f32, got {:?}", tensor.dtype()),
        ));
    }
    Ok(tensor)
}

/// Assembles the dense tensors for one batch: every clip loaded, audio and
/// video zero-padded up to the batch maxima, then stacked in draw order.
pub(crate) fn collate(batch: &Batch, device: &Device) -> Result<BatchTensors, TrainError> {
    let mut videos = Vec::with_capacity(batch.len());
    let mut audios = Vec::with_capacity(batch.len());
    for clip in &batch.clips {
        let (video, audio) = load_clip_tensors(clip, device)?;
        let frame_pad = batch.max_video_frames - clip.video_frames;
        let video = if frame_pad > 0 {
            video
                .pad_with_zeros(0, 0, frame_pad)
                .map_err(|e| TrainError::runtime("padding video tensor", e))?
        } else {
            video
        };
        let sample_pad = batch.max_audio_samples - clip.audio_samples;
        let audio = if sample_pad > 0 {
            audio
                .pad_with_zeros(0, 0, sample_pad)
                .map_err(|e| TrainError::runtime("padding audio tensor", e))?
        } else {
            audio
        };
        videos.push(video);
        audios.push(audio);
    }

    let video = Tensor::stack(&videos, 0)
        .map_err(|e| TrainError::runtime("stacking video batch", e))?;
    let audio = Tensor::stack(&audios, 0)
        .map_err(|e| TrainError::runtime("stacking audio batch", e))?;

    Ok(BatchTensors {
        epoch: batch.epoch,
        index_in_epoch: batch.index_in_epoch,
        clip_ids: batch.clips.iter().map(|c| c.id.clone()).collect(),
        video,
        audio,
    })
}

fn normalize_audio(samples: &[f32]) -> Vec<f32> {
    let n = samples.len() as f64;
    let mean = samples.iter().map(|&x| x as f64).sum::<f64>() / n;
    let var = samples
        .iter()
        .map(|&x| {
            let d = x as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    let std = var.sqrt().max(1e-7);
    samples
        .iter()
        .map(|&x| ((x as f64 - mean) / std) as f32)
        .collect()
}
