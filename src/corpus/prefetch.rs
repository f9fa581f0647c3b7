use std::collections::BTreeMap;
use std::thread::JoinHandle;
use std::time::Duration;

use candle_core::Device;
use crossbeam_channel::{bounded, Receiver};

use crate::corpus::collate::collate;
use crate::error::TrainError;
use crate::types::{Batch, BatchTensors};

const IO_RETRIES: usize = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Collates batches ahead of the training loop on a small worker pool.
///
/// Workers pull sequence-numbered tasks from a bounded channel and push
/// collated tensors into a bounded result channel; the consumer reorders
/// results by sequence number, so delivery order always equals submission
/// order no matter which worker finishes first. Bounded channels cap how
/// far the readers can run ahead of the optimizer.
pub(crate) struct Prefetcher {
    result_rx: Option<Receiver<(usize, Result<BatchTensors, TrainError>)>>,
    reorder: BTreeMap<usize, Result<BatchTensors, TrainError>>,
    next_index: usize,
    total: usize,
    workers: Vec<JoinHandle<()>>,
    feeder: Option<JoinHandle<()>>,
}

impl Prefetcher {
    pub(crate) fn spawn(
        batches: Vec<Batch>,
        worker_count: usize,
        depth: usize,
        device: Device,
    ) -> Result<Self, TrainError> {
        let total = batches.len();
        let (task_tx, task_rx) = bounded::<(usize, Batch)>(depth);
        let (result_tx, result_rx) =
            bounded::<(usize, Result<BatchTensors, TrainError>)>(depth.max(worker_count));

        let feeder = std::thread::Builder::new()
            .name("prefetch-feeder".to_string())
            .spawn(move || {
                for task in batches.into_iter().enumerate() {
                    if task_tx.send(task).is_err() {
                        break;
                    }
                }
            })
            .map_err(|e| TrainError::io("spawning prefetch feeder", e))?;

        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let task_rx = task_rx.clone();
            let result_tx = result_tx.clone();
            let device = device.clone();
            let handle = std::thread::Builder::new()
                .name(format!("prefetch-{worker_id}"))
                .spawn(move || {
                    while let Ok((index, batch)) = task_rx.recv() {
                        let result = collate_with_retry(&batch, &device);
                        if result_tx.send((index, result)).is_err() {
                            break;
                        }
                    }
                })
                .map_err(|e| TrainError::io("spawning prefetch worker", e))?;
            workers.push(handle);
        }
        drop(task_rx);
        drop(result_tx);

        Ok(Self {
            result_rx: Some(result_rx),
            reorder: BTreeMap::new(),
            next_index: 0,
            total,
            workers,
            feeder: Some(feeder),
        })
    }

    /// Next batch in submission order, or `None` when all batches have been
    /// delivered. A worker error is delivered at the position of the batch
    /// that failed.
    pub(crate) fn next(&mut self) -> Option<Result<BatchTensors, TrainError>> {
        if self.next_index >= self.total {
            return None;
        }
        let result_rx = self.result_rx.as_ref()?;
        loop {
            if let Some(result) = self.reorder.remove(&self.next_index) {
                self.next_index += 1;
                return Some(result);
            }
            match result_rx.recv() {
                Ok((index, result)) => {
                    self.reorder.insert(index, result);
                }
                Err(_) => {
                    self.next_index = self.total;
                    return Some(Err(TrainError::runtime(
                        "prefetching batches",
                        "prefetch workers exited before delivering all batches",
                    )));
                }
            }
        }
    }
}

impl Drop for Prefetcher {
    fn drop(&mut self) {
        // Closing the result channel unblocks any worker mid-send; workers
        // then drop their task receivers, which unblocks the feeder.
        self.reorder.clear();
        drop(self.result_rx.take());
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        if let Some(feeder) = self.feeder.take() {
            let _ = feeder.join();
        }
    }
}

/// Runs `collate`, retrying `IO_RETRIES` times on I/O errors. Only `Io` is
/// retried; a decode failure is deterministic and escalates immediately.
fn collate_with_retry(batch: &Batch, device: &Device) -> Result<BatchTensors, TrainError> {
    let mut attempt = 0;
    loop {
        match collate(batch, device) {
            Err(TrainError::Io { context: _, source }) if attempt < IO_RETRIES => {
                attempt += 1;
                tracing::warn!(
                    batch_index = batch.index_in_epoch,
                    attempt,
                    error = %source,
                    "transient I/O during prefetch, retrying"
                );
                std::thread::sleep(RETRY_BACKOFF);
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Clip, Split};
    use candle_core::Tensor;
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};

    fn write_clip_files(dir: &Path, frames: usize, samples: usize) {
        std::fs::create_dir_all(dir).expect("create clip dir");
        let device = Device::Cpu;
        let video_data: Vec<f32> = (0..frames * 3 * 4 * 4).map(|i| i as f32 * 0.01).collect();
        let video =
            Tensor::from_vec(video_data, (frames, 3, 4, 4), &device).expect("video tensor");
        let audio_data: Vec<f32> = (0..samples).map(|i| (i as f32 * 0.5).sin()).collect();
        let audio = Tensor::from_vec(audio_data, samples, &device).expect("audio tensor");

        let mut video_map = HashMap::new();
        video_map.insert("video".to_string(), video);
        candle_core::safetensors::save(&video_map, dir.join("video.safetensors"))
            .expect("save video");
        let mut audio_map = HashMap::new();
        audio_map.insert("audio".to_string(), audio);
        candle_core::safetensors::save(&audio_map, dir.join("audio.safetensors"))
            .expect("save audio");
    }

    fn make_clip(dir: &Path, id: &str) -> Clip {
        Clip {
            id: id.to_string(),
            video_path: dir.join("video.safetensors"),
            audio_path: dir.join("audio.safetensors"),
            video_frames: 2,
            video_fps: 25.0,
            audio_samples: 640,
            audio_sample_rate_hz: 16_000,
            duration_ms: 40.0,
            split: Split::Train,
        }
    }

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "avalign-prefetch-{name}-{}",
            std::process::id()
        ));
        if dir.exists() {
            std::fs::remove_dir_all(&dir).expect("clear stale dir");
        }
        dir
    }

    #[test]
    fn delivers_batches_in_submission_order() {
        let root = temp_dir("order");
        let mut batches = Vec::new();
        for i in 0..6 {
            let dir = root.join(format!("c{i}"));
            write_clip_files(&dir, 2, 640);
            let clips = vec![make_clip(&dir, &format!("c{i}"))];
            batches.push(Batch::new(0, i, clips));
        }

        let mut prefetcher =
            Prefetcher::spawn(batches, 3, 2, Device::Cpu).expect("spawn prefetcher");
        let mut seen = Vec::new();
        while let Some(result) = prefetcher.next() {
            let tensors = result.expect("batch collates");
            seen.push(tensors.index_in_epoch);
        }
        std::fs::remove_dir_all(&root).ok();
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn failed_batch_surfaces_at_its_position() {
        let root = temp_dir("fail");
        let mut batches = Vec::new();
        for i in 0..3 {
            let dir = root.join(format!("c{i}"));
            if i != 1 {
                write_clip_files(&dir, 2, 640);
            }
            let clips = vec![make_clip(&dir, &format!("c{i}"))];
            batches.push(Batch::new(0, i, clips));
        }

        let mut prefetcher =
            Prefetcher::spawn(batches, 2, 2, Device::Cpu).expect("spawn prefetcher");
        let first = prefetcher.next().expect("first delivery");
        assert_eq!(first.expect("batch 0 ok").index_in_epoch, 0);
        let second = prefetcher.next().expect("second delivery");
        assert!(second.is_err(), "batch 1 must fail");
        let third = prefetcher.next().expect("third delivery");
        assert_eq!(third.expect("batch 2 ok").index_in_epoch, 2);
        assert!(prefetcher.next().is_none());
        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn early_drop_does_not_hang() {
        let root = temp_dir("drop");
        let mut batches = Vec::new();
        for i in 0..8 {
            let dir = root.join(format!("c{i}"));
            write_clip_files(&dir, 2, 640);
            let clips = vec![make_clip(&dir, &format!("c{i}"))];
            batches.push(Batch::new(0, i, clips));
        }

        let mut prefetcher =
            Prefetcher::spawn(batches, 2, 2, Device::Cpu).expect("spawn prefetcher");
        let _ = prefetcher.next();
        drop(prefetcher);
        std::fs::remove_dir_all(&root).ok();
    }
}
