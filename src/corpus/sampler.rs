use std::collections::VecDeque;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::types::{Batch, Clip};

/// Bucket count is chosen so each bucket yields roughly this many batches.
const TARGET_BATCHES_PER_BUCKET: usize = 4;
const MAX_BUCKETS: usize = 8;

/// Draws shuffled, length-bucketed batches from one split.
///
/// Clips are grouped into duration buckets whose edges are quantiles of the
/// split's duration distribution, so similar-length clips share a batch and
/// padding waste stays bounded. Each epoch shuffles clips within buckets and
/// then the batch order, all from a generator seeded by (seed, epoch): the
/// same seed reproduces the same batch sequence, and every clip of the
/// split appears exactly once per epoch.
#[derive(Debug)]
pub struct BatchSampler {
    clips: Vec<Clip>,
    batch_size: usize,
    seed: u64,
    bucket_edges: Vec<f64>,
    epoch: usize,
    queue: VecDeque<Batch>,
}

impl BatchSampler {
    pub fn new(mut clips: Vec<Clip>, batch_size: usize, seed: u64) -> Self {
        assert!(batch_size > 0, "batch_size must be positive");
        clips.sort_by(|a, b| a.id.cmp(&b.id));
        let bucket_edges = derive_bucket_edges(&clips, batch_size);
        Self {
            clips,
            batch_size,
            seed,
            bucket_edges,
            epoch: 0,
            queue: VecDeque::new(),
        }
    }

    /// Number of batches every epoch yields. Constant across epochs because
    /// bucket membership depends only on clip durations.
    pub fn batches_per_epoch(&self) -> usize {
        self.bucket_lens()
            .into_iter()
            .map(|len| chunk_sizes(len, self.batch_size).len())
            .sum()
    }

    pub fn clip_count(&self) -> usize {
        self.clips.len()
    }

    /// Rebuilds the draw queue for `epoch`. Any undrawn batches of the
    /// previous epoch are discarded.
    pub fn begin_epoch(&mut self, epoch: usize) {
        self.epoch = epoch;
        let mut rng = StdRng::seed_from_u64(epoch_seed(self.seed, epoch));

        let mut buckets: Vec<Vec<Clip>> = vec![Vec::new(); self.bucket_edges.len() + 1];
        for clip in &self.clips {
            buckets[bucket_of(&self.bucket_edges, clip.duration_ms)].push(clip.clone());
        }

        let mut batches: Vec<Vec<Clip>> = Vec::new();
        for bucket in &mut buckets {
            bucket.shuffle(&mut rng);
            let mut offset = 0;
            for size in chunk_sizes(bucket.len(), self.batch_size) {
                batches.push(bucket[offset..offset + size].to_vec());
                offset += size;
            }
        }
        batches.shuffle(&mut rng);

        self.queue = batches
            .into_iter()
            .enumerate()
            .map(|(index, clips)| Batch::new(epoch, index, clips))
            .collect();
    }

    /// Draws the next batch of the current epoch. `None` signals the epoch
    /// is exhausted: every clip has been drawn exactly once. Not an error;
    /// call `begin_epoch` to start the next epoch.
    pub fn next_batch(&mut self) -> Option<Batch> {
        self.queue.pop_front()
    }

    /// Discards the first `n` batches of the current epoch, for resuming a
    /// run that stopped mid-epoch.
    pub fn skip_batches(&mut self, n: usize) {
        for _ in 0..n {
            if self.queue.pop_front().is_none() {
                break;
            }
        }
    }

    pub fn current_epoch(&self) -> usize {
        self.epoch
    }

    fn bucket_lens(&self) -> Vec<usize> {
        let mut lens = vec![0usize; self.bucket_edges.len() + 1];
        for clip in &self.clips {
            lens[bucket_of(&self.bucket_edges, clip.duration_ms)] += 1;
        }
        lens
    }
}

fn epoch_seed(seed: u64, epoch: usize) -> u64 {
    seed ^ (epoch as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

/// Quantile edges of the duration distribution. Fewer clips than
/// `TARGET_BATCHES_PER_BUCKET` batches per bucket would over-fragment, so
/// small splits collapse to a single bucket.
fn derive_bucket_edges(clips: &[Clip], batch_size: usize) -> Vec<f64> {
    let n = clips.len();
    let buckets = (n / (TARGET_BATCHES_PER_BUCKET * batch_size)).clamp(1, MAX_BUCKETS);
    if buckets <= 1 {
        return Vec::new();
    }
    let mut durations: Vec<f64> = clips.iter().map(|c| c.duration_ms).collect();
    durations.sort_by(f64::total_cmp);
    let mut edges: Vec<f64> = (1..buckets).map(|i| durations[i * n / buckets]).collect();
    // A bucket holding fewer than two clips would chunk into a single-clip
    // batch with no in-batch negatives; drop the edge isolating it so a
    // lone outlier duration joins its neighbor instead.
    loop {
        let mut lens = vec![0usize; edges.len() + 1];
        for clip in clips {
            lens[bucket_of(&edges, clip.duration_ms)] += 1;
        }
        match lens.iter().position(|&len| len < 2) {
            Some(0) => {
                edges.remove(0);
            }
            Some(i) => {
                edges.remove(i - 1);
            }
            None => break,
        }
    }
    edges
}

fn bucket_of(edges: &[f64], duration_ms: f64) -> usize {
    edges.iter().take_while(|edge| duration_ms > **edge).count()
}

/// Chunk lengths covering `len` items: full batches plus the remainder. A
/// remainder of one clip is folded into the preceding batch when possible,
/// because a single-clip batch has no in-batch negatives.
fn chunk_sizes(len: usize, batch_size: usize) -> Vec<usize> {
    if len == 0 {
        return Vec::new();
    }
    let mut sizes = Vec::with_capacity(len / batch_size + 1);
    let mut remaining = len;
    while remaining > 0 {
        let take = remaining.min(batch_size);
        sizes.push(take);
        remaining -= take;
    }
    if sizes.len() > 1 && *sizes.last().unwrap() == 1 {
        sizes.pop();
        *sizes.last_mut().unwrap() += 1;
    }
    sizes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Split;
    use std::collections::BTreeSet;
    use std::path::PathBuf;

    fn make_clip(id: &str, duration_ms: f64) -> Clip {
        let audio_samples = (duration_ms * 16.0) as usize;
        let video_frames = ((duration_ms / 1000.0) * 25.0).round() as usize;
        Clip {
            id: id.to_string(),
            video_path: PathBuf::from(format!("{id}/video.safetensors")),
            audio_path: PathBuf::from(format!("{id}/audio.safetensors")),
            video_frames: video_frames.max(1),
            video_fps: 25.0,
            audio_samples: audio_samples.max(1),
            audio_sample_rate_hz: 16_000,
            duration_ms,
            split: Split::Train,
        }
    }

    fn uniform_clips(count: usize) -> Vec<Clip> {
        (0..count)
            .map(|i| make_clip(&format!("clip_{i:03}"), 2000.0))
            .collect()
    }

    fn drain_ids(sampler: &mut BatchSampler) -> Vec<String> {
        let mut ids = Vec::new();
        while let Some(batch) = sampler.next_batch() {
            ids.extend(batch.clips.iter().map(|c| c.id.clone()));
        }
        ids
    }

    #[test]
    fn epoch_covers_split_exactly_once() {
        let mut sampler = BatchSampler::new(uniform_clips(11), 4, 7);
        sampler.begin_epoch(0);
        let ids = drain_ids(&mut sampler);
        assert_eq!(ids.len(), 11);
        let unique: BTreeSet<&String> = ids.iter().collect();
        assert_eq!(unique.len(), 11);
        assert!(sampler.next_batch().is_none());
    }

    #[test]
    fn same_seed_reproduces_batch_sequence() {
        let mut a = BatchSampler::new(uniform_clips(20), 4, 42);
        let mut b = BatchSampler::new(uniform_clips(20), 4, 42);
        a.begin_epoch(3);
        b.begin_epoch(3);
        assert_eq!(drain_ids(&mut a), drain_ids(&mut b));
    }

    #[test]
    fn different_epochs_reshuffle() {
        let mut sampler = BatchSampler::new(uniform_clips(20), 4, 42);
        sampler.begin_epoch(0);
        let first = drain_ids(&mut sampler);
        sampler.begin_epoch(1);
        let second = drain_ids(&mut sampler);
        assert_ne!(first, second);

        let first_set: BTreeSet<String> = first.into_iter().collect();
        let second_set: BTreeSet<String> = second.into_iter().collect();
        assert_eq!(first_set, second_set);
    }

    #[test]
    fn buckets_keep_batches_duration_homogeneous() {
        // 16 short and 16 long clips, enough for multiple buckets.
        let mut clips = Vec::new();
        for i in 0..16 {
            clips.push(make_clip(&format!("short_{i:02}"), 1000.0));
        }
        for i in 0..16 {
            clips.push(make_clip(&format!("long_{i:02}"), 3000.0));
        }
        let mut sampler = BatchSampler::new(clips, 2, 5);
        assert!(!sampler.bucket_edges.is_empty());
        sampler.begin_epoch(0);
        while let Some(batch) = sampler.next_batch() {
            let first = batch.clips[0].duration_ms;
            assert!(
                batch.clips.iter().all(|c| c.duration_ms == first),
                "mixed-duration batch: {:?}",
                batch.clips.iter().map(|c| &c.id).collect::<Vec<_>>()
            );
        }
    }

    #[test]
    fn singleton_remainder_folds_into_previous_batch() {
        assert_eq!(chunk_sizes(5, 2), vec![2, 3]);
        assert_eq!(chunk_sizes(4, 2), vec![2, 2]);
        assert_eq!(chunk_sizes(1, 2), vec![1]);
        assert_eq!(chunk_sizes(0, 2), Vec::<usize>::new());

        let mut sampler = BatchSampler::new(uniform_clips(5), 2, 1);
        sampler.begin_epoch(0);
        let mut sizes: Vec<usize> = Vec::new();
        while let Some(batch) = sampler.next_batch() {
            sizes.push(batch.len());
        }
        sizes.sort_unstable();
        assert_eq!(sizes, vec![2, 3]);
    }

    #[test]
    fn lone_outlier_duration_joins_a_neighboring_bucket() {
        // Fifteen clips of one duration plus one outlier: enough for two
        // buckets, and the quantile edge isolates the outlier on its own.
        let mut clips = uniform_clips(15);
        clips.push(make_clip("outlier", 9000.0));
        let mut sampler = BatchSampler::new(clips, 2, 3);
        sampler.begin_epoch(0);
        let mut total = 0;
        while let Some(batch) = sampler.next_batch() {
            assert!(
                batch.len() >= 2,
                "batch of {} clips has no in-batch negative",
                batch.len()
            );
            total += batch.len();
        }
        assert_eq!(total, 16);
    }

    #[test]
    fn batches_per_epoch_matches_drawn_count() {
        let mut sampler = BatchSampler::new(uniform_clips(13), 4, 9);
        let planned = sampler.batches_per_epoch();
        sampler.begin_epoch(0);
        let mut drawn = 0;
        while sampler.next_batch().is_some() {
            drawn += 1;
        }
        assert_eq!(planned, drawn);
    }

    #[test]
    fn skip_batches_resumes_mid_epoch() {
        let mut full = BatchSampler::new(uniform_clips(12), 4, 11);
        full.begin_epoch(2);
        let all: Vec<Batch> = std::iter::from_fn(|| full.next_batch()).collect();

        let mut resumed = BatchSampler::new(uniform_clips(12), 4, 11);
        resumed.begin_epoch(2);
        resumed.skip_batches(2);
        let rest: Vec<Batch> = std::iter::from_fn(|| resumed.next_batch()).collect();

        assert_eq!(rest.len(), all.len() - 2);
        for (a, b) in all.iter().skip(2).zip(rest.iter()) {
            let a_ids: Vec<&String> = a.clips.iter().map(|c| &c.id).collect();
            let b_ids: Vec<&String> = b.clips.iter().map(|c| &c.id).collect();
            assert_eq!(a_ids, b_ids);
            assert_eq!(a.index_in_epoch, b.index_in_epoch);
        }
    }

    #[test]
    fn batch_carries_padding_metadata() {
        let clips = vec![make_clip("a", 1000.0), make_clip("b", 2000.0)];
        let mut sampler = BatchSampler::new(clips, 2, 0);
        sampler.begin_epoch(0);
        let batch = sampler.next_batch().expect("one batch");
        assert_eq!(batch.max_video_frames, 50);
        assert_eq!(batch.max_audio_samples, 32_000);
    }
}
