use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::TrainError;
use crate::types::{Clip, Split};

/// Audio and video lengths of one clip may disagree by at most this much.
const DURATION_TOLERANCE_MS: f64 = 80.0;

const VIDEO_FILE: &str = "video.safetensors";
const AUDIO_FILE: &str = "audio.safetensors";
const META_FILE: &str = "meta.json";
const SPLIT_MANIFEST: &str = "splits.json";

#[derive(Debug, Clone, serde::Deserialize)]
struct ClipMeta {
    video_frames: usize,
    video_fps: f64,
    audio_samples: usize,
    audio_sample_rate_hz: u32,
}

/// Index over a preprocessed clip corpus.
///
/// A corpus directory holds one subdirectory per clip, named by the clip id
/// and containing `video.safetensors`, `audio.safetensors` and `meta.json`,
/// plus an optional `splits.json` manifest at the root. Indexing is a pure
/// function of directory content: the same directory always produces the
/// same id-to-clip mapping and split assignment.
#[derive(Debug)]
pub struct ClipStore {
    corpus_dir: PathBuf,
    clips: BTreeMap<String, Clip>,
}

impl ClipStore {
    /// Scans `corpus_dir` and validates every clip entry. Fails without a
    /// partial index: any missing file or inconsistent metadata aborts the
    /// whole scan, naming the offending clip.
    pub fn index(corpus_dir: &Path) -> Result<Self, TrainError> {
        let entries = fs::read_dir(corpus_dir)
            .map_err(|e| TrainError::io("reading corpus directory", e))?;

        let mut clip_dirs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| TrainError::io("reading corpus directory entry", e))?;
            let path = entry.path();
            if path.is_dir() {
                clip_dirs.push(path);
            }
        }
        clip_dirs.sort();

        let manifest = load_split_manifest(corpus_dir)?;

        let mut clips = BTreeMap::new();
        for dir in &clip_dirs {
            let clip = index_clip_dir(dir, manifest.as_ref())?;
            clips.insert(clip.id.clone(), clip);
        }

        if let Some(manifest) = manifest.as_ref() {
            for id in manifest.keys() {
                if !clips.contains_key(id) {
                    return Err(TrainError::missing_file(id.clone(), corpus_dir.join(id)));
                }
            }
        }

        tracing::info!(
            corpus_dir = %corpus_dir.display(),
            clips = clips.len(),
            manifest = manifest.is_some(),
            "indexed corpus"
        );

        Ok(Self {
            corpus_dir: corpus_dir.to_path_buf(),
            clips,
        })
    }

    pub fn corpus_dir(&self) -> &Path {
        &self.corpus_dir
    }

    pub fn len(&self) -> usize {
        self.clips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clips.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Clip> {
        self.clips.get(id)
    }

    pub fn clips(&self) -> impl Iterator<Item = &Clip> {
        self.clips.values()
    }

    /// Clips of one split, ordered by id.
    pub fn split(&self, split: Split) -> Vec<Clip> {
        self.clips
            .values()
            .filter(|clip| clip.split == split)
            .cloned()
            .collect()
    }
}

fn load_split_manifest(corpus_dir: &Path) -> Result<Option<HashMap<String, Split>>, TrainError> {
    let path = corpus_dir.join(SPLIT_MANIFEST);
    if !path.exists() {
        return Ok(None);
    }
    let data =
        fs::read_to_string(&path).map_err(|e| TrainError::io("reading splits.json", e))?;
    let manifest: HashMap<String, Split> =
        serde_json::from_str(&data).map_err(|e| TrainError::json("parsing splits.json", e))?;
    Ok(Some(manifest))
}

fn index_clip_dir(
    dir: &Path,
    manifest: Option<&HashMap<String, Split>>,
) -> Result<Clip, TrainError> {
    let id = match dir.file_name().and_then(|name| name.to_str()) {
        Some(name) => name.to_string(),
        None => {
            return Err(TrainError::corrupt_corpus(
                dir.to_string_lossy(),
                "clip directory name is not valid UTF-8",
            ))
        }
    };

    let video_path = dir.join(VIDEO_FILE);
    let audio_path = dir.join(AUDIO_FILE);
    let meta_path = dir.join(META_FILE);
    require_nonempty_file(&id, &video_path)?;
    require_nonempty_file(&id, &audio_path)?;
    require_nonempty_file(&id, &meta_path)?;

    let meta_data =
        fs::read_to_string(&meta_path).map_err(|e| TrainError::io("reading clip meta.json", e))?;
    let meta: ClipMeta = serde_json::from_str(&meta_data)
        .map_err(|e| TrainError::corrupt_corpus(&id, format!("invalid meta.json: {e}")))?;

    if meta.video_frames == 0 {
        return Err(TrainError::corrupt_corpus(&id, "meta.json reports zero video frames"));
    }
    if meta.audio_samples == 0 {
        return Err(TrainError::corrupt_corpus(&id, "meta.json reports zero audio samples"));
    }
    if !meta.video_fps.is_finite() || meta.video_fps <= 0.0 {
        return Err(TrainError::corrupt_corpus(
            &id,
            format!("meta.json reports invalid video_fps {}", meta.video_fps),
        ));
    }
    if meta.audio_sample_rate_hz == 0 {
        return Err(TrainError::corrupt_corpus(
            &id,
            "meta.json reports zero audio sample rate",
        ));
    }

    let video_ms = meta.video_frames as f64 / meta.video_fps * 1000.0;
    let audio_ms = meta.audio_samples as f64 / meta.audio_sample_rate_hz as f64 * 1000.0;
    if (video_ms - audio_ms).abs() > DURATION_TOLERANCE_MS {
        return Err(TrainError::corrupt_corpus(
            &id,
            format!(
                "audio and video lengths disagree: video {video_ms:.1} ms vs audio {audio_ms:.1} ms"
            ),
        ));
    }

    let split = match manifest {
        Some(manifest) => match manifest.get(&id) {
            Some(split) => *split,
            None => {
                return Err(TrainError::corrupt_corpus(
                    &id,
                    "clip is not assigned a split in splits.json",
                ))
            }
        },
        None => hash_split(&id),
    };

    Ok(Clip {
        id,
        video_path,
        audio_path,
        video_frames: meta.video_frames,
        video_fps: meta.video_fps,
        audio_samples: meta.audio_samples,
        audio_sample_rate_hz: meta.audio_sample_rate_hz,
        duration_ms: audio_ms,
        split,
    })
}

fn require_nonempty_file(clip_id: &str, path: &Path) -> Result<(), TrainError> {
    match fs::metadata(path) {
        Ok(meta) => {
            if meta.len() == 0 {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                return Err(TrainError::corrupt_corpus(
                    clip_id,
                    format!("{name} is empty (0 bytes)"),
                ));
            }
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(TrainError::missing_file(clip_id, path))
        }
        Err(e) => Err(TrainError::io("probing clip file", e)),
    }
}

/// Fallback split rule when no manifest exists: a stable FNV-1a hash of the
/// clip id modulo 10 sends 8/10 of clips to train, 1/10 to validation and
/// 1/10 to test. FNV-1a is spelled out here because the assignment must not
/// move between runs or hosts.
fn hash_split(id: &str) -> Split {
    match fnv1a64(id.as_bytes()) % 10 {
        8 => Split::Validation,
        9 => Split::Test,
        _ => Split::Train,
    }
}

fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &byte in bytes {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_corpus(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "avalign-store-{name}-{}",
            std::process::id()
        ));
        if dir.exists() {
            fs::remove_dir_all(&dir).expect("clear stale corpus dir");
        }
        fs::create_dir_all(&dir).expect("create corpus dir");
        dir
    }

    fn write_clip(corpus: &Path, id: &str, video_frames: usize, audio_samples: usize) {
        let dir = corpus.join(id);
        fs::create_dir_all(&dir).expect("create clip dir");
        fs::write(dir.join(VIDEO_FILE), b"v").expect("write video placeholder");
        fs::write(dir.join(AUDIO_FILE), b"a").expect("write audio placeholder");
        let meta = format!(
            r#"{{"video_frames": {video_frames}, "video_fps": 25.0, "audio_samples": {audio_samples}, "audio_sample_rate_hz": 16000}}"#
        );
        fs::write(dir.join(META_FILE), meta).expect("write meta");
    }

    #[test]
    fn indexing_is_deterministic() {
        let corpus = temp_corpus("deterministic");
        write_clip(&corpus, "c0", 25, 16_000);
        write_clip(&corpus, "c1", 50, 32_000);
        write_clip(&corpus, "c2", 75, 48_000);

        let first = ClipStore::index(&corpus).expect("first index");
        let second = ClipStore::index(&corpus).expect("second index");
        fs::remove_dir_all(&corpus).ok();

        assert_eq!(first.len(), 3);
        let first_clips: Vec<&Clip> = first.clips().collect();
        let second_clips: Vec<&Clip> = second.clips().collect();
        assert_eq!(first_clips, second_clips);
    }

    #[test]
    fn missing_audio_names_the_clip() {
        let corpus = temp_corpus("missing-audio");
        write_clip(&corpus, "c0", 25, 16_000);
        fs::remove_file(corpus.join("c0").join(AUDIO_FILE)).expect("drop audio");

        let err = ClipStore::index(&corpus).expect_err("missing audio must fail");
        fs::remove_dir_all(&corpus).ok();
        match err {
            TrainError::MissingFile { clip_id, path } => {
                assert_eq!(clip_id, "c0");
                assert!(path.ends_with(AUDIO_FILE));
            }
            other => panic!("expected MissingFile, got {other:?}"),
        }
    }

    #[test]
    fn empty_audio_file_is_corrupt() {
        let corpus = temp_corpus("empty-audio");
        write_clip(&corpus, "c0", 25, 16_000);
        fs::write(corpus.join("c0").join(AUDIO_FILE), b"").expect("truncate audio");

        let err = ClipStore::index(&corpus).expect_err("empty audio must fail");
        fs::remove_dir_all(&corpus).ok();
        match err {
            TrainError::CorruptCorpus { clip_id, reason } => {
                assert_eq!(clip_id, "c0");
                assert!(reason.contains("0 bytes"));
            }
            other => panic!("expected CorruptCorpus, got {other:?}"),
        }
    }

    #[test]
    fn length_disagreement_is_corrupt() {
        let corpus = temp_corpus("length-drift");
        // 25 frames at 25 fps is 1000 ms; 32000 samples at 16 kHz is 2000 ms.
        write_clip(&corpus, "c0", 25, 32_000);

        let err = ClipStore::index(&corpus).expect_err("length drift must fail");
        fs::remove_dir_all(&corpus).ok();
        match err {
            TrainError::CorruptCorpus { clip_id, reason } => {
                assert_eq!(clip_id, "c0");
                assert!(reason.contains("disagree"));
            }
            other => panic!("expected CorruptCorpus, got {other:?}"),
        }
    }

    #[test]
    fn manifest_overrides_hash_split() {
        let corpus = temp_corpus("manifest");
        write_clip(&corpus, "c0", 25, 16_000);
        write_clip(&corpus, "c1", 25, 16_000);
        fs::write(
            corpus.join(SPLIT_MANIFEST),
            r#"{"c0": "validation", "c1": "train"}"#,
        )
        .expect("write manifest");

        let store = ClipStore::index(&corpus).expect("manifest corpus indexes");
        fs::remove_dir_all(&corpus).ok();
        assert_eq!(store.get("c0").map(|c| c.split), Some(Split::Validation));
        assert_eq!(store.get("c1").map(|c| c.split), Some(Split::Train));
    }

    #[test]
    fn manifest_must_cover_every_clip() {
        let corpus = temp_corpus("manifest-gap");
        write_clip(&corpus, "c0", 25, 16_000);
        write_clip(&corpus, "c1", 25, 16_000);
        fs::write(corpus.join(SPLIT_MANIFEST), r#"{"c0": "train"}"#).expect("write manifest");

        let err = ClipStore::index(&corpus).expect_err("uncovered clip must fail");
        fs::remove_dir_all(&corpus).ok();
        match err {
            TrainError::CorruptCorpus { clip_id, .. } => assert_eq!(clip_id, "c1"),
            other => panic!("expected CorruptCorpus, got {other:?}"),
        }
    }

    #[test]
    fn manifest_entry_for_absent_clip_is_missing_file() {
        let corpus = temp_corpus("manifest-ghost");
        write_clip(&corpus, "c0", 25, 16_000);
        fs::write(
            corpus.join(SPLIT_MANIFEST),
            r#"{"c0": "train", "ghost": "test"}"#,
        )
        .expect("write manifest");

        let err = ClipStore::index(&corpus).expect_err("ghost entry must fail");
        fs::remove_dir_all(&corpus).ok();
        match err {
            TrainError::MissingFile { clip_id, .. } => assert_eq!(clip_id, "ghost"),
            other => panic!("expected MissingFile, got {other:?}"),
        }
    }

    #[test]
    fn hash_split_is_stable() {
        // Pinned value: a changed hash would silently reshuffle every
        // corpus indexed without a manifest.
        assert_eq!(fnv1a64(b""), 0xcbf2_9ce4_8422_2325);
        let split = hash_split("episode_001_clip_0042");
        assert_eq!(split, hash_split("episode_001_clip_0042"));
        let ids: Vec<String> = (0..200).map(|i| format!("clip_{i:04}")).collect();
        let val = ids.iter().filter(|id| hash_split(id) == Split::Validation).count();
        let test = ids.iter().filter(|id| hash_split(id) == Split::Test).count();
        // Both held-out splits must be populated for a corpus of 200 ids.
        assert!(val > 0 && test > 0);
    }
}
