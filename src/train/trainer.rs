//! Training orchestration: epochs, optimizer steps, checkpoints, evaluation.
//!
//! The trainer owns every piece of mutable training state and applies
//! parameter updates strictly sequentially on the caller's thread; prefetch
//! workers only ever read clip files. Interrupts are honored between steps,
//! never inside one, so the checkpoint written on the way out is always a
//! step boundary a later run can resume from.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::TrainConfig;
use crate::corpus::{collate, BatchSampler, ClipStore, Prefetcher};
use crate::error::TrainError;
use crate::model::{AlignmentModel, SpeechEncoder};
use crate::train::checkpoint::{self, CheckpointState, CheckpointStore, SCHEMA_VERSION};
use crate::train::metrics::{recall_at_k, EvalReport, LossMeter};
use crate::train::optim::AdamW;
use crate::types::{Batch, BatchTensors, Split};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Initializing,
    Running,
    Checkpointing,
    Evaluating,
    Finished,
    Failed,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Phase::Initializing => "initializing",
            Phase::Running => "running",
            Phase::Checkpointing => "checkpointing",
            Phase::Evaluating => "evaluating",
            Phase::Finished => "finished",
            Phase::Failed => "failed",
        }
    }
}

/// How a completed `run()` ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// All configured epochs ran to completion.
    Finished,
    /// The interrupt flag was raised; the in-flight step completed and a
    /// checkpoint was written before returning.
    Interrupted,
}

pub struct Trainer {
    config: TrainConfig,
    device: Device,
    store: ClipStore,
    sampler: BatchSampler,
    speech: SpeechEncoder,
    model: AlignmentModel,
    head_vars: VarMap,
    optimizer: AdamW,
    checkpoints: CheckpointStore,
    interrupt: Arc<AtomicBool>,
    phase: Phase,
    epoch: usize,
    step: u64,
    step_in_epoch: usize,
    last_checkpoint_step: Option<u64>,
    last_eval_step: Option<u64>,
    eval_history: Vec<EvalReport>,
}

impl Trainer {
    /// Builds a trainer for a fresh run. Two trainers built from the same
    /// configuration start from bit-identical parameters.
    pub fn new(config: TrainConfig) -> Result<Self, TrainError> {
        Self::build(config, None)
    }

    /// Builds a trainer positioned at a previously written checkpoint.
    pub fn resume(config: TrainConfig, checkpoint_dir: &Path) -> Result<Self, TrainError> {
        Self::build(config, Some(checkpoint_dir))
    }

    /// Resumes from the checkpoint named by `latest.json` under the
    /// configured output directory.
    pub fn resume_latest(config: TrainConfig) -> Result<Self, TrainError> {
        let store = CheckpointStore::new(&config.output_dir)?;
        let dir = store.resolve_latest()?;
        Self::build(config, Some(&dir))
    }

    fn build(config: TrainConfig, resume_from: Option<&Path>) -> Result<Self, TrainError> {
        config.validate()?;
        tracing::debug!(phase = "initializing", "trainer state");

        // Checkpoint metadata is validated before any heavy loading, so an
        // incompatible resume aborts without touching model weights.
        let resume_state = match resume_from {
            Some(dir) => {
                let state = checkpoint::read_state(dir)?;
                checkpoint::validate_compatible(dir, &state.config, &config)?;
                Some((dir.to_path_buf(), state))
            }
            None => None,
        };

        let device = config.resolve_device()?;
        let store = ClipStore::index(&config.corpus_dir)?;
        let train_clips = store.split(Split::Train);
        if train_clips.is_empty() {
            return Err(TrainError::runtime(
                "planning training run",
                format!(
                    "corpus at '{}' has an empty train split",
                    store.corpus_dir().display()
                ),
            ));
        }
        let sampler = BatchSampler::new(train_clips, config.batch_size, config.seed);

        let mut speech = SpeechEncoder::load(&config, &device)?;

        let mut head_vars = VarMap::new();
        let vb = VarBuilder::from_varmap(&head_vars, DType::F32, &device);
        let model = AlignmentModel::load(&config, speech.hidden_size(), vb)
            .map_err(|e| TrainError::runtime("building alignment model", e))?;
        seeded_init(&head_vars, config.seed)
            .map_err(|e| TrainError::runtime("initializing alignment model", e))?;

        let mut params: Vec<(String, Var)> = {
            let data = head_vars.data().lock().unwrap();
            data.iter().map(|(n, v)| (n.clone(), v.clone())).collect()
        };
        params.extend(
            speech
                .trainable()
                .iter()
                .map(|(n, v)| (n.clone(), v.clone())),
        );
        let mut optimizer = AdamW::new(params, config.learning_rate)
            .map_err(|e| TrainError::runtime("building optimizer", e))?;

        let checkpoints = CheckpointStore::new(&config.output_dir)?;

        let (mut epoch, step, mut step_in_epoch, last_checkpoint_step) = match &resume_state {
            Some((dir, state)) => {
                head_vars
                    .load(checkpoint::model_file(dir))
                    .map_err(|e| TrainError::checkpoint_mismatch(dir, e))?;
                if config.fine_tune_encoder {
                    speech
                        .restore_vars(&checkpoint::encoder_file(dir))
                        .map_err(|e| TrainError::checkpoint_mismatch(dir, e))?;
                }
                let optimizer_state =
                    candle_core::safetensors::load(checkpoint::optimizer_file(dir), &device)
                        .map_err(|e| TrainError::checkpoint_mismatch(dir, e))?;
                optimizer
                    .load_state_tensors(optimizer_state)
                    .map_err(|e| TrainError::checkpoint_mismatch(dir, e))?;
                if optimizer.optimizer_steps() != state.optimizer_steps {
                    return Err(TrainError::checkpoint_mismatch(
                        dir,
                        format!(
                            "optimizer step count {} does not match state.json ({})",
                            optimizer.optimizer_steps(),
                            state.optimizer_steps
                        ),
                    ));
                }
                if state.config.learning_rate != optimizer.learning_rate() {
                    tracing::info!(
                        from = state.config.learning_rate,
                        to = optimizer.learning_rate(),
                        "learning rate changed across resume"
                    );
                }
                tracing::info!(
                    checkpoint = %dir.display(),
                    epoch = state.epoch,
                    step = state.step,
                    "resumed from checkpoint"
                );
                (
                    state.epoch.max(1),
                    state.step,
                    state.step_in_epoch,
                    Some(state.step),
                )
            }
            None => (1, 0, 0, None),
        };

        // A checkpoint written at an epoch boundary resumes into the next
        // epoch rather than replaying an empty remainder.
        if step_in_epoch >= sampler.batches_per_epoch() && epoch < config.num_epochs {
            epoch += 1;
            step_in_epoch = 0;
        }

        tracing::info!(
            clips = store.len(),
            train_clips = sampler.clip_count(),
            batches_per_epoch = sampler.batches_per_epoch(),
            epochs = config.num_epochs,
            fine_tune_encoder = config.fine_tune_encoder,
            "trainer ready"
        );

        Ok(Self {
            config,
            device,
            store,
            sampler,
            speech,
            model,
            head_vars,
            optimizer,
            checkpoints,
            interrupt: Arc::new(AtomicBool::new(false)),
            phase: Phase::Initializing,
            epoch,
            step,
            step_in_epoch,
            last_checkpoint_step,
            last_eval_step: None,
            eval_history: Vec::new(),
        })
    }

    /// Flag checked between optimizer steps; setting it makes `run` finish
    /// the in-flight step, write a checkpoint, and return
    /// [`RunOutcome::Interrupted`].
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        self.interrupt.clone()
    }

    /// Total optimizer steps a full run of this configuration performs.
    pub fn planned_steps(&self) -> u64 {
        (self.sampler.batches_per_epoch() * self.config.num_epochs) as u64
    }

    pub fn completed_steps(&self) -> u64 {
        self.step
    }

    pub fn eval_history(&self) -> &[EvalReport] {
        &self.eval_history
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    /// Runs the configured epochs to completion, interrupt, or failure.
    pub fn run(&mut self) -> Result<RunOutcome, TrainError> {
        self.run_with_observer(|_, _| {})
    }

    /// Like [`Self::run`], invoking `observer(step, loss)` after every
    /// optimizer step.
    pub fn run_with_observer(
        &mut self,
        mut observer: impl FnMut(u64, f64),
    ) -> Result<RunOutcome, TrainError> {
        match self.run_inner(&mut observer) {
            Ok(outcome) => {
                self.set_phase(Phase::Finished);
                Ok(outcome)
            }
            Err(err) => {
                self.best_effort_checkpoint(&err);
                self.set_phase(Phase::Failed);
                Err(err)
            }
        }
    }

    fn run_inner(
        &mut self,
        observer: &mut impl FnMut(u64, f64),
    ) -> Result<RunOutcome, TrainError> {
        loop {
            self.set_phase(Phase::Running);
            if self.interrupt.load(Ordering::Relaxed) {
                self.checkpoint_if_new()?;
                return Ok(RunOutcome::Interrupted);
            }
            let interrupted = self.run_epoch(observer)?;
            if interrupted {
                self.checkpoint_if_new()?;
                tracing::info!(
                    epoch = self.epoch,
                    step = self.step,
                    "interrupt honored after completing the in-flight step"
                );
                return Ok(RunOutcome::Interrupted);
            }
            self.evaluate_if_new()?;
            if self.epoch >= self.config.num_epochs {
                break;
            }
            self.epoch += 1;
            self.step_in_epoch = 0;
        }
        self.checkpoint_if_new()?;
        Ok(RunOutcome::Finished)
    }

    /// Runs the remainder of the current epoch. Returns `true` when the
    /// epoch stopped early because the interrupt flag was raised.
    fn run_epoch(&mut self, observer: &mut impl FnMut(u64, f64)) -> Result<bool, TrainError> {
        self.sampler.begin_epoch(self.epoch);
        if self.step_in_epoch > 0 {
            self.sampler.skip_batches(self.step_in_epoch);
            tracing::debug!(
                epoch = self.epoch,
                skipped = self.step_in_epoch,
                "replaying epoch from checkpoint position"
            );
        }
        let mut planned = Vec::new();
        while let Some(batch) = self.sampler.next_batch() {
            planned.push(batch);
        }
        if planned.is_empty() {
            return Ok(false);
        }

        let mut prefetcher = Prefetcher::spawn(
            planned,
            self.config.prefetch_workers,
            self.config.prefetch_depth,
            self.device.clone(),
        )?;
        while let Some(result) = prefetcher.next() {
            let tensors = result?;
            let loss = self.train_step(&tensors)?;
            observer(self.step, loss);
            if self.step % self.config.checkpoint_interval == 0 {
                self.checkpoint_if_new()?;
            }
            if self.step % self.config.eval_interval == 0 {
                self.evaluate_if_new()?;
            }
            if self.interrupt.load(Ordering::Relaxed) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// One forward/backward/update pass. The loss is checked for finiteness
    /// before any parameter changes, so a divergent batch never contaminates
    /// the weights a best-effort checkpoint would then save.
    fn train_step(&mut self, tensors: &BatchTensors) -> Result<f64, TrainError> {
        let frames = self
            .speech
            .encode(&tensors.audio)
            .map_err(|e| TrainError::runtime("encoding audio batch", e))?;
        let audio = self
            .model
            .embed_audio(&frames)
            .map_err(|e| TrainError::runtime("embedding audio batch", e))?;
        let video = self
            .model
            .embed_video(&tensors.video)
            .map_err(|e| TrainError::runtime("embedding video batch", e))?;
        let scores = AlignmentModel::score_matrix(&audio, &video)
            .map_err(|e| TrainError::runtime("scoring batch", e))?;
        let loss = self
            .model
            .loss(&scores)
            .map_err(|e| TrainError::runtime("computing loss", e))?;
        let loss_value = loss
            .to_scalar::<f32>()
            .map_err(|e| TrainError::runtime("reading loss", e))? as f64;
        if !loss_value.is_finite() {
            return Err(TrainError::Diverged {
                step: self.step + 1,
                loss: loss_value,
            });
        }
        let grads = loss
            .backward()
            .map_err(|e| TrainError::runtime("backpropagating loss", e))?;
        self.optimizer
            .step(&grads)
            .map_err(|e| TrainError::runtime("applying optimizer step", e))?;
        self.step += 1;
        self.step_in_epoch += 1;
        tracing::debug!(
            epoch = self.epoch,
            step = self.step,
            batch = tensors.index_in_epoch,
            loss = loss_value,
            "optimizer step"
        );
        Ok(loss_value)
    }

    /// Writes a checkpoint unless one already exists for the current step.
    fn checkpoint_if_new(&mut self) -> Result<(), TrainError> {
        if self.last_checkpoint_step == Some(self.step) {
            return Ok(());
        }
        self.set_phase(Phase::Checkpointing);
        let state = CheckpointState {
            schema_version: SCHEMA_VERSION,
            epoch: self.epoch,
            step: self.step,
            step_in_epoch: self.step_in_epoch,
            optimizer_steps: self.optimizer.optimizer_steps(),
            written_at: Utc::now().to_rfc3339(),
            config: self.config.clone(),
        };
        let optimizer_state = self
            .optimizer
            .state_tensors()
            .map_err(|e| TrainError::runtime("exporting optimizer state", e))?;
        let encoder = self.speech.is_fine_tune().then_some(&self.speech);
        self.checkpoints
            .save(&state, &self.head_vars, encoder, &optimizer_state)?;
        self.last_checkpoint_step = Some(self.step);
        self.set_phase(Phase::Running);
        Ok(())
    }

    /// Evaluates unless this step was already evaluated, so an interval
    /// firing on the last batch of an epoch does not evaluate twice.
    fn evaluate_if_new(&mut self) -> Result<(), TrainError> {
        if self.last_eval_step == Some(self.step) {
            return Ok(());
        }
        self.set_phase(Phase::Evaluating);
        self.run_evaluation()?;
        self.last_eval_step = Some(self.step);
        self.set_phase(Phase::Running);
        Ok(())
    }

    /// Scores the ordered validation split without touching parameters or
    /// optimizer state.
    fn run_evaluation(&mut self) -> Result<(), TrainError> {
        let clips = self.store.split(Split::Validation);
        if clips.is_empty() {
            tracing::debug!("validation split is empty, skipping evaluation");
            return Ok(());
        }
        let clip_count = clips.len();
        let mut meter = LossMeter::default();
        let mut audio_embeds = Vec::new();
        let mut video_embeds = Vec::new();
        for (chunk_index, chunk) in clips.chunks(self.config.batch_size).enumerate() {
            let batch = Batch::new(self.epoch, chunk_index, chunk.to_vec());
            let tensors = collate::collate(&batch, &self.device)?;
            let (audio, video, loss) = self
                .eval_batch(&tensors)
                .map_err(|e| TrainError::runtime("evaluating validation split", e))?;
            if let Some(loss) = loss {
                meter.push(loss);
            }
            audio_embeds.push(audio);
            video_embeds.push(video);
        }
        let report = self
            .eval_report(clip_count, meter, &audio_embeds, &video_embeds)
            .map_err(|e| TrainError::runtime("evaluating validation split", e))?;
        tracing::info!(
            epoch = report.epoch,
            step = report.step,
            clips = report.clips,
            mean_loss = report.mean_loss,
            recall_at_1 = report.recall_at_1,
            recall_at_10 = report.recall_at_10,
            "evaluation"
        );
        self.eval_history.push(report);
        Ok(())
    }

    fn eval_batch(
        &self,
        tensors: &BatchTensors,
    ) -> candle_core::Result<(Tensor, Tensor, Option<f64>)> {
        let frames = self.speech.encode(&tensors.audio)?;
        let audio = self.model.embed_audio(&frames)?;
        let video = self.model.embed_video(&tensors.video)?;
        // A trailing single-clip chunk has no in-batch negatives to score.
        let loss = if tensors.len() >= 2 {
            let scores = AlignmentModel::score_matrix(&audio, &video)?;
            Some(self.model.loss(&scores)?.to_scalar::<f32>()? as f64)
        } else {
            None
        };
        Ok((audio.detach(), video.detach(), loss))
    }

    fn eval_report(
        &self,
        clip_count: usize,
        meter: LossMeter,
        audio_embeds: &[Tensor],
        video_embeds: &[Tensor],
    ) -> candle_core::Result<EvalReport> {
        let audio = Tensor::cat(audio_embeds, 0)?;
        let video = Tensor::cat(video_embeds, 0)?;
        let scores = AlignmentModel::score_matrix(&audio, &video)?;
        Ok(EvalReport {
            epoch: self.epoch,
            step: self.step,
            clips: clip_count,
            mean_loss: meter.mean(),
            recall_at_1: recall_at_k(&scores, 1)?,
            recall_at_10: recall_at_k(&scores, 10)?,
        })
    }

    /// Parameters are still healthy when a fatal error surfaces mid-run, so
    /// try to preserve the progress before reporting the failure.
    fn best_effort_checkpoint(&mut self, cause: &TrainError) {
        if self.step == 0 || self.last_checkpoint_step == Some(self.step) {
            return;
        }
        tracing::warn!(
            error = %cause,
            step = self.step,
            "writing checkpoint before surfacing failure"
        );
        if let Err(save_err) = self.checkpoint_if_new() {
            tracing::warn!(error = %save_err, "best-effort checkpoint failed");
        }
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.phase == phase {
            return;
        }
        if matches!(phase, Phase::Finished | Phase::Failed) {
            tracing::info!(
                from = self.phase.as_str(),
                to = phase.as_str(),
                epoch = self.epoch,
                step = self.step,
                "trainer state"
            );
        } else {
            tracing::debug!(
                from = self.phase.as_str(),
                to = phase.as_str(),
                epoch = self.epoch,
                step = self.step,
                "trainer state"
            );
        }
        self.phase = phase;
    }
}

/// Deterministic parameter init: name-sorted traversal with a single seeded
/// generator, uniform fan-in scaling for matrices and kernels, zeros for
/// biases and gains. Two maps holding the same names end up bit-identical.
fn seeded_init(vars: &VarMap, seed: u64) -> candle_core::Result<()> {
    let data = vars.data().lock().unwrap();
    let mut names: Vec<&String> = data.keys().collect();
    names.sort();
    let mut rng = StdRng::seed_from_u64(seed);
    for name in names {
        let var = &data[name];
        let dims = var.dims().to_vec();
        if dims.len() >= 2 {
            let fan_in: usize = dims[1..].iter().product();
            let bound = 1.0 / (fan_in as f64).sqrt();
            let count: usize = dims.iter().product();
            let values: Vec<f32> = (0..count)
                .map(|_| rng.gen_range(-bound..bound) as f32)
                .collect();
            var.set(&Tensor::from_vec(values, dims, var.device())?)?;
        } else {
            var.set(&Tensor::zeros(dims, var.dtype(), var.device())?)?;
        }
    }
    Ok(())
}
