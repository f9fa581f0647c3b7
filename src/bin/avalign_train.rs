use std::path::PathBuf;
use std::sync::atomic::Ordering;

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

use avalign::{RunOutcome, TrainConfig, Trainer};

#[derive(Debug, Parser)]
#[command(name = "avalign_train")]
#[command(about = "Train the contrastive audio-visual alignment model")]
struct Args {
    /// JSON training configuration; built-in defaults when absent.
    #[arg(value_name = "CONFIG", env = "AVALIGN_CONFIG")]
    config: Option<PathBuf>,

    /// Resume from a specific checkpoint directory.
    #[arg(long, value_name = "DIR", env = "AVALIGN_RESUME", conflicts_with = "resume_latest")]
    resume: Option<PathBuf>,

    /// Resume from the newest checkpoint under the configured output directory.
    #[arg(long)]
    resume_latest: bool,
}

fn main() {
    match run() {
        Ok(RunOutcome::Finished) => {}
        Ok(RunOutcome::Interrupted) => std::process::exit(130),
        Err(message) => {
            eprintln!("avalign_train: {message}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<RunOutcome, String> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("avalign=info")),
        )
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => TrainConfig::load(path).map_err(|e| e.to_string())?,
        None => TrainConfig::default(),
    };

    let mut trainer = if let Some(dir) = &args.resume {
        Trainer::resume(config, dir).map_err(|e| e.to_string())?
    } else if args.resume_latest {
        Trainer::resume_latest(config).map_err(|e| e.to_string())?
    } else {
        Trainer::new(config).map_err(|e| e.to_string())?
    };

    let interrupt = trainer.interrupt_handle();
    ctrlc::set_handler(move || {
        interrupt.store(true, Ordering::Relaxed);
    })
    .map_err(|e| format!("failed to install interrupt handler: {e}"))?;

    let progress = ProgressBar::new(trainer.planned_steps());
    progress.set_style(
        ProgressStyle::with_template(
            "[{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-"),
    );
    progress.set_position(trainer.completed_steps());
    progress.set_message("training");

    let outcome = trainer.run_with_observer(|step, loss| {
        progress.set_position(step);
        progress.set_message(format!("loss {loss:.4}"));
    });
    match &outcome {
        Ok(RunOutcome::Finished) => progress.finish_with_message("training complete"),
        Ok(RunOutcome::Interrupted) => {
            progress.abandon_with_message("interrupted, checkpoint written")
        }
        Err(_) => progress.abandon_with_message("failed"),
    }
    outcome.map_err(|e| e.to_string())
}
