//! Command entry points: wire the subsystems together for each CLI command.
//!
//! `run` startup sequence:
//!   1. Open the model registry, create a blank base model if none exists
//!   2. Serve whatever checkpoint the `CURRENT` pointer names
//!   3. Open the history store and the serving session
//!   4. Spawn the retrain orchestrator
//!   5. Spawn Ctrl-C → shutdown signal watcher
//!   6. Spawn supervisor run-loop with the bot as message handler
//!   7. Run comms channels until they exit or shutdown is signalled
//!   8. Cancel token + join supervisor and orchestrator

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::corpus::{self, Collector, HistoryStore};
use crate::engine::NgramEngine;
use crate::error::AppError;
use crate::inference::InferenceService;
use crate::orchestrator::{Orchestrator, OrchestratorHandle};
use crate::registry::ModelRegistry;
use crate::session::SessionHandle;
use crate::subsystems::{self, bot::BotCore, bot::BotSubsystem};
use crate::supervisor::{self, bus::SupervisorBus};
use crate::training::{self, FineTuneJob, PretrainOutcome};

pub fn new_engine(config: &Config) -> NgramEngine {
    NgramEngine::new(config.model.ngram_order, config.model.learning_rate)
}

pub fn open_registry(config: &Config) -> Result<Arc<ModelRegistry<NgramEngine>>, AppError> {
    let registry = ModelRegistry::open(
        &config.model.base_dir,
        &config.model.versions_dir,
        config.model.keep_versions,
    )?;
    Ok(Arc::new(registry))
}

// ── run ───────────────────────────────────────────────────────────────────────

pub async fn run(config: Config) -> Result<(), AppError> {
    let registry = open_registry(&config)?;
    training::ensure_base(&registry, new_engine(&config))?;
    match registry.load() {
        Some(state) => info!(version = %state.version, "serving recorded model"),
        None => info!("no fine-tuned model recorded yet"),
    }

    let history = Arc::new(HistoryStore::open(&config.corpus.history_dir)?);
    let session = SessionHandle::new();

    // Shared shutdown token. Ctrl-C cancels it and every task watches it.
    let shutdown = CancellationToken::new();

    let orchestrator = Arc::new(Orchestrator::new(
        registry.clone(),
        history.clone(),
        session.subscribe(),
        config.retrain_settings(),
        config.training_options(),
        shutdown.clone(),
    ));
    let (orchestrator_handle, orchestrator_task) = OrchestratorHandle::spawn(orchestrator, shutdown.clone());

    let ctrlc_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, initiating shutdown");
            ctrlc_token.cancel();
        }
    });

    let core = Arc::new(BotCore::new(
        config.bot_name.clone(),
        config.bot.command_prefix.clone(),
        session,
        history,
        registry.clone(),
        InferenceService::new(registry, config.inference.clone()),
        orchestrator_handle,
        config.corpus.data_dir.clone(),
    ));

    let bus = SupervisorBus::new(64);
    let comms_tx = bus.comms_tx.clone();
    let sup_token = shutdown.clone();
    let sup_handle = tokio::spawn(async move {
        supervisor::run(bus, sup_token, Box::new(BotSubsystem::new(core))).await;
    });

    print_startup_summary(&config);

    let console = cfg!(feature = "channel-pty") && config.comms_pty_should_load();
    let comms = subsystems::comms::start(&config, comms_tx, shutdown.clone());
    let result = comms.join().await;
    if result.is_ok() && !console {
        shutdown.cancelled().await;
    }

    // If comms exited due to EOF (not Ctrl-C), still signal everything to stop.
    shutdown.cancel();
    sup_handle.await.ok();
    orchestrator_task.await.ok();
    info!("shutdown complete");
    result
}

fn print_startup_summary(config: &Config) {
    let fit = |text: String| -> String {
        const WIDTH: usize = 58;
        if text.chars().count() >= WIDTH {
            let mut out = text.chars().take(WIDTH - 1).collect::<String>();
            out.push('…');
            out
        } else {
            format!("{text:<WIDTH$}")
        }
    };
    let days = |d: std::time::Duration| d.as_secs() as f64 / 86_400.0;

    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║ {}║", fit(format!("koe-bot: {}", config.bot_name)));
    println!("╟────────────────────────────────────────────────────────────╢");
    println!("║ {}║", fit(format!("work dir: {}", config.work_dir.display())));
    println!("║ {}║", fit(format!("base model: {}", config.model.base_dir.display())));
    println!(
        "║ {}║",
        fit(format!(
            "retrain: every {:.1}d over {:.1}d, {} epoch(s)",
            days(config.retrain.period),
            days(config.retrain.window),
            config.retrain.epochs
        ))
    );
    println!(
        "║ {}║",
        fit(format!("pty: {}", if config.comms_pty_should_load() { "enabled" } else { "disabled" }))
    );
    println!("╚════════════════════════════════════════════════════════════╝");
    println!("Type `{} Run` to start replying.", config.bot.command_prefix);
}

// ── one-shot commands ─────────────────────────────────────────────────────────

/// Snapshot the whole history into the data directory.
pub fn collect(config: &Config) -> Result<Vec<PathBuf>, AppError> {
    let history = HistoryStore::open(&config.corpus.history_dir)?;
    let corpus = history.collect(None)?;
    if corpus.is_empty() {
        warn!(dir = %config.corpus.history_dir.display(), "history is empty");
    }
    Ok(corpus::write_snapshot(&config.corpus.data_dir, &corpus)?)
}

/// Fine-tune on `dir` (default: the data directory) and make the result
/// the served model.  Returns the new version.
pub fn learn(config: &Config, dir: Option<&Path>) -> Result<String, AppError> {
    let registry = open_registry(config)?;
    training::ensure_base(&registry, new_engine(config))?;
    // Loaded so that `start_from = served` continues from the served checkpoint.
    registry.load();

    let dir = dir.unwrap_or(&config.corpus.data_dir);
    let job = FineTuneJob::new(registry.clone(), config.training_options());
    let state = job.run(&training::corpus_dir(dir), config.training.epochs, config.training.batch_size)?;
    let version = state.version.clone();
    registry.swap(state)?;
    Ok(version)
}

pub fn pretrain(
    config: &Config,
    files: &[PathBuf],
    preamble: Option<&Path>,
    force: bool,
) -> Result<PretrainOutcome, AppError> {
    let registry = open_registry(config)?;
    let preamble = preamble.map(std::fs::read_to_string).transpose()?;
    Ok(training::pretrain_base(
        &registry,
        new_engine(config),
        files,
        preamble.as_deref(),
        &config.training_options(),
        config.training.epochs,
        config.training.batch_size,
        force,
    )?)
}
