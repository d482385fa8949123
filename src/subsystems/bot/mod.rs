//! Bot subsystem: what happens to each message a channel receives.
//!
//! - `<prefix> <verb>` messages are commands; they turn into session
//!   intents or orchestrator requests and always get a reply.
//! - Everything else is recorded in the history store, then answered by
//!   the inference service if the session serves that channel.
//!
//! Disk and engine work runs on the blocking pool; the handler itself
//! returns immediately.

pub mod commands;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use commands::{AVAILABLE, BotCommand};

use crate::corpus::HistoryStore;
use crate::engine::Engine;
use crate::error::AppError;
use crate::inference::InferenceService;
use crate::orchestrator::{CycleOutcome, OrchestratorHandle, RetrainCycle};
use crate::registry::ModelRegistry;
use crate::session::{SessionHandle, SessionIntent};
use crate::supervisor::dispatch::MessageHandler;

pub struct BotCore<E: Engine> {
    bot_name: String,
    prefix: String,
    session: SessionHandle,
    history: Arc<HistoryStore>,
    registry: Arc<ModelRegistry<E>>,
    inference: InferenceService<E>,
    orchestrator: OrchestratorHandle,
    /// Full-history snapshot used by `Learn`.
    data_dir: PathBuf,
}

impl<E: Engine> BotCore<E> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bot_name: String,
        prefix: String,
        session: SessionHandle,
        history: Arc<HistoryStore>,
        registry: Arc<ModelRegistry<E>>,
        inference: InferenceService<E>,
        orchestrator: OrchestratorHandle,
        data_dir: PathBuf,
    ) -> Self {
        Self { bot_name, prefix, session, history, registry, inference, orchestrator, data_dir }
    }

    /// Handle one message and return the reply, if any.
    pub async fn handle(self: &Arc<Self>, channel_id: &str, content: &str) -> Option<String> {
        if let Some(command) = commands::parse(content, &self.prefix) {
            debug!(%channel_id, ?command, "command received");
            return Some(self.run_command(channel_id, command).await);
        }

        self.record(channel_id, content).await;

        if !self.session.snapshot().serves(channel_id) {
            return None;
        }
        let inference = self.inference.clone();
        let utterance = content.to_string();
        match tokio::task::spawn_blocking(move || inference.reply(&utterance)).await {
            Ok(reply) => Some(reply),
            Err(e) => {
                warn!(error = %e, "inference task failed");
                None
            }
        }
    }

    async fn record(&self, channel_id: &str, content: &str) {
        let history = self.history.clone();
        let (channel, text) = (channel_id.to_string(), content.to_string());
        let stored = tokio::task::spawn_blocking(move || history.append(&channel, &text, Utc::now())).await;
        match stored {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(%channel_id, error = %e, "cannot record utterance"),
            Err(e) => warn!(%channel_id, error = %e, "history task failed"),
        }
    }

    async fn run_command(self: &Arc<Self>, channel_id: &str, command: BotCommand) -> String {
        let name = &self.bot_name;
        match command {
            BotCommand::Run => {
                let registry = self.registry.clone();
                let loaded = tokio::task::spawn_blocking(move || registry.load()).await.ok().flatten();
                match loaded {
                    Some(state) => {
                        self.session.apply([
                            SessionIntent::Start,
                            SessionIntent::EnableSource(channel_id.to_string()),
                        ]);
                        info!(%channel_id, version = %state.version, "bot started");
                        format!("{name} is now running in this channel (model {}).", state.version)
                    }
                    None => "Failed to load the model. Run `learn` first.".to_string(),
                }
            }
            BotCommand::Stop => {
                self.session.apply([SessionIntent::Stop]);
                info!(%channel_id, "bot stopped");
                format!("{name} has been stopped.")
            }
            BotCommand::No => {
                self.session.apply([SessionIntent::DisableSource(channel_id.to_string())]);
                format!("{name} will no longer be active in this channel.")
            }
            BotCommand::Learn => {
                let core = Arc::clone(self);
                tokio::spawn(async move {
                    match core.learn().await {
                        Ok(cycle) => debug!(outcome = ?cycle.outcome, "learn finished"),
                        Err(e) => warn!(error = %e, "learn failed"),
                    }
                });
                format!("Learning from the full history. Use `{} Status` to follow.", self.prefix)
            }
            BotCommand::Status => self.status().await,
            BotCommand::Unknown(verb) => {
                debug!(%verb, "unknown command");
                format!("Unknown command. Available commands: {AVAILABLE}")
            }
        }
    }

    /// Snapshot the whole history into the data directory and fine-tune on
    /// it.  The served model changes only if the run succeeds.
    pub async fn learn(&self) -> Result<RetrainCycle, AppError> {
        Ok(self.orchestrator.learn(self.data_dir.clone()).await?)
    }

    async fn status(&self) -> String {
        let session = self.session.snapshot();
        let mut out = format!(
            "running: {} | channels: {}",
            if session.is_running { "yes" } else { "no" },
            session.enabled_sources.len()
        );
        match self.orchestrator.status().await {
            Ok(status) => {
                let model = status.served_version.as_deref().unwrap_or("none");
                let last = match status.last_cycle.map(|c| c.outcome) {
                    None => "none".to_string(),
                    Some(CycleOutcome::Success { version }) => format!("success ({version})"),
                    Some(CycleOutcome::Skipped { reason }) => format!("skipped ({reason})"),
                    Some(CycleOutcome::Failed { reason }) => format!("failed ({reason})"),
                };
                out.push_str(&format!(
                    " | model: {model} | retrain: {:?}{} | last cycle: {last} | next in {}s",
                    status.state,
                    if status.busy { " (busy)" } else { "" },
                    status.next_tick_in.as_secs()
                ));
            }
            Err(e) => out.push_str(&format!(" | retrain: unavailable ({e})")),
        }
        out
    }
}

/// Supervisor-facing wrapper: each message is handled on its own task.
pub struct BotSubsystem<E: Engine> {
    core: Arc<BotCore<E>>,
}

impl<E: Engine> BotSubsystem<E> {
    pub fn new(core: Arc<BotCore<E>>) -> Self {
        Self { core }
    }
}

impl<E: Engine> MessageHandler for BotSubsystem<E> {
    fn handle_message(&self, channel_id: String, content: String, reply_tx: oneshot::Sender<Option<String>>) {
        let core = self.core.clone();
        tokio::spawn(async move {
            let reply = core.handle(&channel_id, &content).await;
            let _ = reply_tx.send(reply);
        });
    }
}
