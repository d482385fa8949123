//! One retrain cycle and the state it owns between cycles.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{CycleOutcome, CycleState, OrchestratorStatus, RetrainCycle, Trigger};
use crate::corpus::{self, Collector};
use crate::engine::Engine;
use crate::registry::{EngineState, ModelRegistry};
use crate::session::ServingSession;
use crate::training::{FineTuneJob, TrainingOptions};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrainSettings {
    /// Time between timer ticks.
    pub period: Duration,
    /// How far back each cycle collects.
    pub window: Duration,
    pub epochs: usize,
    pub batch_size: usize,
    /// Upper bound on one training run.  `None` waits indefinitely.
    pub timeout: Option<Duration>,
    /// Where the collected window is written before training.
    pub snapshot_dir: PathBuf,
}

impl RetrainSettings {
    pub fn with_snapshot_dir(snapshot_dir: impl Into<PathBuf>) -> Self {
        Self {
            period: Duration::from_secs(7 * 24 * 3600),
            window: Duration::from_secs(7 * 24 * 3600),
            epochs: 1,
            batch_size: 2,
            timeout: Some(Duration::from_secs(6 * 3600)),
            snapshot_dir: snapshot_dir.into(),
        }
    }
}

/// Result of one step of a cycle; `Err` carries the outcome to record.
type Step<T> = Result<T, CycleOutcome>;

pub struct Orchestrator<E: Engine> {
    registry: Arc<ModelRegistry<E>>,
    collector: Arc<dyn Collector>,
    session: watch::Receiver<ServingSession>,
    settings: RetrainSettings,
    training: TrainingOptions,
    shutdown: CancellationToken,
    busy: AtomicBool,
    state: Mutex<CycleState>,
    last: Mutex<Option<RetrainCycle>>,
}

/// Clears the busy flag when the cycle ends, however it ends.
pub(crate) struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<E: Engine> Orchestrator<E> {
    pub fn new(
        registry: Arc<ModelRegistry<E>>,
        collector: Arc<dyn Collector>,
        session: watch::Receiver<ServingSession>,
        settings: RetrainSettings,
        training: TrainingOptions,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry,
            collector,
            session,
            settings,
            training,
            shutdown,
            busy: AtomicBool::new(false),
            state: Mutex::new(CycleState::Idle),
            last: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &RetrainSettings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<ModelRegistry<E>> {
        &self.registry
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn last_cycle(&self) -> Option<RetrainCycle> {
        self.last.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn status(&self, next_tick_in: Duration) -> OrchestratorStatus {
        OrchestratorStatus {
            state: *self.state.lock().unwrap_or_else(PoisonError::into_inner),
            busy: self.is_busy(),
            served_version: self.registry.current().map(|s| s.version.clone()),
            last_cycle: self.last_cycle(),
            next_tick_in,
        }
    }

    /// Run one collect → train → reload cycle over the configured window.
    ///
    /// Skipped when the session is not running or another cycle is active.
    /// Never fails outward: every error ends the cycle as `Failed` and the
    /// served model stays as it was.
    pub async fn run_cycle(&self, trigger: Trigger) -> RetrainCycle {
        let window_end = Utc::now();
        let window_start = TimeDelta::from_std(self.settings.window)
            .ok()
            .and_then(|w| window_end.checked_sub_signed(w));

        let running = self.session.borrow().is_running;
        if !running {
            info!(?trigger, "retrain cycle skipped: service is not running");
            return self.finish(trigger, window_start, window_end, skipped("service is not running"));
        }
        let Some(_guard) = self.try_begin() else {
            info!(?trigger, "retrain cycle skipped: another cycle is in progress");
            return self.finish(trigger, window_start, window_end, skipped("a cycle is already in progress"));
        };

        info!(?trigger, since = ?window_start, "retrain cycle started");
        let outcome = match self.collect_into(window_start, &self.settings.snapshot_dir).await {
            Ok(snapshot) => self.train_and_reload(vec![snapshot]).await,
            Err(outcome) => outcome,
        };
        self.finish(trigger, window_start, window_end, outcome)
    }

    /// Train on explicit corpus paths and reload on success.  Not gated on
    /// the running flag; still exclusive with any other cycle.
    pub async fn trigger_fine_tune(&self, paths: Vec<PathBuf>) -> RetrainCycle {
        let window_end = Utc::now();
        let trigger = Trigger::FineTune(paths.clone());
        let Some(_guard) = self.try_begin() else {
            info!("fine-tune request dropped: a cycle is in progress");
            return self.finish(trigger, None, window_end, skipped("a cycle is already in progress"));
        };

        info!(paths = ?paths, "manual fine-tune started");
        let outcome = self.train_and_reload(paths).await;
        self.finish(trigger, None, window_end, outcome)
    }

    /// Snapshot the whole history into `data_dir`, train on it and reload.
    ///
    /// The snapshot is written only once this cycle holds the busy slot, so
    /// it never replaces files another cycle is training on.
    pub async fn trigger_learn(&self, data_dir: PathBuf) -> RetrainCycle {
        let window_end = Utc::now();
        let trigger = Trigger::Learn(data_dir.clone());
        let Some(_guard) = self.try_begin() else {
            info!("learn request dropped: a cycle is in progress");
            return self.finish(trigger, None, window_end, skipped("a cycle is already in progress"));
        };

        info!(dir = %data_dir.display(), "learning from the full history");
        let outcome = match self.collect_into(None, &data_dir).await {
            Ok(snapshot) => self.train_and_reload(vec![snapshot]).await,
            Err(outcome) => outcome,
        };
        self.finish(trigger, None, window_end, outcome)
    }

    pub(crate) fn try_begin(&self) -> Option<BusyGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| BusyGuard(&self.busy))
    }

    // ── Phases ────────────────────────────────────────────────────────────────

    /// Collect everything said since `since` (all of it for `None`) into
    /// `dir`.  Callers hold the busy slot.
    async fn collect_into(&self, since: Option<DateTime<Utc>>, dir: &Path) -> Step<PathBuf> {
        self.enter(CycleState::Collecting);
        let collector = self.collector.clone();
        let snapshot_dir = dir.to_path_buf();

        let collected = tokio::task::spawn_blocking(move || {
            let corpus = collector.collect(since)?;
            let files = corpus::write_snapshot(&snapshot_dir, &corpus)?;
            Ok::<_, corpus::CorpusError>((corpus.total_bytes(), files.len()))
        })
        .await;

        match collected {
            Ok(Ok((bytes, files))) => {
                debug!(bytes, files, dir = %dir.display(), "history collected");
                Ok(dir.to_path_buf())
            }
            Ok(Err(e)) => Err(failed(format!("collection failed: {e}"))),
            Err(e) => Err(failed(format!("collection task failed: {e}"))),
        }
    }

    async fn train_and_reload(&self, paths: Vec<PathBuf>) -> CycleOutcome {
        let state = match self.train(paths).await {
            Ok(state) => state,
            Err(outcome) => return outcome,
        };
        self.reload(state)
    }

    async fn train(&self, paths: Vec<PathBuf>) -> Step<Arc<EngineState<E>>> {
        self.enter(CycleState::Training);
        let cancel = self.shutdown.child_token();
        let job = FineTuneJob::new(self.registry.clone(), self.training.clone()).with_cancel(cancel.clone());
        let (epochs, batch_size) = (self.settings.epochs, self.settings.batch_size);

        let mut task = tokio::task::spawn_blocking(move || job.run(&paths, epochs, batch_size));
        let joined = match self.settings.timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(timeout_secs = limit.as_secs_f64(), "fine-tune timed out; cancelling");
                    cancel.cancel();
                    // Wait for the job to observe the token and drop its staging dir.
                    let _ = task.await;
                    return Err(failed(format!("fine-tune timed out after {limit:?}")));
                }
            },
            None => task.await,
        };

        match joined {
            Ok(Ok(state)) => Ok(state),
            Ok(Err(e)) => Err(failed(format!("fine-tune failed during {}: {e}", e.phase()))),
            Err(e) => Err(failed(format!("fine-tune task failed: {e}"))),
        }
    }

    fn reload(&self, state: Arc<EngineState<E>>) -> CycleOutcome {
        self.enter(CycleState::Reloading);
        let version = state.version.clone();
        if let Err(e) = self.registry.swap(state) {
            return failed(format!("cannot publish {version}: {e}"));
        }
        match self.registry.load() {
            Some(served) if served.version == version => CycleOutcome::Success { version },
            Some(served) => failed(format!("reload serves {} instead of {version}", served.version)),
            None => failed(format!("reload found no model after publishing {version}")),
        }
    }

    // ── Bookkeeping ───────────────────────────────────────────────────────────

    fn enter(&self, next: CycleState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = next;
        debug!(state = ?next, "retrain cycle state");
    }

    fn finish(
        &self,
        trigger: Trigger,
        window_start: Option<DateTime<Utc>>,
        window_end: DateTime<Utc>,
        outcome: CycleOutcome,
    ) -> RetrainCycle {
        let final_state = match &outcome {
            CycleOutcome::Failed { .. } => CycleState::Failed,
            CycleOutcome::Success { .. } | CycleOutcome::Skipped { .. } => CycleState::Done,
        };
        match &outcome {
            CycleOutcome::Success { version } => info!(version = %version, "retrain cycle succeeded"),
            CycleOutcome::Skipped { .. } => {}
            CycleOutcome::Failed { reason } => error!(reason = %reason, "retrain cycle failed; served model unchanged"),
        }

        let cycle = RetrainCycle { trigger, window_start, window_end, outcome, final_state };
        // A skipped tick must not overwrite the record of the cycle that is running.
        if !matches!(cycle.outcome, CycleOutcome::Skipped { .. }) || !self.is_busy() {
            *self.state.lock().unwrap_or_else(PoisonError::into_inner) = final_state;
            *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Some(cycle.clone());
        }
        cycle
    }
}

fn skipped(reason: &str) -> CycleOutcome {
    CycleOutcome::Skipped { reason: reason.to_string() }
}

fn failed(reason: String) -> CycleOutcome {
    CycleOutcome::Failed { reason }
}
