//! Retrain orchestrator: the periodic collect → fine-tune → reload spine.
//!
//! [`Orchestrator`] owns one retrain cycle at a time.  [`OrchestratorHandle`]
//! is the client side of the background service that fires the cycle on a
//! fixed period and accepts manual triggers:
//!
//! - `run_now`:   run a full cycle immediately (same gating as the timer).
//! - `fine_tune`: train on operator-chosen corpus paths, then reload.
//! - `learn`:     snapshot the whole history into a directory, train, reload.
//! - `status`:    current state, last cycle, next tick.
//!
//! # Implementation
//!
//! The service is a single tokio task that parks on `sleep_until` for the
//! next deadline, a command channel and the shutdown token.  Cycles run on
//! their own tasks so the loop keeps answering `status` while training is
//! in progress; training itself runs on the blocking pool.

mod cycle;
mod service;

pub use cycle::{Orchestrator, RetrainSettings};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::engine::Engine;

use service::OrchestratorService;

// ── Cycle record ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    Collecting,
    Training,
    Reloading,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Success { version: String },
    Skipped { reason: String },
    Failed { reason: String },
}

impl CycleOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// What started a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    Timer,
    Manual,
    FineTune(Vec<PathBuf>),
    /// Full-history snapshot written to this directory.
    Learn(PathBuf),
}

/// Record of one cycle.  Kept in memory only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrainCycle {
    pub trigger: Trigger,
    /// `None` when the cycle did not collect a bounded window.
    pub window_start: Option<DateTime<Utc>>,
    pub window_end: DateTime<Utc>,
    pub outcome: CycleOutcome,
    pub final_state: CycleState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorStatus {
    pub state: CycleState,
    pub busy: bool,
    pub served_version: Option<String>,
    pub last_cycle: Option<RetrainCycle>,
    pub next_tick_in: Duration,
}

// ── Commands ──────────────────────────────────────────────────────────────────

pub enum OrchestratorCommand {
    RunNow {
        reply: oneshot::Sender<RetrainCycle>,
    },
    FineTune {
        paths: Vec<PathBuf>,
        reply: oneshot::Sender<RetrainCycle>,
    },
    Learn {
        data_dir: PathBuf,
        reply: oneshot::Sender<RetrainCycle>,
    },
    Status {
        reply: oneshot::Sender<OrchestratorStatus>,
    },
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("orchestrator service is not running")]
    NotRunning,
    #[error("orchestrator service dropped the reply")]
    Dropped,
}

// ── Handle ────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct OrchestratorHandle {
    cmd_tx: mpsc::Sender<OrchestratorCommand>,
}

impl OrchestratorHandle {
    /// Spawn the timer service.  The first tick fires one `period` from now.
    pub fn spawn<E: Engine>(
        orchestrator: Arc<Orchestrator<E>>,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let svc = OrchestratorService::new(orchestrator, cmd_rx, shutdown);
        let task = tokio::spawn(svc.run());
        debug!("orchestrator service started");
        (Self { cmd_tx }, task)
    }

    pub async fn run_now(&self) -> Result<RetrainCycle, OrchestratorError> {
        self.request(|reply| OrchestratorCommand::RunNow { reply }).await
    }

    /// Fine-tune on `paths` and reload the served model on success.
    pub async fn fine_tune(&self, paths: Vec<PathBuf>) -> Result<RetrainCycle, OrchestratorError> {
        self.request(|reply| OrchestratorCommand::FineTune { paths, reply }).await
    }

    /// Snapshot the whole history into `data_dir`, fine-tune on it and
    /// reload.  Skipped without touching `data_dir` while another cycle runs.
    pub async fn learn(&self, data_dir: PathBuf) -> Result<RetrainCycle, OrchestratorError> {
        self.request(|reply| OrchestratorCommand::Learn { data_dir, reply }).await
    }

    pub async fn status(&self) -> Result<OrchestratorStatus, OrchestratorError> {
        self.request(|reply| OrchestratorCommand::Status { reply }).await
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> OrchestratorCommand,
    ) -> Result<T, OrchestratorError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(make(reply_tx))
            .await
            .map_err(|_| OrchestratorError::NotRunning)?;
        reply_rx.await.map_err(|_| OrchestratorError::Dropped)
    }
}
