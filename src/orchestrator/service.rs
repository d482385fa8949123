//! Background timer task: the orchestrator run-loop.
//!
//! Sleeps until the next tick via `tokio::time::sleep_until`.  Each tick
//! spawns a cycle and re-arms one period later, whatever the cycle's outcome.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::{Orchestrator, OrchestratorCommand, Trigger};
use crate::engine::Engine;

pub(super) struct OrchestratorService<E: Engine> {
    orchestrator: Arc<Orchestrator<E>>,
    cmd_rx: mpsc::Receiver<OrchestratorCommand>,
    shutdown: CancellationToken,
}

impl<E: Engine> OrchestratorService<E> {
    pub(super) fn new(
        orchestrator: Arc<Orchestrator<E>>,
        cmd_rx: mpsc::Receiver<OrchestratorCommand>,
        shutdown: CancellationToken,
    ) -> Self {
        Self { orchestrator, cmd_rx, shutdown }
    }

    /// Run the timer loop until shutdown.
    pub(super) async fn run(mut self) {
        let period = self.orchestrator.settings().period;
        let mut deadline = Instant::now() + period;

        info!(period_secs = period.as_secs(), "orchestrator service running");

        loop {
            tokio::select! {
                biased;

                // ── Shutdown ─────────────────────────────────────────────
                _ = self.shutdown.cancelled() => {
                    info!("orchestrator service shutting down");
                    break;
                }

                // ── Incoming command ─────────────────────────────────────
                Some(cmd) = self.cmd_rx.recv() => {
                    match cmd {
                        OrchestratorCommand::RunNow { reply } => {
                            let orch = self.orchestrator.clone();
                            tokio::spawn(async move {
                                let cycle = orch.run_cycle(Trigger::Manual).await;
                                let _ = reply.send(cycle);
                            });
                        }
                        OrchestratorCommand::FineTune { paths, reply } => {
                            let orch = self.orchestrator.clone();
                            tokio::spawn(async move {
                                let cycle = orch.trigger_fine_tune(paths).await;
                                let _ = reply.send(cycle);
                            });
                        }
                        OrchestratorCommand::Learn { data_dir, reply } => {
                            let orch = self.orchestrator.clone();
                            tokio::spawn(async move {
                                let cycle = orch.trigger_learn(data_dir).await;
                                let _ = reply.send(cycle);
                            });
                        }
                        OrchestratorCommand::Status { reply } => {
                            let next = deadline.saturating_duration_since(Instant::now());
                            trace!(next_tick_secs = next.as_secs(), "status requested");
                            let _ = reply.send(self.orchestrator.status(next));
                        }
                    }
                }

                // ── Timer fires ──────────────────────────────────────────
                _ = tokio::time::sleep_until(deadline) => {
                    deadline += period;
                    debug!("retrain tick");
                    let orch = self.orchestrator.clone();
                    tokio::spawn(async move {
                        orch.run_cycle(Trigger::Timer).await;
                    });
                }
            }
        }
    }
}
