//! Serving session: whether the bot is running and where it may speak.
//!
//! Command handlers never mutate the session directly.  They return a
//! [`SessionIntent`] which the single [`SessionHandle`] applies and
//! publishes over a `watch` channel; the orchestrator and the message path
//! read snapshots through receivers.

use std::collections::BTreeSet;

use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServingSession {
    pub is_running: bool,
    pub enabled_sources: BTreeSet<String>,
}

/// A requested change to the [`ServingSession`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionIntent {
    Start,
    Stop,
    EnableSource(String),
    DisableSource(String),
}

impl ServingSession {
    /// Apply `intent`.  Returns `true` if the session changed.
    pub fn apply(&mut self, intent: SessionIntent) -> bool {
        match intent {
            SessionIntent::Start => !std::mem::replace(&mut self.is_running, true),
            SessionIntent::Stop => std::mem::replace(&mut self.is_running, false),
            SessionIntent::EnableSource(id) => self.enabled_sources.insert(id),
            SessionIntent::DisableSource(id) => self.enabled_sources.remove(&id),
        }
    }

    /// True when replies should be generated for `source_id`.
    pub fn serves(&self, source_id: &str) -> bool {
        self.is_running && self.enabled_sources.contains(source_id)
    }
}

/// Owner of the session.  Cheap to clone; every clone writes to the same
/// channel.
#[derive(Clone)]
pub struct SessionHandle {
    tx: watch::Sender<ServingSession>,
}

impl Default for SessionHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionHandle {
    /// Starts stopped with no enabled sources.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ServingSession::default());
        Self { tx }
    }

    pub fn apply(&self, intents: impl IntoIterator<Item = SessionIntent>) -> bool {
        let mut changed = false;
        for intent in intents {
            self.tx.send_if_modified(|session| {
                let did = session.apply(intent.clone());
                if did {
                    debug!(?intent, "session updated");
                }
                changed |= did;
                did
            });
        }
        changed
    }

    pub fn snapshot(&self) -> ServingSession {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ServingSession> {
        self.tx.subscribe()
    }
}
