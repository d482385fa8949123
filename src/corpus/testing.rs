//! In-memory collector for unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};

use super::{Collector, CorpusEntry, CorpusError, RawCorpus};

/// Returns the same text for a single `chan` source on every call and
/// counts the calls.
pub struct FixedCollector {
    pub text: String,
    pub calls: AtomicUsize,
}

impl FixedCollector {
    pub fn new(text: &str) -> Arc<Self> {
        Arc::new(Self { text: text.to_string(), calls: AtomicUsize::new(0) })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Collector for FixedCollector {
    fn collect(&self, _since: Option<DateTime<Utc>>) -> Result<RawCorpus, CorpusError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(RawCorpus::new(vec![CorpusEntry { source_id: "chan".into(), text: self.text.clone() }]))
    }
}
