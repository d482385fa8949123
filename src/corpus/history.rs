//! Observed-dialogue history: one JSON-lines file per source.
//!
//! Layout under the history directory:
//! ```text
//! history/
//! ├── pty0.jsonl         {"ts":"2026-10-01T09:00:00Z","text":"hello"}
//! └── 1234_5678.jsonl
//! ```
//!
//! The bot appends every non-command utterance it sees.  [`HistoryStore`]
//! also implements [`Collector`], so the retrain cycle reads its window
//! straight from here.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{Collector, CorpusEntry, CorpusError, RawCorpus, sanitize_source_id};

const HISTORY_EXT: &str = "jsonl";

#[derive(Debug, Serialize, Deserialize)]
struct HistoryRecord {
    ts: DateTime<Utc>,
    text: String,
}

pub struct HistoryStore {
    dir: PathBuf,
    /// Serialises appends so concurrent handlers never interleave lines.
    write_lock: Mutex<()>,
}

impl HistoryStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, CorpusError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| CorpusError::io(&dir, e))?;
        Ok(Self { dir, write_lock: Mutex::new(()) })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append one utterance.  Line breaks are folded into spaces so the
    /// record stays one utterance per line; blank utterances are ignored.
    pub fn append(&self, source_id: &str, text: &str, at: DateTime<Utc>) -> Result<(), CorpusError> {
        let text = text.split(['\r', '\n']).collect::<Vec<_>>().join(" ");
        if text.trim().is_empty() {
            return Ok(());
        }

        let mut line = serde_json::to_string(&HistoryRecord { ts: at, text })
            .map_err(|e| CorpusError::io(&self.dir, std::io::Error::other(e)))?;
        line.push('\n');

        let path = self.source_path(source_id);
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| CorpusError::io(&path, e))?;
        file.write_all(line.as_bytes()).map_err(|e| CorpusError::io(&path, e))?;
        Ok(())
    }

    fn source_path(&self, source_id: &str) -> PathBuf {
        self.dir.join(format!("{}.{HISTORY_EXT}", sanitize_source_id(source_id)))
    }

    fn read_source(
        &self,
        path: &Path,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<HistoryRecord>, CorpusError> {
        let raw = fs::read_to_string(path).map_err(|e| CorpusError::io(path, e))?;
        let mut records: Vec<HistoryRecord> = raw
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .filter_map(|(n, line)| match serde_json::from_str::<HistoryRecord>(line) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(path = %path.display(), line = n + 1, error = %e, "skipping malformed history line");
                    None
                }
            })
            .filter(|r| since.is_none_or(|s| r.ts >= s))
            .collect();
        records.sort_by_key(|r| r.ts);
        Ok(records)
    }
}

impl Collector for HistoryStore {
    fn collect(&self, since: Option<DateTime<Utc>>) -> Result<RawCorpus, CorpusError> {
        let mut files: Vec<PathBuf> = fs::read_dir(&self.dir)
            .map_err(|e| CorpusError::io(&self.dir, e))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == HISTORY_EXT))
            .collect();
        files.sort();

        let mut entries = Vec::new();
        for path in files {
            let records = self.read_source(&path, since)?;
            if records.is_empty() {
                continue;
            }
            let source_id = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let text: String = records.iter().map(|r| format!("{}\n", r.text)).collect();
            entries.push(CorpusEntry { source_id, text });
        }

        let corpus = RawCorpus::new(entries);
        debug!(
            since = ?since,
            sources = corpus.entries.len(),
            bytes = corpus.total_bytes(),
            "history collected"
        );
        Ok(corpus)
    }
}
