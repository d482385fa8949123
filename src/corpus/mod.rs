//! Raw dialogue corpus: reading, snapshotting and windowing.
//!
//! A [`RawCorpus`] is an ordered list of `(source_id, text)` pairs, one per
//! chat source, with one utterance per line.  On disk each source is a
//! `<source_id>.txt` file; a directory of such files is a corpus location.
//!
//! Sources are always ordered by `source_id` so that windowing the same
//! files twice yields the same examples.

pub mod history;
#[cfg(test)]
pub(crate) mod testing;
pub mod windower;

pub use history::HistoryStore;
pub use windower::{TokenBlock, TrainingExample, build_examples, window};

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::debug;

const CORPUS_EXT: &str = "txt";

// ── Error ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CorpusError {
    #[error("corpus io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corpus path not found: {0}")]
    NotFound(PathBuf),
}

impl CorpusError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io { path: path.to_path_buf(), source }
    }
}

// ── Types ─────────────────────────────────────────────────────────────────────

/// Text observed on one source, one utterance per line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorpusEntry {
    pub source_id: String,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawCorpus {
    pub entries: Vec<CorpusEntry>,
}

impl RawCorpus {
    pub fn new(mut entries: Vec<CorpusEntry>) -> Self {
        entries.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| e.text.is_empty())
    }

    /// All source text joined in source order, exactly as stored.
    pub fn concatenated(&self) -> String {
        self.entries.iter().map(|e| e.text.as_str()).collect()
    }

    pub fn total_bytes(&self) -> usize {
        self.entries.iter().map(|e| e.text.len()).sum()
    }
}

// ── Collector ─────────────────────────────────────────────────────────────────

/// Read-only access to observed dialogue.
///
/// `since = None` returns everything; otherwise only utterances at or after
/// `since`, chronological within each source.
pub trait Collector: Send + Sync + 'static {
    fn collect(&self, since: Option<DateTime<Utc>>) -> Result<RawCorpus, CorpusError>;
}

// ── Files ─────────────────────────────────────────────────────────────────────

/// Read corpus files.  Each path is either a `.txt` file or a directory whose
/// `.txt` files are read (non-recursively).
pub fn read_paths(paths: &[PathBuf]) -> Result<RawCorpus, CorpusError> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            files.extend(corpus_files(path)?);
        } else if path.is_file() {
            files.push(path.clone());
        } else {
            return Err(CorpusError::NotFound(path.clone()));
        }
    }

    let mut entries = Vec::with_capacity(files.len());
    for file in files {
        let text = fs::read_to_string(&file).map_err(|e| CorpusError::io(&file, e))?;
        entries.push(CorpusEntry { source_id: source_id_of(&file), text });
    }

    let corpus = RawCorpus::new(entries);
    debug!(sources = corpus.entries.len(), bytes = corpus.total_bytes(), "corpus read");
    Ok(corpus)
}

/// Replace the corpus files in `dir` with one file per source of `corpus`.
/// Returns the written paths in source order.
pub fn write_snapshot(dir: &Path, corpus: &RawCorpus) -> Result<Vec<PathBuf>, CorpusError> {
    fs::create_dir_all(dir).map_err(|e| CorpusError::io(dir, e))?;
    for stale in corpus_files(dir)? {
        fs::remove_file(&stale).map_err(|e| CorpusError::io(&stale, e))?;
    }

    let mut written = Vec::new();
    for entry in corpus.entries.iter().filter(|e| !e.text.is_empty()) {
        let path = dir.join(format!("{}.{CORPUS_EXT}", sanitize_source_id(&entry.source_id)));
        fs::write(&path, &entry.text).map_err(|e| CorpusError::io(&path, e))?;
        written.push(path);
    }
    debug!(dir = %dir.display(), files = written.len(), "corpus snapshot written");
    Ok(written)
}

fn corpus_files(dir: &Path) -> Result<Vec<PathBuf>, CorpusError> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|e| CorpusError::io(dir, e))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == CORPUS_EXT))
        .collect();
    files.sort();
    Ok(files)
}

fn source_id_of(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Map a source id onto a safe file stem.
pub fn sanitize_source_id(id: &str) -> String {
    let cleaned: String = id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() { "_".to_string() } else { cleaned }
}
