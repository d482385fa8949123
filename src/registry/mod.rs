//! Model registry: owns the served engine state and the checkpoint layout.
//!
//! Layout:
//! ```text
//! models/
//! ├── base/                                  pre-trained starting point
//! └── fine_tuned/
//!     ├── CURRENT                            name of the served version
//!     ├── v20261008T030000Z-0199c2a4…/       one directory per completed run
//!     └── .staging-<uuid>/                   in-flight writes, never served
//! ```
//!
//! A checkpoint becomes visible only by renaming its finished staging
//! directory to a version name, and becomes served only by rewriting
//! `CURRENT` (temp file + rename) and then replacing the in-memory `Arc`.
//! Readers therefore see either the old state or the new one.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::{Engine, EngineError};

const POINTER_FILE: &str = "CURRENT";
const STAGING_PREFIX: &str = ".staging-";
const VERSION_PREFIX: char = 'v';

// ── Error ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no base model at {0}")]
    NoBaseModel(PathBuf),
    #[error("cannot load model from {path}: {source}")]
    Engine {
        path: PathBuf,
        #[source]
        source: EngineError,
    },
    #[error("unknown model version: {0}")]
    UnknownVersion(String),
}

impl RegistryError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io { path: path.to_path_buf(), source }
    }
}

// ── EngineState ───────────────────────────────────────────────────────────────

/// A loaded, immutable engine checkpoint.  Shared as `Arc<EngineState<E>>`.
#[derive(Debug)]
pub struct EngineState<E> {
    pub version: String,
    pub path: PathBuf,
    pub engine: E,
}

// ── StagedCheckpoint ──────────────────────────────────────────────────────────

/// A directory being written.  Dropping it without [`commit`] deletes it.
///
/// [`commit`]: StagedCheckpoint::commit
#[derive(Debug)]
pub struct StagedCheckpoint {
    staging: PathBuf,
    target: PathBuf,
    version: String,
    committed: bool,
}

impl StagedCheckpoint {
    /// Directory to write the checkpoint into.
    pub fn path(&self) -> &Path {
        &self.staging
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Atomically move the finished checkpoint to its final location.  An
    /// existing target (only possible for the base model) is replaced, and
    /// put back if the move fails.
    pub fn commit(mut self) -> Result<(String, PathBuf), RegistryError> {
        let displaced = if self.target.exists() {
            let aside = self.target.with_extension(format!("replaced-{}", short_id()));
            fs::rename(&self.target, &aside).map_err(|e| RegistryError::io(&self.target, e))?;
            Some(aside)
        } else {
            None
        };

        if let Err(e) = fs::rename(&self.staging, &self.target) {
            if let Some(aside) = &displaced {
                if let Err(restore) = fs::rename(aside, &self.target) {
                    warn!(path = %aside.display(), error = %restore, "cannot restore replaced checkpoint");
                }
            }
            return Err(RegistryError::io(&self.staging, e));
        }
        self.committed = true;

        if let Some(aside) = displaced {
            if let Err(e) = fs::remove_dir_all(&aside) {
                warn!(path = %aside.display(), error = %e, "cannot remove replaced checkpoint");
            }
        }

        debug!(version = %self.version, path = %self.target.display(), "checkpoint committed");
        Ok((self.version.clone(), self.target.clone()))
    }
}

impl Drop for StagedCheckpoint {
    fn drop(&mut self) {
        if !self.committed && self.staging.exists() {
            match fs::remove_dir_all(&self.staging) {
                Ok(()) => debug!(path = %self.staging.display(), "discarded staged checkpoint"),
                Err(e) => warn!(path = %self.staging.display(), error = %e, "cannot discard staged checkpoint"),
            }
        }
    }
}

// ── ModelRegistry ─────────────────────────────────────────────────────────────

pub struct ModelRegistry<E: Engine> {
    base_dir: PathBuf,
    versions_dir: PathBuf,
    keep_versions: usize,
    current: RwLock<Option<Arc<EngineState<E>>>>,
}

impl<E: Engine> ModelRegistry<E> {
    /// Open (creating directories as needed) without loading anything.
    pub fn open(
        base_dir: impl Into<PathBuf>,
        versions_dir: impl Into<PathBuf>,
        keep_versions: usize,
    ) -> Result<Self, RegistryError> {
        let versions_dir = versions_dir.into();
        fs::create_dir_all(&versions_dir).map_err(|e| RegistryError::io(&versions_dir, e))?;
        Ok(Self {
            base_dir: base_dir.into(),
            versions_dir,
            keep_versions: keep_versions.max(1),
            current: RwLock::new(None),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn has_base(&self) -> bool {
        self.base_dir.is_dir()
    }

    /// The served state, if any.  Never blocks on disk I/O.
    pub fn current(&self) -> Option<Arc<EngineState<E>>> {
        self.current.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Sync the served state with the recorded pointer.
    ///
    /// Returns `None` when nothing was ever trained.  When the recorded
    /// version is already loaded the same `Arc` is returned.  A pointer or
    /// checkpoint that cannot be read is logged and the previously served
    /// state (if any) stays in effect.
    pub fn load(&self) -> Option<Arc<EngineState<E>>> {
        let cached = self.current();

        let version = match self.read_pointer() {
            Ok(Some(version)) => version,
            Ok(None) => {
                debug!(dir = %self.versions_dir.display(), "no fine-tuned model recorded");
                return cached;
            }
            Err(e) => {
                warn!(error = %e, "cannot read model pointer; keeping served model");
                return cached;
            }
        };

        if cached.as_ref().is_some_and(|state| state.version == version) {
            return cached;
        }

        let path = self.versions_dir.join(&version);
        match E::load(&path) {
            Ok(engine) => {
                let state = Arc::new(EngineState { version, path, engine });
                if !self.publish_if_unchanged(cached.as_ref(), state.clone()) {
                    debug!(version = %state.version, "served model changed during load; keeping it");
                    return self.current();
                }
                info!(version = %state.version, kind = state.engine.kind(), "model loaded");
                Some(state)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot load recorded model; keeping served model");
                cached
            }
        }
    }

    /// Make `new` the served state: persist the pointer, then publish.
    /// On error nothing changes.
    pub fn swap(&self, new: Arc<EngineState<E>>) -> Result<(), RegistryError> {
        if new.path != self.versions_dir.join(&new.version) || !new.path.is_dir() {
            return Err(RegistryError::UnknownVersion(new.version.clone()));
        }

        self.write_pointer(&new.version)?;
        let previous = self.current().map(|s| s.version.clone());
        self.publish(new.clone());
        info!(version = %new.version, previous = ?previous, "served model swapped");

        self.prune(&new.version);
        Ok(())
    }

    /// Allocate a fresh version directory to write a checkpoint into.
    ///
    /// Names sort in creation order, also within one second: the suffix is
    /// a time-ordered v7 UUID.
    pub fn stage(&self) -> Result<StagedCheckpoint, RegistryError> {
        let version = format!(
            "{VERSION_PREFIX}{}-{}",
            Utc::now().format("%Y%m%dT%H%M%SZ"),
            Uuid::now_v7().simple()
        );
        let staging = self.versions_dir.join(format!("{STAGING_PREFIX}{}", Uuid::new_v4()));
        fs::create_dir_all(&staging).map_err(|e| RegistryError::io(&staging, e))?;
        Ok(StagedCheckpoint {
            target: self.versions_dir.join(&version),
            staging,
            version,
            committed: false,
        })
    }

    /// Staging area whose commit replaces the base model.
    pub fn stage_base(&self) -> Result<StagedCheckpoint, RegistryError> {
        let parent = self
            .base_dir
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&parent).map_err(|e| RegistryError::io(&parent, e))?;
        let staging = parent.join(format!("{STAGING_PREFIX}base-{}", Uuid::new_v4()));
        fs::create_dir_all(&staging).map_err(|e| RegistryError::io(&staging, e))?;
        Ok(StagedCheckpoint {
            target: self.base_dir.clone(),
            staging,
            version: "base".to_string(),
            committed: false,
        })
    }

    /// Fresh, owned copy of the base engine.
    pub fn load_base(&self) -> Result<E, RegistryError> {
        if !self.has_base() {
            return Err(RegistryError::NoBaseModel(self.base_dir.clone()));
        }
        E::load(&self.base_dir).map_err(|source| RegistryError::Engine {
            path: self.base_dir.clone(),
            source,
        })
    }

    /// Fresh, owned copy of the engine named by the pointer, if any.
    pub fn load_recorded(&self) -> Result<Option<E>, RegistryError> {
        let Some(version) = self.read_pointer()? else {
            return Ok(None);
        };
        let path = self.versions_dir.join(&version);
        E::load(&path)
            .map(Some)
            .map_err(|source| RegistryError::Engine { path, source })
    }

    /// Committed version names, oldest first.
    pub fn versions(&self) -> Result<Vec<String>, RegistryError> {
        let mut versions: Vec<String> = fs::read_dir(&self.versions_dir)
            .map_err(|e| RegistryError::io(&self.versions_dir, e))?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with(VERSION_PREFIX))
            .collect();
        versions.sort();
        Ok(versions)
    }

    fn publish(&self, state: Arc<EngineState<E>>) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(state);
    }

    /// Publish `state` only if the served state is still `expected`.
    fn publish_if_unchanged(
        &self,
        expected: Option<&Arc<EngineState<E>>>,
        state: Arc<EngineState<E>>,
    ) -> bool {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let unchanged = match (current.as_ref(), expected) {
            (None, None) => true,
            (Some(now), Some(seen)) => Arc::ptr_eq(now, seen),
            _ => false,
        };
        if unchanged {
            *current = Some(state);
        }
        unchanged
    }

    fn read_pointer(&self) -> Result<Option<String>, RegistryError> {
        let path = self.versions_dir.join(POINTER_FILE);
        match fs::read_to_string(&path) {
            Ok(raw) => {
                let version = raw.trim().to_string();
                if version.is_empty() || !self.versions_dir.join(&version).is_dir() {
                    return Err(RegistryError::UnknownVersion(version));
                }
                Ok(Some(version))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(RegistryError::io(&path, e)),
        }
    }

    fn write_pointer(&self, version: &str) -> Result<(), RegistryError> {
        let path = self.versions_dir.join(POINTER_FILE);
        let tmp = self.versions_dir.join(format!("{POINTER_FILE}.{}", short_id()));
        fs::write(&tmp, format!("{version}\n")).map_err(|e| RegistryError::io(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            RegistryError::io(&path, e)
        })
    }

    /// Keep `served` plus the newest `keep_versions - 1` other checkpoints.
    /// Best effort.
    fn prune(&self, served: &str) {
        let others: Vec<String> = match self.versions() {
            Ok(v) => v.into_iter().filter(|v| v != served).collect(),
            Err(e) => {
                warn!(error = %e, "cannot list model versions for pruning");
                return;
            }
        };
        let excess = others.len().saturating_sub(self.keep_versions - 1);
        for old in others.iter().take(excess) {
            let path = self.versions_dir.join(old);
            match fs::remove_dir_all(&path) {
                Ok(()) => debug!(version = %old, "pruned old model version"),
                Err(e) => warn!(version = %old, error = %e, "cannot prune model version"),
            }
        }
    }
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::MarkerEngine;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn registry(root: &Path, keep: usize) -> ModelRegistry<MarkerEngine> {
        ModelRegistry::open(root.join("base"), root.join("fine_tuned"), keep).unwrap()
    }

    fn commit(reg: &ModelRegistry<MarkerEngine>, engine: MarkerEngine) -> Arc<EngineState<MarkerEngine>> {
        let staged = reg.stage().unwrap();
        engine.save(staged.path()).unwrap();
        let (version, path) = staged.commit().unwrap();
        Arc::new(EngineState { version, path, engine })
    }

    #[test]
    fn empty_registry_has_no_model() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path(), 3);
        assert!(reg.load().is_none());
        assert!(reg.current().is_none());
        assert!(matches!(reg.load_base(), Err(RegistryError::NoBaseModel(_))));
    }

    #[test]
    fn swap_then_load_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path(), 3);
        let state = commit(&reg, MarkerEngine::new("one"));
        reg.swap(state.clone()).unwrap();

        let a = reg.load().unwrap();
        let b = reg.load().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &state));
        assert_eq!(a.engine.marker, "one");
    }

    #[test]
    fn fresh_registry_loads_recorded_version() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path(), 3);
        let state = commit(&reg, MarkerEngine::new("persisted"));
        reg.swap(state.clone()).unwrap();

        let restarted = registry(dir.path(), 3);
        let first = restarted.load().unwrap();
        let second = restarted.load().unwrap();
        assert_eq!(first.version, state.version);
        assert_eq!(first.engine, second.engine);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn uncommitted_stage_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path(), 3);
        let staged = reg.stage().unwrap();
        let path = staged.path().to_path_buf();
        MarkerEngine::new("partial").save(&path).unwrap();
        drop(staged);

        assert!(!path.exists());
        assert!(reg.versions().unwrap().is_empty());
        assert!(reg.load().is_none());
    }

    #[test]
    fn broken_checkpoint_keeps_served_model() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path(), 3);
        let good = commit(&reg, MarkerEngine::new("good"));
        reg.swap(good.clone()).unwrap();

        // A second version whose state file is missing, recorded by hand.
        let staged = reg.stage().unwrap();
        let (bad, _) = staged.commit().unwrap();
        fs::write(dir.path().join("fine_tuned").join(POINTER_FILE), &bad).unwrap();

        let served = reg.load().unwrap();
        assert_eq!(served.version, good.version);
    }

    #[test]
    fn swap_rejects_foreign_path() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path(), 3);
        let foreign = Arc::new(EngineState {
            version: "v-elsewhere".into(),
            path: dir.path().join("elsewhere"),
            engine: MarkerEngine::new("x"),
        });
        assert!(matches!(reg.swap(foreign), Err(RegistryError::UnknownVersion(_))));
        assert!(reg.current().is_none());
    }

    #[test]
    fn prune_keeps_newest_versions() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path(), 2);
        let mut last = None;
        for i in 0..4 {
            let state = commit(&reg, MarkerEngine::new(&format!("m{i}")));
            reg.swap(state.clone()).unwrap();
            last = Some(state);
        }
        let versions = reg.versions().unwrap();
        assert_eq!(versions.len(), 2);
        assert!(versions.contains(&last.unwrap().version));
    }

    #[test]
    fn base_stage_replaces_existing_base() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path(), 2);

        let staged = reg.stage_base().unwrap();
        MarkerEngine::new("base-1").save(staged.path()).unwrap();
        staged.commit().unwrap();
        assert_eq!(reg.load_base().unwrap().marker, "base-1");

        let staged = reg.stage_base().unwrap();
        MarkerEngine::new("base-2").save(staged.path()).unwrap();
        staged.commit().unwrap();
        assert_eq!(reg.load_base().unwrap().marker, "base-2");
    }

    #[test]
    fn failed_base_commit_restores_previous_base() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path(), 2);

        let staged = reg.stage_base().unwrap();
        MarkerEngine::new("base-1").save(staged.path()).unwrap();
        staged.commit().unwrap();

        // The staging directory vanishes before the final rename.
        let staged = reg.stage_base().unwrap();
        fs::remove_dir_all(staged.path()).unwrap();
        assert!(matches!(staged.commit(), Err(RegistryError::Io { .. })));

        assert_eq!(reg.load_base().unwrap().marker, "base-1");
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name.contains("replaced-"))
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }

    #[test]
    fn load_does_not_overwrite_a_concurrent_swap() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path(), 8);
        let old = commit(&reg, MarkerEngine::new("old"));
        let loaded = commit(&reg, MarkerEngine::new("loaded"));
        let newer = commit(&reg, MarkerEngine::new("newer"));
        reg.swap(old.clone()).unwrap();

        // A load that started while `old` was served finishes after a swap.
        let seen = reg.current();
        reg.swap(newer.clone()).unwrap();
        assert!(!reg.publish_if_unchanged(seen.as_ref(), loaded));
        assert!(Arc::ptr_eq(&reg.current().unwrap(), &newer));

        assert!(reg.publish_if_unchanged(Some(&newer), old.clone()));
        assert!(Arc::ptr_eq(&reg.current().unwrap(), &old));
    }

    #[test]
    fn versions_sort_in_creation_order() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path(), 32);
        let created: Vec<String> = (0..20)
            .map(|i| commit(&reg, MarkerEngine::new(&format!("m{i}"))).version.clone())
            .collect();
        assert_eq!(reg.versions().unwrap(), created);
    }

    #[test]
    fn readers_never_see_a_mixed_state() {
        let dir = tempfile::tempdir().unwrap();
        let reg = Arc::new(registry(dir.path(), 8));
        let old = commit(&reg, MarkerEngine::with_steps("old", 1));
        let new = commit(&reg, MarkerEngine::with_steps("new", 2));
        reg.swap(old.clone()).unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let reg = reg.clone();
                let stop = stop.clone();
                std::thread::spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        let state = reg.current().expect("a model is always served");
                        let pair = (state.engine.marker.as_str(), state.engine.steps);
                        assert!(pair == ("old", 1) || pair == ("new", 2), "mixed state {pair:?}");
                    }
                })
            })
            .collect();

        for i in 0..200 {
            let next = if i % 2 == 0 { new.clone() } else { old.clone() };
            reg.swap(next).unwrap();
        }
        stop.store(true, Ordering::Relaxed);
        for r in readers {
            r.join().unwrap();
        }
    }
}
