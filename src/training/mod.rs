//! Fine-tuning: one end-to-end training run per [`FineTuneJob::run`].
//!
//! A run loads a starting engine, windows the corpus into examples, trains
//! for the requested number of epochs and persists the result into a fresh
//! registry version.  It either returns a complete, committed
//! [`EngineState`] or an error; on error no committed checkpoint changes and
//! the staging directory is gone.
//!
//! Runs are synchronous and CPU-bound.  The orchestrator drives them from
//! `spawn_blocking` and cancels them through the job's token.

pub mod pretrain;

pub use pretrain::{PretrainOutcome, ensure_base, pretrain_base};

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::corpus::{self, CorpusError, TrainingExample};
use crate::engine::{Batch, Engine, EngineError};
use crate::registry::{EngineState, ModelRegistry, RegistryError};

// ── Phase / Error ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Load,
    Dataset,
    Train,
    Persist,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Load => "load",
            Phase::Dataset => "dataset",
            Phase::Train => "train",
            Phase::Persist => "persist",
        })
    }
}

#[derive(Debug, Error)]
pub enum FineTuneError {
    #[error("insufficient data: {examples} examples, need at least {needed}")]
    InsufficientData { examples: usize, needed: usize },
    #[error("no base model at {0}")]
    NoBaseModel(PathBuf),
    #[error("invalid training arguments: {0}")]
    InvalidArguments(String),
    #[error("cannot load starting model: {0}")]
    Load(#[source] RegistryError),
    #[error("corpus error: {0}")]
    Corpus(#[from] CorpusError),
    #[error("engine failure during {phase}: {source}")]
    Engine {
        phase: Phase,
        #[source]
        source: EngineError,
    },
    #[error("cannot persist model: {0}")]
    Persist(#[source] RegistryError),
    #[error("cancelled during {phase}")]
    Cancelled { phase: Phase },
}

impl FineTuneError {
    /// The phase the run was in when it failed.
    pub fn phase(&self) -> Phase {
        match self {
            Self::NoBaseModel(_) | Self::Load(_) | Self::InvalidArguments(_) => Phase::Load,
            Self::InsufficientData { .. } | Self::Corpus(_) => Phase::Dataset,
            Self::Engine { phase, .. } | Self::Cancelled { phase } => *phase,
            Self::Persist(_) => Phase::Persist,
        }
    }

    pub fn is_insufficient_data(&self) -> bool {
        matches!(self, Self::InsufficientData { .. })
    }
}

// ── Options ───────────────────────────────────────────────────────────────────

/// Which checkpoint a fine-tune run continues from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartFrom {
    /// The recorded fine-tuned model, or the base model if none exists.
    #[default]
    Served,
    Base,
}

impl std::str::FromStr for StartFrom {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "served" => Ok(Self::Served),
            "base" => Ok(Self::Base),
            other => Err(format!("unknown start point '{other}' (expected 'served' or 'base')")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainingOptions {
    pub block_size: usize,
    pub start_from: StartFrom,
    /// Shuffle seed.  `None` seeds from the OS.
    pub seed: Option<u64>,
}

impl Default for TrainingOptions {
    fn default() -> Self {
        Self {
            block_size: 128,
            start_from: StartFrom::Served,
            seed: None,
        }
    }
}

// ── FineTuneJob ───────────────────────────────────────────────────────────────

pub struct FineTuneJob<E: Engine> {
    registry: Arc<ModelRegistry<E>>,
    options: TrainingOptions,
    cancel: CancellationToken,
}

impl<E: Engine> FineTuneJob<E> {
    pub fn new(registry: Arc<ModelRegistry<E>>, options: TrainingOptions) -> Self {
        Self {
            registry,
            options,
            cancel: CancellationToken::new(),
        }
    }

    /// Use `token` to cancel the run between batches.
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn run(
        &self,
        corpus_paths: &[PathBuf],
        epochs: usize,
        batch_size: usize,
    ) -> Result<Arc<EngineState<E>>, FineTuneError> {
        check_arguments(self.options.block_size, epochs, batch_size)?;
        let started = Instant::now();

        // ── load ──
        let mut engine = self.load_engine()?;
        self.check_cancelled(Phase::Load)?;

        // ── dataset ──
        let corpus = corpus::read_paths(corpus_paths)?;
        let examples = corpus::build_examples(&corpus, &engine, self.options.block_size)
            .map_err(|source| FineTuneError::Engine { phase: Phase::Dataset, source })?;
        if examples.len() < batch_size {
            return Err(FineTuneError::InsufficientData {
                examples: examples.len(),
                needed: batch_size,
            });
        }
        info!(
            sources = corpus.entries.len(),
            bytes = corpus.total_bytes(),
            examples = examples.len(),
            epochs,
            batch_size,
            "fine-tune dataset ready"
        );

        // ── train ──
        let mut rng = shuffle_rng(self.options.seed);
        train_epochs(&mut engine, &examples, epochs, batch_size, &mut rng, &self.cancel)?;

        // ── persist ──
        self.check_cancelled(Phase::Persist)?;
        let staged = self.registry.stage().map_err(FineTuneError::Persist)?;
        engine
            .save(staged.path())
            .map_err(|source| FineTuneError::Engine { phase: Phase::Persist, source })?;
        let (version, path) = staged.commit().map_err(FineTuneError::Persist)?;

        info!(
            version = %version,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "fine-tune finished"
        );
        Ok(Arc::new(EngineState { version, path, engine }))
    }

    fn load_engine(&self) -> Result<E, FineTuneError> {
        if self.options.start_from == StartFrom::Served {
            match self.registry.load_recorded() {
                Ok(Some(engine)) => {
                    debug!("fine-tune starts from the served model");
                    return Ok(engine);
                }
                Ok(None) => debug!("no fine-tuned model yet; starting from base"),
                Err(e) => warn!(error = %e, "cannot load served model; starting from base"),
            }
        }
        match self.registry.load_base() {
            Ok(engine) => Ok(engine),
            Err(RegistryError::NoBaseModel(path)) => Err(FineTuneError::NoBaseModel(path)),
            Err(e) => Err(FineTuneError::Load(e)),
        }
    }

    fn check_cancelled(&self, phase: Phase) -> Result<(), FineTuneError> {
        if self.cancel.is_cancelled() {
            return Err(FineTuneError::Cancelled { phase });
        }
        Ok(())
    }
}

// ── Shared loop ───────────────────────────────────────────────────────────────

pub(crate) fn check_arguments(
    block_size: usize,
    epochs: usize,
    batch_size: usize,
) -> Result<(), FineTuneError> {
    if block_size < 2 {
        return Err(FineTuneError::InvalidArguments(format!("block_size {block_size} < 2")));
    }
    if epochs == 0 {
        return Err(FineTuneError::InvalidArguments("epochs must be at least 1".into()));
    }
    if batch_size == 0 {
        return Err(FineTuneError::InvalidArguments("batch_size must be at least 1".into()));
    }
    Ok(())
}

pub(crate) fn shuffle_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

/// Run `epochs` passes over `examples`.  Each pass reshuffles and trains on
/// full batches only; examples past the last full batch sit the pass out.
pub(crate) fn train_epochs<E: Engine>(
    engine: &mut E,
    examples: &[TrainingExample],
    epochs: usize,
    batch_size: usize,
    rng: &mut StdRng,
    cancel: &CancellationToken,
) -> Result<(), FineTuneError> {
    let mut order: Vec<usize> = (0..examples.len()).collect();
    for epoch in 1..=epochs {
        order.shuffle(rng);

        let mut loss_sum = 0.0f64;
        let mut batches = 0usize;
        for chunk in order.chunks_exact(batch_size) {
            if cancel.is_cancelled() {
                return Err(FineTuneError::Cancelled { phase: Phase::Train });
            }
            let batch = Batch {
                inputs: chunk.iter().map(|&i| examples[i].input.clone()).collect(),
                labels: chunk.iter().map(|&i| examples[i].label.clone()).collect(),
            };
            let loss = engine
                .train_step(&batch)
                .map_err(|source| FineTuneError::Engine { phase: Phase::Train, source })?;
            loss_sum += f64::from(loss);
            batches += 1;
        }

        let mean_loss = if batches == 0 { 0.0 } else { loss_sum / batches as f64 };
        info!(epoch, epochs, batches, mean_loss, "epoch finished");
    }
    Ok(())
}

/// Convenience for callers holding a single corpus directory.
pub fn corpus_dir(path: &Path) -> Vec<PathBuf> {
    vec![path.to_path_buf()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::MarkerEngine;
    use std::fs;

    struct Fixture {
        _root: tempfile::TempDir,
        corpus: PathBuf,
        registry: Arc<ModelRegistry<MarkerEngine>>,
    }

    /// Registry with a saved base engine and a corpus directory holding
    /// `text`.
    fn fixture(base: MarkerEngine, text: &str) -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let registry =
            Arc::new(ModelRegistry::open(root.path().join("base"), root.path().join("ft"), 3).unwrap());
        let staged = registry.stage_base().unwrap();
        base.save(staged.path()).unwrap();
        staged.commit().unwrap();

        let corpus = root.path().join("corpus");
        fs::create_dir_all(&corpus).unwrap();
        fs::write(corpus.join("chan.txt"), text).unwrap();
        Fixture { _root: root, corpus, registry }
    }

    fn options(block_size: usize) -> TrainingOptions {
        TrainingOptions { block_size, start_from: StartFrom::Served, seed: Some(7) }
    }

    fn leftover_staging(registry: &ModelRegistry<MarkerEngine>) -> usize {
        let dir = registry.base_dir().parent().unwrap().join("ft");
        fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".staging-"))
            .count()
    }

    #[test]
    fn trains_every_full_batch_each_epoch() {
        // 100 bytes at B=10 → 10 examples → 3 full batches of 3 per epoch.
        let fx = fixture(MarkerEngine::new("base"), &"x".repeat(100));
        let job = FineTuneJob::new(fx.registry.clone(), options(10));
        let state = job.run(&corpus_dir(&fx.corpus), 2, 3).unwrap();

        assert_eq!(state.engine.steps, 6);
        assert!(state.path.is_dir());
        assert_eq!(fx.registry.versions().unwrap(), vec![state.version.clone()]);
        assert!(fx.registry.current().is_none(), "run does not swap");
    }

    #[test]
    fn fewer_examples_than_a_batch_is_insufficient() {
        let fx = fixture(MarkerEngine::new("base"), &"x".repeat(25));
        let job = FineTuneJob::new(fx.registry.clone(), options(10));
        let err = job.run(&corpus_dir(&fx.corpus), 1, 3).unwrap_err();

        assert!(matches!(err, FineTuneError::InsufficientData { examples: 2, needed: 3 }));
        assert_eq!(err.phase(), Phase::Dataset);
        assert!(fx.registry.versions().unwrap().is_empty());
    }

    #[test]
    fn corpus_shorter_than_a_block_is_insufficient() {
        let fx = fixture(MarkerEngine::new("base"), "tiny");
        let job = FineTuneJob::new(fx.registry.clone(), options(128));
        let err = job.run(&corpus_dir(&fx.corpus), 1, 1).unwrap_err();
        assert!(err.is_insufficient_data());
    }

    #[test]
    fn engine_failure_leaves_no_checkpoint() {
        let fx = fixture(MarkerEngine::failing_at("base", 2), &"x".repeat(100));
        let job = FineTuneJob::new(fx.registry.clone(), options(10));
        let err = job.run(&corpus_dir(&fx.corpus), 1, 2).unwrap_err();

        assert!(matches!(err, FineTuneError::Engine { phase: Phase::Train, .. }));
        assert!(fx.registry.versions().unwrap().is_empty());
        assert_eq!(leftover_staging(&fx.registry), 0);
    }

    #[test]
    fn cancelled_job_stops_before_training() {
        let fx = fixture(MarkerEngine::new("base"), &"x".repeat(100));
        let token = CancellationToken::new();
        token.cancel();
        let job = FineTuneJob::new(fx.registry.clone(), options(10)).with_cancel(token);
        let err = job.run(&corpus_dir(&fx.corpus), 1, 2).unwrap_err();

        assert!(matches!(err, FineTuneError::Cancelled { .. }));
        assert!(fx.registry.versions().unwrap().is_empty());
    }

    #[test]
    fn missing_base_model() {
        let root = tempfile::tempdir().unwrap();
        let registry: Arc<ModelRegistry<MarkerEngine>> =
            Arc::new(ModelRegistry::open(root.path().join("base"), root.path().join("ft"), 3).unwrap());
        let corpus = root.path().join("c.txt");
        fs::write(&corpus, "x".repeat(100)).unwrap();

        let err = FineTuneJob::new(registry, options(10)).run(&[corpus], 1, 1).unwrap_err();
        assert!(matches!(err, FineTuneError::NoBaseModel(_)));
        assert_eq!(err.phase(), Phase::Load);
    }

    #[test]
    fn served_model_is_the_default_start_point() {
        let fx = fixture(MarkerEngine::new("base"), &"x".repeat(40));
        let first = FineTuneJob::new(fx.registry.clone(), options(10))
            .run(&corpus_dir(&fx.corpus), 1, 2)
            .unwrap();
        fx.registry.swap(first.clone()).unwrap();
        assert_eq!(first.engine.steps, 2);

        let second = FineTuneJob::new(fx.registry.clone(), options(10))
            .run(&corpus_dir(&fx.corpus), 1, 2)
            .unwrap();
        assert_eq!(second.engine.steps, 4, "continued from the served checkpoint");

        let from_base = FineTuneJob::new(
            fx.registry.clone(),
            TrainingOptions { start_from: StartFrom::Base, ..options(10) },
        )
        .run(&corpus_dir(&fx.corpus), 1, 2)
        .unwrap();
        assert_eq!(from_base.engine.steps, 2);
    }

    #[test]
    fn invalid_arguments_are_rejected() {
        let fx = fixture(MarkerEngine::new("base"), &"x".repeat(40));
        let job = FineTuneJob::new(fx.registry.clone(), options(10));
        assert!(matches!(
            job.run(&corpus_dir(&fx.corpus), 0, 1),
            Err(FineTuneError::InvalidArguments(_))
        ));
        assert!(matches!(
            job.run(&corpus_dir(&fx.corpus), 1, 0),
            Err(FineTuneError::InvalidArguments(_))
        ));
    }

    #[test]
    fn start_from_parses() {
        assert_eq!("served".parse::<StartFrom>().unwrap(), StartFrom::Served);
        assert_eq!(" Base ".parse::<StartFrom>().unwrap(), StartFrom::Base);
        assert!("latest".parse::<StartFrom>().is_err());
    }
}
