//! Base model preparation.
//!
//! Trains a fresh engine on a large general corpus and commits it as the
//! base model every fine-tune run can fall back to.  An optional preamble
//! (a description of the bot and its commands) is placed ahead of the
//! corpus text so the model sees it first.

use std::path::PathBuf;

use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{FineTuneError, Phase, TrainingOptions, check_arguments, shuffle_rng, train_epochs};
use crate::corpus::{self, TrainingExample};
use crate::engine::{Engine, EngineError};
use crate::registry::ModelRegistry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PretrainOutcome {
    /// A base model already existed and `force` was not set.
    Skipped(PathBuf),
    Written { path: PathBuf, examples: usize },
}

#[allow(clippy::too_many_arguments)]
pub fn pretrain_base<E: Engine>(
    registry: &ModelRegistry<E>,
    mut engine: E,
    corpus_paths: &[PathBuf],
    preamble: Option<&str>,
    options: &TrainingOptions,
    epochs: usize,
    batch_size: usize,
    force: bool,
) -> Result<PretrainOutcome, FineTuneError> {
    if registry.has_base() && !force {
        info!(path = %registry.base_dir().display(), "base model exists; skipping pretraining");
        return Ok(PretrainOutcome::Skipped(registry.base_dir().to_path_buf()));
    }
    check_arguments(options.block_size, epochs, batch_size)?;

    let corpus = corpus::read_paths(corpus_paths)?;
    let mut text = String::with_capacity(corpus.total_bytes() + preamble.map_or(0, str::len) + 2);
    if let Some(preamble) = preamble.map(str::trim).filter(|p| !p.is_empty()) {
        text.push_str(preamble);
        text.push_str("\n\n");
    }
    text.push_str(&corpus.concatenated());

    let examples = encode_examples(&engine, &text, options.block_size)
        .map_err(|source| FineTuneError::Engine { phase: Phase::Dataset, source })?;
    if examples.len() < batch_size {
        return Err(FineTuneError::InsufficientData {
            examples: examples.len(),
            needed: batch_size,
        });
    }
    info!(
        kind = engine.kind(),
        bytes = text.len(),
        examples = examples.len(),
        epochs,
        "pretraining base model"
    );

    let mut rng = shuffle_rng(options.seed);
    train_epochs(&mut engine, &examples, epochs, batch_size, &mut rng, &CancellationToken::new())?;

    let staged = registry.stage_base().map_err(FineTuneError::Persist)?;
    engine
        .save(staged.path())
        .map_err(|source| FineTuneError::Engine { phase: Phase::Persist, source })?;
    let (_, path) = staged.commit().map_err(FineTuneError::Persist)?;

    info!(path = %path.display(), "base model written");
    Ok(PretrainOutcome::Written { path, examples: examples.len() })
}

/// Write `engine` untrained as the base model if none exists yet.
/// Returns `true` when a base was created.
pub fn ensure_base<E: Engine>(registry: &ModelRegistry<E>, engine: E) -> Result<bool, FineTuneError> {
    if registry.has_base() {
        return Ok(false);
    }
    let staged = registry.stage_base().map_err(FineTuneError::Persist)?;
    engine
        .save(staged.path())
        .map_err(|source| FineTuneError::Engine { phase: Phase::Persist, source })?;
    let (_, path) = staged.commit().map_err(FineTuneError::Persist)?;
    info!(path = %path.display(), kind = engine.kind(), "blank base model created");
    Ok(true)
}

fn encode_examples<E: Engine>(
    engine: &E,
    text: &str,
    block_size: usize,
) -> Result<Vec<TrainingExample>, EngineError> {
    let tokens = engine.encode(text)?;
    Ok(corpus::window(&tokens, block_size))
}
