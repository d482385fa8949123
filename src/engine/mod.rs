//! Language model engine capability.
//!
//! The rest of the crate never touches weights or vocabularies directly: it
//! goes through [`Engine`], which covers tokenisation, a single optimisation
//! step, bounded generation and checkpoint I/O.  Every core component is
//! generic over it, so a heavier numeric backend can replace the built-in
//! [`ngram::NgramEngine`] without touching the training or serving paths.
//!
//! Engines are synchronous and CPU-bound.  Async callers move them onto the
//! blocking pool (`tokio::task::spawn_blocking`).

pub mod ngram;
#[cfg(test)]
pub(crate) mod testing;

pub use ngram::NgramEngine;

use std::path::Path;

use thiserror::Error;

/// Integer id of a single token in an engine's vocabulary.
pub type TokenId = u32;

// ── Error ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("malformed batch: {0}")]
    MalformedBatch(String),
    #[error("generation failed: {0}")]
    Generate(String),
    #[error("checkpoint io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt checkpoint: {0}")]
    Corrupt(String),
}

// ── Batch ─────────────────────────────────────────────────────────────────────

/// One optimisation batch: row `i` of `inputs` is trained against row `i` of
/// `labels` (next-token targets, same length).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    pub inputs: Vec<Vec<TokenId>>,
    pub labels: Vec<Vec<TokenId>>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Check the shape invariants every engine relies on.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.inputs.is_empty() {
            return Err(EngineError::MalformedBatch("empty batch".into()));
        }
        if self.inputs.len() != self.labels.len() {
            return Err(EngineError::MalformedBatch(format!(
                "{} input rows but {} label rows",
                self.inputs.len(),
                self.labels.len()
            )));
        }
        for (row, (input, label)) in self.inputs.iter().zip(&self.labels).enumerate() {
            if input.len() != label.len() {
                return Err(EngineError::MalformedBatch(format!(
                    "row {row}: input length {} != label length {}",
                    input.len(),
                    label.len()
                )));
            }
            if input.is_empty() {
                return Err(EngineError::MalformedBatch(format!("row {row} is empty")));
            }
        }
        Ok(())
    }
}

// ── Generation ────────────────────────────────────────────────────────────────

/// Bounds applied to a single generation call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationParams {
    /// Maximum number of tokens produced after the prompt.
    pub max_new_tokens: usize,
    /// No n-gram of this size may occur twice in prompt + output. `0` disables.
    pub no_repeat_ngram_size: usize,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_new_tokens: 50,
            no_repeat_ngram_size: 2,
        }
    }
}

/// Tokens that would complete an n-gram already present in `seq`.
///
/// With `n == 2` and `seq = [a, b, a]` the result is `{b}`: emitting `b`
/// next would repeat the bigram `(a, b)`.
pub fn banned_tokens(seq: &[TokenId], n: usize) -> Vec<TokenId> {
    if n == 0 || seq.len() + 1 < n {
        return Vec::new();
    }
    let prefix = &seq[seq.len() + 1 - n..];
    let mut banned: Vec<TokenId> = seq
        .windows(n)
        .filter(|w| &w[..n - 1] == prefix)
        .map(|w| w[n - 1])
        .collect();
    banned.sort_unstable();
    banned.dedup();
    banned
}

// ── Engine ────────────────────────────────────────────────────────────────────

/// The language model capability the core is built on.
pub trait Engine: Send + Sync + Sized + 'static {
    /// Short backend name, recorded in logs.
    fn kind(&self) -> &'static str;

    fn encode(&self, text: &str) -> Result<Vec<TokenId>, EngineError>;

    /// Decode `ids` back to text with special tokens stripped.
    fn decode(&self, ids: &[TokenId]) -> Result<String, EngineError>;

    /// Run one optimisation step and return the batch loss.
    fn train_step(&mut self, batch: &Batch) -> Result<f32, EngineError>;

    /// Generate a continuation of `prompt`.  Only the new tokens are returned.
    fn generate(
        &self,
        prompt: &[TokenId],
        params: &GenerationParams,
    ) -> Result<Vec<TokenId>, EngineError>;

    /// Write the full engine state into `dir` (which already exists).
    fn save(&self, dir: &Path) -> Result<(), EngineError>;

    /// Read an engine state previously written by [`Engine::save`].
    fn load(dir: &Path) -> Result<Self, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bigram_ban_blocks_repeat() {
        assert_eq!(banned_tokens(&[1, 2, 1], 2), vec![2]);
        assert_eq!(banned_tokens(&[1, 2, 3], 2), Vec::<TokenId>::new());
    }

    #[test]
    fn trigram_ban_uses_two_token_prefix() {
        // (4, 5) was followed by 6 earlier; the sequence now ends in (4, 5).
        assert_eq!(banned_tokens(&[4, 5, 6, 7, 4, 5], 3), vec![6]);
    }

    #[test]
    fn ban_disabled_or_too_short() {
        assert!(banned_tokens(&[1, 1, 1], 0).is_empty());
        assert!(banned_tokens(&[1], 3).is_empty());
        assert!(banned_tokens(&[], 2).is_empty());
    }

    #[test]
    fn unigram_ban_is_everything_seen() {
        assert_eq!(banned_tokens(&[3, 1, 3], 1), vec![1, 3]);
    }

    #[test]
    fn batch_validation() {
        let ok = Batch { inputs: vec![vec![1, 2]], labels: vec![vec![2, 3]] };
        assert!(ok.validate().is_ok());

        let ragged = Batch { inputs: vec![vec![1, 2]], labels: vec![vec![2]] };
        assert!(matches!(ragged.validate(), Err(EngineError::MalformedBatch(_))));

        let uneven = Batch { inputs: vec![vec![1]], labels: vec![] };
        assert!(uneven.validate().is_err());

        assert!(Batch::default().validate().is_err());
    }
}
