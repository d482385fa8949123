//! Corpus windowing: raw text to next-token training examples.
//!
//! The whole corpus is encoded once and cut into consecutive,
//! non-overlapping blocks of exactly `block_size` tokens.  A trailing
//! remainder shorter than a block is discarded.  Each block becomes one
//! independent example whose label is the input shifted by one token.

use crate::engine::{Engine, EngineError, TokenId};

use super::RawCorpus;

/// Exactly `block_size` consecutive tokens of the encoded corpus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenBlock(Vec<TokenId>);

impl TokenBlock {
    pub fn tokens(&self) -> &[TokenId] {
        &self.0
    }
}

/// Shift-by-one pair derived from a [`TokenBlock`]:
/// `input = block[..B-1]`, `label = block[1..]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainingExample {
    pub input: Vec<TokenId>,
    pub label: Vec<TokenId>,
}

impl From<&TokenBlock> for TrainingExample {
    fn from(block: &TokenBlock) -> Self {
        let tokens = block.tokens();
        Self {
            input: tokens[..tokens.len() - 1].to_vec(),
            label: tokens[1..].to_vec(),
        }
    }
}

/// Slice `tokens` into blocks of `block_size` and derive one example per
/// block.  Returns no examples when fewer than `block_size` tokens are
/// available, or when `block_size < 2` (no next-token target fits).
pub fn window(tokens: &[TokenId], block_size: usize) -> Vec<TrainingExample> {
    if block_size < 2 {
        return Vec::new();
    }
    tokens
        .chunks_exact(block_size)
        .map(|chunk| TrainingExample::from(&TokenBlock(chunk.to_vec())))
        .collect()
}

/// Encode `corpus` with `engine` and window it.  An empty result means
/// "insufficient data"; only engine failures are errors.
pub fn build_examples<E: Engine>(
    corpus: &RawCorpus,
    engine: &E,
    block_size: usize,
) -> Result<Vec<TrainingExample>, EngineError> {
    let tokens = engine.encode(&corpus.concatenated())?;
    Ok(window(&tokens, block_size))
}
