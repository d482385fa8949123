//! Built-in byte-level back-off n-gram engine.
//!
//! Vocabulary is the 256 byte values plus three special tokens, so any UTF-8
//! text encodes without an external tokenizer.  Training accumulates weighted
//! next-token counts for every context length up to `order - 1`; generation
//! is greedy and backs off to shorter contexts when the no-repeat constraint
//! bans every candidate at the current one.
//!
//! Checkpoint layout:
//! ```text
//! <dir>/
//! ├── ngram.json     (serialised counts)
//! └── ngram.sha256   (hex SHA-256 of ngram.json)
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, trace};

use super::{Batch, Engine, EngineError, GenerationParams, TokenId, banned_tokens};

pub const BOS: TokenId = 256;
pub const EOS: TokenId = 257;
pub const PAD: TokenId = 258;
pub const VOCAB_SIZE: usize = 259;

const WEIGHTS_FILE: &str = "ngram.json";
const DIGEST_FILE: &str = "ngram.sha256";
const FORMAT: &str = "ngram-bytes/1";

// ── Counts ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
struct NextCounts {
    total: f64,
    next: HashMap<TokenId, f64>,
}

impl NextCounts {
    fn add(&mut self, token: TokenId, weight: f64) {
        *self.next.entry(token).or_insert(0.0) += weight;
        self.total += weight;
    }

    /// Add-one smoothed probability of `token` in this context.
    fn prob(&self, token: TokenId) -> f64 {
        let c = self.next.get(&token).copied().unwrap_or(0.0);
        (c + 1.0) / (self.total + VOCAB_SIZE as f64)
    }

    /// Highest-weight token not in `banned`; ties go to the lowest id.
    fn best(&self, banned: &[TokenId]) -> Option<TokenId> {
        self.next
            .iter()
            .filter(|(t, _)| banned.binary_search(t).is_err())
            .max_by(|(ta, wa), (tb, wb)| wa.total_cmp(wb).then_with(|| tb.cmp(ta)))
            .map(|(t, _)| *t)
    }
}

// ── Engine ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct NgramEngine {
    order: usize,
    learning_rate: f32,
    steps: u64,
    contexts: HashMap<Vec<TokenId>, NextCounts>,
}

impl NgramEngine {
    /// Untrained engine.  `order` is the longest n-gram tracked (context is
    /// `order - 1` tokens) and is clamped to at least 1.
    pub fn new(order: usize, learning_rate: f32) -> Self {
        Self {
            order: order.max(1),
            learning_rate,
            steps: 0,
            contexts: HashMap::new(),
        }
    }

    pub fn order(&self) -> usize {
        self.order
    }

    /// Number of optimisation steps applied so far.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    fn max_context(&self) -> usize {
        self.order - 1
    }

    fn prob(&self, history: &[TokenId], target: TokenId) -> f64 {
        let longest = self.max_context().min(history.len());
        (0..=longest)
            .rev()
            .find_map(|k| self.contexts.get(&history[history.len() - k..]))
            .map_or(1.0 / VOCAB_SIZE as f64, |counts| counts.prob(target))
    }

    fn predict(&self, history: &[TokenId], banned: &[TokenId]) -> Option<TokenId> {
        let longest = self.max_context().min(history.len());
        (0..=longest).rev().find_map(|k| {
            self.contexts
                .get(&history[history.len() - k..])
                .and_then(|counts| counts.best(banned))
        })
    }

    fn check_ids(ids: &[TokenId]) -> Result<(), TokenId> {
        match ids.iter().find(|&&id| id as usize >= VOCAB_SIZE) {
            Some(&id) => Err(id),
            None => Ok(()),
        }
    }
}

impl Engine for NgramEngine {
    fn kind(&self) -> &'static str {
        "ngram-bytes"
    }

    fn encode(&self, text: &str) -> Result<Vec<TokenId>, EngineError> {
        Ok(text.bytes().map(TokenId::from).collect())
    }

    fn decode(&self, ids: &[TokenId]) -> Result<String, EngineError> {
        Self::check_ids(ids)
            .map_err(|id| EngineError::Decode(format!("token id {id} outside vocabulary")))?;
        let bytes: Vec<u8> = ids
            .iter()
            .filter(|&&id| id < BOS)
            .map(|&id| id as u8)
            .collect();
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn train_step(&mut self, batch: &Batch) -> Result<f32, EngineError> {
        batch.validate()?;
        for row in batch.inputs.iter().chain(&batch.labels) {
            Self::check_ids(row).map_err(|id| {
                EngineError::MalformedBatch(format!("token id {id} outside vocabulary"))
            })?;
        }

        let mut loss = 0.0f64;
        let mut positions = 0usize;

        for (input, label) in batch.inputs.iter().zip(&batch.labels) {
            for (i, &target) in label.iter().enumerate() {
                let history = &input[..=i];
                loss -= self.prob(history, target).ln();
                positions += 1;

                let longest = self.max_context().min(history.len());
                for k in 0..=longest {
                    self.contexts
                        .entry(history[history.len() - k..].to_vec())
                        .or_default()
                        .add(target, f64::from(self.learning_rate));
                }
            }
        }

        self.steps += 1;
        let mean = (loss / positions as f64) as f32;
        trace!(step = self.steps, rows = batch.len(), loss = mean, "ngram train step");
        Ok(mean)
    }

    fn generate(
        &self,
        prompt: &[TokenId],
        params: &GenerationParams,
    ) -> Result<Vec<TokenId>, EngineError> {
        Self::check_ids(prompt)
            .map_err(|id| EngineError::Generate(format!("prompt token {id} outside vocabulary")))?;

        let mut seq = prompt.to_vec();
        let mut out = Vec::with_capacity(params.max_new_tokens);

        while out.len() < params.max_new_tokens {
            let banned = banned_tokens(&seq, params.no_repeat_ngram_size);
            match self.predict(&seq, &banned) {
                None | Some(EOS) => break,
                Some(token) => {
                    seq.push(token);
                    out.push(token);
                }
            }
        }
        Ok(out)
    }

    fn save(&self, dir: &Path) -> Result<(), EngineError> {
        let mut records: Vec<ContextRecord> = self
            .contexts
            .iter()
            .map(|(context, counts)| {
                let mut next: Vec<(TokenId, f64)> =
                    counts.next.iter().map(|(t, w)| (*t, *w)).collect();
                next.sort_unstable_by_key(|(t, _)| *t);
                ContextRecord { context: context.clone(), next }
            })
            .collect();
        records.sort_unstable_by(|a, b| a.context.cmp(&b.context));

        let checkpoint = Checkpoint {
            format: FORMAT.to_string(),
            order: self.order,
            learning_rate: self.learning_rate,
            steps: self.steps,
            contexts: records,
        };
        let bytes = serde_json::to_vec(&checkpoint)
            .map_err(|e| EngineError::Corrupt(format!("cannot serialise counts: {e}")))?;

        fs::write(dir.join(WEIGHTS_FILE), &bytes)?;
        fs::write(dir.join(DIGEST_FILE), digest(&bytes))?;
        debug!(dir = %dir.display(), contexts = checkpoint.contexts.len(), "ngram checkpoint saved");
        Ok(())
    }

    fn load(dir: &Path) -> Result<Self, EngineError> {
        let bytes = fs::read(dir.join(WEIGHTS_FILE))?;
        let expected = fs::read_to_string(dir.join(DIGEST_FILE))?;
        if expected.trim() != digest(&bytes) {
            return Err(EngineError::Corrupt(format!(
                "{} does not match its digest",
                dir.join(WEIGHTS_FILE).display()
            )));
        }

        let checkpoint: Checkpoint = serde_json::from_slice(&bytes)
            .map_err(|e| EngineError::Corrupt(format!("cannot parse counts: {e}")))?;
        if checkpoint.format != FORMAT {
            return Err(EngineError::Corrupt(format!(
                "unsupported checkpoint format: {}",
                checkpoint.format
            )));
        }

        let contexts = checkpoint
            .contexts
            .into_iter()
            .map(|record| {
                let mut counts = NextCounts::default();
                for (token, weight) in record.next {
                    counts.add(token, weight);
                }
                (record.context, counts)
            })
            .collect();

        Ok(Self {
            order: checkpoint.order.max(1),
            learning_rate: checkpoint.learning_rate,
            steps: checkpoint.steps,
            contexts,
        })
    }
}

// ── On-disk shape ────────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct Checkpoint {
    format: String,
    order: usize,
    learning_rate: f32,
    steps: u64,
    contexts: Vec<ContextRecord>,
}

#[derive(Serialize, Deserialize)]
struct ContextRecord {
    context: Vec<TokenId>,
    next: Vec<(TokenId, f64)>,
}

fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
