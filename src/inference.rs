//! Inference: one utterance in, one bounded reply out.
//!
//! A reply is the utterance followed by its continuation, at most
//! `max_length` tokens in total.  Setting `echo_prompt = false` drops the
//! utterance and keeps the continuation alone; the bound is unchanged.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::engine::{Engine, EngineError, GenerationParams};
use crate::registry::{EngineState, ModelRegistry};

/// Reply given whenever no model can answer.
pub const UNAVAILABLE_MESSAGE: &str = "The model is not loaded yet. Run `learn` first.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyParams {
    /// Upper bound on the reply in tokens, prompt included.
    pub max_length: usize,
    pub no_repeat_ngram_size: usize,
    pub echo_prompt: bool,
}

impl Default for ReplyParams {
    fn default() -> Self {
        Self { max_length: 50, no_repeat_ngram_size: 2, echo_prompt: true }
    }
}

impl ReplyParams {
    /// Generation settings for a prompt of `prompt_len` tokens.  A prompt
    /// already at the bound leaves no room for new tokens.
    fn generation(&self, prompt_len: usize) -> GenerationParams {
        GenerationParams {
            max_new_tokens: self.max_length.saturating_sub(prompt_len),
            no_repeat_ngram_size: self.no_repeat_ngram_size,
        }
    }
}

pub struct InferenceService<E: Engine> {
    registry: Arc<ModelRegistry<E>>,
    params: ReplyParams,
}

impl<E: Engine> Clone for InferenceService<E> {
    fn clone(&self) -> Self {
        Self { registry: self.registry.clone(), params: self.params.clone() }
    }
}

impl<E: Engine> InferenceService<E> {
    pub fn new(registry: Arc<ModelRegistry<E>>, params: ReplyParams) -> Self {
        Self { registry, params }
    }

    /// Generate a reply to `utterance`.  Never fails: with no model, or when
    /// the engine errors, the answer is [`UNAVAILABLE_MESSAGE`].
    ///
    /// Blocking; async callers run it through `spawn_blocking`.
    pub fn reply(&self, utterance: &str) -> String {
        let Some(state) = self.registry.current().or_else(|| self.registry.load()) else {
            debug!("no model loaded; replying with the unavailable message");
            return UNAVAILABLE_MESSAGE.to_string();
        };

        match self.generate(&state, utterance) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(version = %state.version, error = %e, "generation failed");
                UNAVAILABLE_MESSAGE.to_string()
            }
        }
    }

    fn generate(&self, state: &EngineState<E>, utterance: &str) -> Result<String, EngineError> {
        let prompt = state.engine.encode(utterance)?;
        let output = state.engine.generate(&prompt, &self.params.generation(prompt.len()))?;
        let reply = if self.params.echo_prompt {
            let mut tokens = prompt.clone();
            tokens.extend_from_slice(&output);
            state.engine.decode(&tokens)?
        } else {
            state.engine.decode(&output)?
        };
        debug!(
            version = %state.version,
            prompt_tokens = prompt.len(),
            reply_tokens = output.len(),
            "reply generated"
        );
        Ok(reply)
    }
}
