//! Deterministic engine for unit tests.
//!
//! Generation always returns `"<marker>@<steps>"`, which makes it obvious
//! which checkpoint produced a reply.  A failure can be injected at a given
//! training step; it survives save/load so it also fires inside jobs that
//! load their engine from disk.  A per-step delay makes training slow
//! enough to exercise timeouts.

use std::fs;
use std::path::Path;
use std::time::Duration;

use super::{Batch, Engine, EngineError, GenerationParams, TokenId};

const STATE_FILE: &str = "marker.txt";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerEngine {
    pub marker: String,
    pub steps: u64,
    pub fail_on_step: Option<u64>,
    pub step_delay_ms: u64,
}

impl MarkerEngine {
    pub fn new(marker: &str) -> Self {
        Self { marker: marker.to_string(), steps: 0, fail_on_step: None, step_delay_ms: 0 }
    }

    pub fn with_steps(marker: &str, steps: u64) -> Self {
        Self { steps, ..Self::new(marker) }
    }

    pub fn failing_at(marker: &str, step: u64) -> Self {
        Self { fail_on_step: Some(step), ..Self::new(marker) }
    }

    pub fn slow(marker: &str, step_delay_ms: u64) -> Self {
        Self { step_delay_ms, ..Self::new(marker) }
    }
}

impl Engine for MarkerEngine {
    fn kind(&self) -> &'static str {
        "marker"
    }

    fn encode(&self, text: &str) -> Result<Vec<TokenId>, EngineError> {
        Ok(text.bytes().map(TokenId::from).collect())
    }

    fn decode(&self, ids: &[TokenId]) -> Result<String, EngineError> {
        let bytes: Vec<u8> = ids.iter().map(|&id| id as u8).collect();
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn train_step(&mut self, batch: &Batch) -> Result<f32, EngineError> {
        batch.validate()?;
        if self.step_delay_ms > 0 {
            std::thread::sleep(Duration::from_millis(self.step_delay_ms));
        }
        if self.fail_on_step == Some(self.steps + 1) {
            return Err(EngineError::MalformedBatch("injected failure".into()));
        }
        self.steps += 1;
        Ok(1.0 / self.steps as f32)
    }

    fn generate(
        &self,
        _prompt: &[TokenId],
        params: &GenerationParams,
    ) -> Result<Vec<TokenId>, EngineError> {
        let mut out = self.encode(&format!("{}@{}", self.marker, self.steps))?;
        out.truncate(params.max_new_tokens);
        Ok(out)
    }

    fn save(&self, dir: &Path) -> Result<(), EngineError> {
        let fail = self.fail_on_step.map(|s| s.to_string()).unwrap_or_default();
        fs::write(
            dir.join(STATE_FILE),
            format!("{}\n{}\n{}\n{}\n", self.marker, self.steps, fail, self.step_delay_ms),
        )?;
        Ok(())
    }

    fn load(dir: &Path) -> Result<Self, EngineError> {
        let raw = fs::read_to_string(dir.join(STATE_FILE))?;
        let mut lines = raw.lines();
        let marker = lines.next().unwrap_or_default().to_string();
        let steps = lines
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| EngineError::Corrupt("missing step count".into()))?;
        let fail_on_step = lines.next().and_then(|s| s.parse().ok());
        let step_delay_ms = lines.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        Ok(Self { marker, steps, fail_on_step, step_delay_ms })
    }
}
