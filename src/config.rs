//! Configuration loading with env-var overrides.
//!
//! Reads `config/default.toml` relative to the current working directory
//! (or the file given with `--config`), then applies `KOE_WORK_DIR` and
//! `KOE_LOG_LEVEL` env overrides.  Relative data paths resolve against the
//! work directory.

use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::inference::ReplyParams;
use crate::error::AppError;
use crate::orchestrator::RetrainSettings;
use crate::training::{StartFrom, TrainingOptions};

const DEFAULT_CONFIG_PATH: &str = "config/default.toml";
const WEEK_SECS: u64 = 7 * 24 * 3600;

/// PTY (console) channel configuration.
#[derive(Debug, Clone)]
pub struct PtyConfig {
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct CommsConfig {
    pub pty: PtyConfig,
}

/// Chat-facing behaviour.
#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Messages starting with this word are commands, e.g. `!koe Run`.
    pub command_prefix: String,
}

/// Checkpoint locations and engine hyper-parameters.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub base_dir: PathBuf,
    pub versions_dir: PathBuf,
    /// Committed fine-tuned versions kept on disk.
    pub keep_versions: usize,
    /// Context length of the built-in n-gram engine.
    pub ngram_order: usize,
    /// Weight added per observed token.
    pub learning_rate: f32,
}

#[derive(Debug, Clone)]
pub struct CorpusConfig {
    /// Observed-dialogue history (`<source>.jsonl`).
    pub history_dir: PathBuf,
    /// Full corpus snapshot written by `collect`, read by `learn`.
    pub data_dir: PathBuf,
    /// Snapshot of the most recent retrain window.
    pub weekly_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct TrainingConfig {
    pub block_size: usize,
    pub batch_size: usize,
    /// Epochs for operator-triggered runs (`learn`).
    pub epochs: usize,
    pub start_from: StartFrom,
    pub seed: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct RetrainConfig {
    pub period: Duration,
    pub window: Duration,
    /// Epochs for scheduled runs.
    pub epochs: usize,
    /// `None` when `timeout_secs = 0`.
    pub timeout: Option<Duration>,
}

/// Fully-resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub bot_name: String,
    /// Working directory for all persistent data (already expanded, no `~`).
    pub work_dir: PathBuf,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
    pub comms: CommsConfig,
    pub bot: BotConfig,
    pub model: ModelConfig,
    pub corpus: CorpusConfig,
    pub training: TrainingConfig,
    pub retrain: RetrainConfig,
    pub inference: ReplyParams,
}

impl Config {
    /// Returns `true` if the PTY channel should be loaded.
    pub fn comms_pty_should_load(&self) -> bool {
        self.comms.pty.enabled
    }

    pub fn training_options(&self) -> TrainingOptions {
        TrainingOptions {
            block_size: self.training.block_size,
            start_from: self.training.start_from,
            seed: self.training.seed,
        }
    }

    pub fn retrain_settings(&self) -> RetrainSettings {
        RetrainSettings {
            period: self.retrain.period,
            window: self.retrain.window,
            epochs: self.retrain.epochs,
            batch_size: self.training.batch_size,
            timeout: self.retrain.timeout,
            snapshot_dir: self.corpus.weekly_dir.clone(),
        }
    }
}

// ── Raw TOML shape ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RawConfig {
    supervisor: RawSupervisor,
    #[serde(default)]
    comms: RawComms,
    #[serde(default)]
    bot: RawBot,
    #[serde(default)]
    model: RawModel,
    #[serde(default)]
    corpus: RawCorpus,
    #[serde(default)]
    training: RawTraining,
    #[serde(default)]
    retrain: RawRetrain,
    #[serde(default)]
    inference: RawInference,
}

#[derive(Deserialize)]
struct RawSupervisor {
    bot_name: String,
    work_dir: String,
    log_level: String,
    #[serde(default)]
    log_file: Option<String>,
}

#[derive(Deserialize, Default)]
struct RawComms {
    #[serde(default)]
    pty: RawPty,
}

#[derive(Deserialize)]
struct RawPty {
    #[serde(default = "default_true")]
    enabled: bool,
}

impl Default for RawPty {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Deserialize)]
struct RawBot {
    #[serde(default = "default_command_prefix")]
    command_prefix: String,
}

impl Default for RawBot {
    fn default() -> Self {
        Self { command_prefix: default_command_prefix() }
    }
}

#[derive(Deserialize)]
#[serde(default)]
struct RawModel {
    base_dir: String,
    versions_dir: String,
    keep_versions: usize,
    ngram_order: usize,
    learning_rate: f32,
}

impl Default for RawModel {
    fn default() -> Self {
        Self {
            base_dir: "models/base".into(),
            versions_dir: "models/fine_tuned".into(),
            keep_versions: 3,
            ngram_order: 6,
            learning_rate: 1.0,
        }
    }
}

#[derive(Deserialize)]
#[serde(default)]
struct RawCorpus {
    history_dir: String,
    data_dir: String,
    weekly_dir: String,
}

impl Default for RawCorpus {
    fn default() -> Self {
        Self {
            history_dir: "history".into(),
            data_dir: "data".into(),
            weekly_dir: "data/weekly".into(),
        }
    }
}

#[derive(Deserialize)]
#[serde(default)]
struct RawTraining {
    block_size: usize,
    batch_size: usize,
    epochs: usize,
    start_from: String,
    seed: Option<u64>,
}

impl Default for RawTraining {
    fn default() -> Self {
        Self {
            block_size: 128,
            batch_size: 2,
            epochs: 3,
            start_from: "served".into(),
            seed: None,
        }
    }
}

#[derive(Deserialize)]
#[serde(default)]
struct RawRetrain {
    period_secs: u64,
    window_secs: u64,
    epochs: usize,
    timeout_secs: u64,
}

impl Default for RawRetrain {
    fn default() -> Self {
        Self {
            period_secs: WEEK_SECS,
            window_secs: WEEK_SECS,
            epochs: 1,
            timeout_secs: 6 * 3600,
        }
    }
}

#[derive(Deserialize)]
#[serde(default)]
struct RawInference {
    max_length: usize,
    no_repeat_ngram_size: usize,
    echo_prompt: bool,
}

impl Default for RawInference {
    fn default() -> Self {
        let params = ReplyParams::default();
        Self {
            max_length: params.max_length,
            no_repeat_ngram_size: params.no_repeat_ngram_size,
            echo_prompt: params.echo_prompt,
        }
    }
}

fn default_command_prefix() -> String {
    "!koe".to_string()
}

fn default_true() -> bool {
    true
}

// ── Loading ───────────────────────────────────────────────────────────────────

/// Load config from `path` (default `config/default.toml`), then apply
/// env-var overrides.
pub fn load(path: Option<&Path>) -> Result<Config, AppError> {
    let work_dir_override = env::var("KOE_WORK_DIR").ok();
    let log_level_override = env::var("KOE_LOG_LEVEL").ok();
    load_from(
        path.unwrap_or(Path::new(DEFAULT_CONFIG_PATH)),
        work_dir_override.as_deref(),
        log_level_override.as_deref(),
    )
}

/// Loader taking an explicit path and optional overrides.
/// Tests pass overrides directly instead of mutating env vars.
pub fn load_from(
    path: &Path,
    work_dir_override: Option<&str>,
    log_level_override: Option<&str>,
) -> Result<Config, AppError> {
    let raw = fs::read_to_string(path)
        .map_err(|e| AppError::Config(format!("cannot read {}: {e}", path.display())))?;
    let parsed: RawConfig = toml::from_str(&raw)
        .map_err(|e| AppError::Config(format!("parse error in {}: {e}", path.display())))?;

    let s = parsed.supervisor;
    let work_dir = expand_home(work_dir_override.unwrap_or(&s.work_dir));
    let log_level = log_level_override.unwrap_or(&s.log_level).to_string();
    let within = |p: &str| resolve(&work_dir, p);

    let start_from = parsed
        .training
        .start_from
        .parse::<StartFrom>()
        .map_err(|e| AppError::Config(format!("training.start_from: {e}")))?;

    let config = Config {
        bot_name: s.bot_name,
        log_level,
        log_file: s.log_file.as_deref().map(within),
        comms: CommsConfig {
            pty: PtyConfig { enabled: parsed.comms.pty.enabled },
        },
        bot: BotConfig {
            command_prefix: parsed.bot.command_prefix.trim().to_string(),
        },
        model: ModelConfig {
            base_dir: within(&parsed.model.base_dir),
            versions_dir: within(&parsed.model.versions_dir),
            keep_versions: parsed.model.keep_versions,
            ngram_order: parsed.model.ngram_order,
            learning_rate: parsed.model.learning_rate,
        },
        corpus: CorpusConfig {
            history_dir: within(&parsed.corpus.history_dir),
            data_dir: within(&parsed.corpus.data_dir),
            weekly_dir: within(&parsed.corpus.weekly_dir),
        },
        training: TrainingConfig {
            block_size: parsed.training.block_size,
            batch_size: parsed.training.batch_size,
            epochs: parsed.training.epochs,
            start_from,
            seed: parsed.training.seed,
        },
        retrain: RetrainConfig {
            period: Duration::from_secs(parsed.retrain.period_secs),
            window: Duration::from_secs(parsed.retrain.window_secs),
            epochs: parsed.retrain.epochs,
            timeout: (parsed.retrain.timeout_secs > 0)
                .then(|| Duration::from_secs(parsed.retrain.timeout_secs)),
        },
        inference: ReplyParams {
            max_length: parsed.inference.max_length,
            no_repeat_ngram_size: parsed.inference.no_repeat_ngram_size,
            echo_prompt: parsed.inference.echo_prompt,
        },
        work_dir,
    };
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<(), AppError> {
    let checks: [(bool, &str); 10] = [
        (config.training.block_size >= 2, "training.block_size must be at least 2"),
        (config.training.batch_size >= 1, "training.batch_size must be at least 1"),
        (config.training.epochs >= 1, "training.epochs must be at least 1"),
        (config.retrain.epochs >= 1, "retrain.epochs must be at least 1"),
        (!config.retrain.period.is_zero(), "retrain.period_secs must be greater than 0"),
        (!config.retrain.window.is_zero(), "retrain.window_secs must be greater than 0"),
        (config.model.keep_versions >= 1, "model.keep_versions must be at least 1"),
        (config.model.ngram_order >= 1, "model.ngram_order must be at least 1"),
        (!config.bot.command_prefix.is_empty(), "bot.command_prefix must not be empty"),
        (config.inference.max_length >= 1, "inference.max_length must be at least 1"),
    ];
    match checks.iter().find(|(ok, _)| !ok) {
        Some((_, msg)) => Err(AppError::Config((*msg).to_string())),
        None => Ok(()),
    }
}

/// Expand `~`, then anchor relative paths at `work_dir`.
fn resolve(work_dir: &Path, path: &str) -> PathBuf {
    let path = expand_home(path);
    if path.is_absolute() { path } else { work_dir.join(path) }
}

/// Expand a leading `~` to the user's home directory.
/// Absolute or relative paths without `~` are returned unchanged.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}

// ── test helpers ──────────────────────────────────────────────────────────────

/// Small, fast `Config` for tests rooted at `work_dir`.
#[cfg(test)]
impl Config {
    pub fn test_default(work_dir: &Path) -> Self {
        Self {
            bot_name: "test".into(),
            work_dir: work_dir.to_path_buf(),
            log_level: "info".into(),
            log_file: None,
            comms: CommsConfig { pty: PtyConfig { enabled: false } },
            bot: BotConfig { command_prefix: default_command_prefix() },
            model: ModelConfig {
                base_dir: work_dir.join("models/base"),
                versions_dir: work_dir.join("models/fine_tuned"),
                keep_versions: 3,
                ngram_order: 4,
                learning_rate: 1.0,
            },
            corpus: CorpusConfig {
                history_dir: work_dir.join("history"),
                data_dir: work_dir.join("data"),
                weekly_dir: work_dir.join("data/weekly"),
            },
            training: TrainingConfig {
                block_size: 16,
                batch_size: 2,
                epochs: 1,
                start_from: StartFrom::Served,
                seed: Some(1),
            },
            retrain: RetrainConfig {
                period: Duration::from_secs(3600),
                window: Duration::from_secs(WEEK_SECS),
                epochs: 1,
                timeout: Some(Duration::from_secs(60)),
            },
            inference: ReplyParams::default(),
        }
    }
}
