//! Application-wide error types.

use thiserror::Error;

use crate::corpus::CorpusError;
use crate::orchestrator::OrchestratorError;
use crate::registry::RegistryError;
use crate::training::FineTuneError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(String),

    #[error("logger error: {0}")]
    Logger(String),

    #[error("comms error: {0}")]
    Comms(String),

    #[error("background task failed: {0}")]
    Task(String),

    #[error("usage: {0}")]
    Usage(String),

    #[error("corpus error: {0}")]
    Corpus(#[from] CorpusError),

    #[error("model registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("training error: {0}")]
    Training(#[from] FineTuneError),

    #[error("orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
