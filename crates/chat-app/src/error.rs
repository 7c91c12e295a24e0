use murmur_llm::ProviderError;
use murmur_storage::{SessionId, StorageError};
use snafu::Snafu;

use crate::config::SettingsError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Storage,
    Streaming,
    Validation,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConversationError {
    #[snafu(display("`{stage}` is unavailable until the running operation finishes"))]
    Busy { stage: &'static str },
    #[snafu(display("session {session_id} does not exist"))]
    SessionNotFound {
        stage: &'static str,
        session_id: SessionId,
    },
    #[snafu(display("model id must not be empty"))]
    InvalidModel { stage: &'static str },
    #[snafu(display("storage failed on `{stage}`: {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("model service failed on `{stage}`: {source}"))]
    Provider {
        stage: &'static str,
        source: ProviderError,
    },
    #[snafu(display("pulling model '{model_id}' failed: {message}"))]
    ModelPull {
        stage: &'static str,
        model_id: String,
        message: String,
    },
}

impl ConversationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Busy { .. } | Self::SessionNotFound { .. } | Self::InvalidModel { .. } => {
                ErrorKind::Validation
            }
            Self::Storage { .. } => ErrorKind::Storage,
            Self::Provider { .. } | Self::ModelPull { .. } => ErrorKind::Streaming,
        }
    }

    pub fn stage(&self) -> &'static str {
        match self {
            Self::Busy { stage }
            | Self::SessionNotFound { stage, .. }
            | Self::InvalidModel { stage }
            | Self::Storage { stage, .. }
            | Self::Provider { stage, .. }
            | Self::ModelPull { stage, .. } => stage,
        }
    }
}

pub type ConversationResult<T> = Result<T, ConversationError>;

/// Failures while wiring the application together at startup.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StartupError {
    #[snafu(display("database path {path:?} is not valid UTF-8"))]
    DatabasePath {
        stage: &'static str,
        path: std::path::PathBuf,
    },
    #[snafu(display("failed to open chat history on `{stage}`: {source}"))]
    OpenStorage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("failed to create model provider on `{stage}`: {source}"))]
    CreateProvider {
        stage: &'static str,
        source: ProviderError,
    },
    #[snafu(display("failed to save settings on `{stage}`: {source}"))]
    SaveSettings {
        stage: &'static str,
        source: SettingsError,
    },
}
