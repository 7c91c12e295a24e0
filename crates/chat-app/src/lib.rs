//! Conversation core of murmur: the controller that turns user input into
//! streamed, persisted chat turns, plus settings and logging bootstrap.

pub mod app;
pub mod config;
pub mod conversation;
pub mod error;
pub mod telemetry;

pub use app::open_controller;
pub use config::{AppSettings, ModelParameters, ModelsSettings, SettingsError, SettingsStore};
pub use conversation::{
    ConversationController, DisplayEvent, Message, MessageStatus, PullOutcome, StopHandle,
    TurnOutcome,
};
pub use error::{ConversationError, ConversationResult, ErrorKind, StartupError};
