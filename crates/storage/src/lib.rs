pub mod error;
pub mod ids;
pub mod sqlite;
pub mod timestamp;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use ids::{MessageId, SessionId, SystemPromptId};
pub use sqlite::SqliteStorage;
pub use types::{
    DEFAULT_SESSION_TITLE, DEFAULT_SYSTEM_PROMPTS, MessageRecord, MessageRole, NewMessage,
    NewSession, NewSystemPrompt, SessionRecord, SystemPromptRecord, TurnCommit, TurnSession,
};

pub trait SessionStore: Send + Sync {
    fn create_session(&self, input: NewSession) -> StorageResult<SessionRecord>;
    /// Most recently updated first.
    fn list_sessions(&self) -> StorageResult<Vec<SessionRecord>>;
    fn get_session(&self, session_id: SessionId) -> StorageResult<Option<SessionRecord>>;
    /// Removes the session and every message in it. Callers own invalidating any
    /// in-memory reference to the deleted session.
    fn delete_session(&self, session_id: SessionId) -> StorageResult<()>;
}

pub trait MessageStore: Send + Sync {
    /// Inserts one message and bumps the owning session's `UpdatedAt` in the same
    /// transaction.
    fn append_message(
        &self,
        session_id: SessionId,
        input: NewMessage,
    ) -> StorageResult<MessageRecord>;
    /// Messages in creation order; empty when the session does not exist.
    fn list_messages(&self, session_id: SessionId) -> StorageResult<Vec<MessageRecord>>;
    /// Ensures the session exists and appends `messages` atomically.
    fn commit_turn(
        &self,
        session: TurnSession,
        messages: Vec<NewMessage>,
    ) -> StorageResult<TurnCommit>;
}

pub trait SystemPromptStore: Send + Sync {
    fn list_system_prompts(&self) -> StorageResult<Vec<SystemPromptRecord>>;
    fn add_system_prompt(&self, input: NewSystemPrompt) -> StorageResult<SystemPromptRecord>;
    fn active_system_prompt(&self) -> StorageResult<Option<SystemPromptRecord>>;
    fn set_active_system_prompt(&self, prompt_id: SystemPromptId) -> StorageResult<()>;
}

pub trait Storage: SessionStore + MessageStore + SystemPromptStore {}

impl<T> Storage for T where T: SessionStore + MessageStore + SystemPromptStore {}
