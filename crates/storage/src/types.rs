use chrono::NaiveDateTime;

use super::ids::{MessageId, SessionId, SystemPromptId};

/// Title used when a session is created without a usable first message.
pub const DEFAULT_SESSION_TITLE: &str = "New Conversation";

/// Persisted message role. System prompts live in their own table, so only the
/// two conversational roles are stored per message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub id: SessionId,
    pub title: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSession {
    pub title: String,
}

impl NewSession {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: MessageId,
    pub session_id: SessionId,
    pub role: MessageRole,
    pub content: String,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub role: MessageRole,
    pub content: String,
}

impl NewMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// Session a turn is written into: an already persisted one, or one that is
/// created inside the same transaction as the turn's messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnSession {
    Existing(SessionId),
    Create(NewSession),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnCommit {
    pub session: SessionRecord,
    pub created_session: bool,
    pub messages: Vec<MessageRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemPromptRecord {
    pub id: SystemPromptId,
    pub name: String,
    pub content: String,
    pub is_active: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSystemPrompt {
    pub name: String,
    pub content: String,
}

/// Prompts seeded into an empty `SystemPrompts` table; the first one starts active.
pub const DEFAULT_SYSTEM_PROMPTS: [(&str, &str); 4] = [
    (
        "Default Assistant",
        "You are a helpful AI assistant who answers all kinds of questions and offers useful suggestions.",
    ),
    (
        "Programming Assistant",
        "You are a professional programming assistant, fluent in many languages, who helps users solve programming problems, improve code, and explain technical concepts.",
    ),
    (
        "Creative Writing Assistant",
        "You are a creative writing assistant who helps users write stories, poems, articles, and other kinds of text.",
    ),
    (
        "Research Assistant",
        "You are an academic research assistant who helps users find literature, analyse research questions, and give scholarly advice.",
    ),
];
