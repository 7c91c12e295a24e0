/// In-memory conversation generation. A controller mints a new one whenever it
/// resets or switches sessions, so events from an abandoned stream can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConversationId(pub u64);

impl ConversationId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// Identifier for one submit/response cycle.
///
/// This must change on every submit so stale chunks can be rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TurnId(pub u64);

impl TurnId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// Stream routing key used for stale-chunk rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamTarget {
    pub conversation_id: ConversationId,
    pub turn_id: TurnId,
}

impl StreamTarget {
    pub const fn new(conversation_id: ConversationId, turn_id: TurnId) -> Self {
        Self {
            conversation_id,
            turn_id,
        }
    }
}

/// Speaker role as understood by the model service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Provider-agnostic stream frame: a token, the done signal, or a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEventPayload {
    Delta(String),
    Done,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEventMapped {
    pub target: StreamTarget,
    pub payload: StreamEventPayload,
}

impl StreamEventMapped {
    pub fn delta(target: StreamTarget, token: impl Into<String>) -> Self {
        Self {
            target,
            payload: StreamEventPayload::Delta(token.into()),
        }
    }

    pub fn done(target: StreamTarget) -> Self {
        Self {
            target,
            payload: StreamEventPayload::Done,
        }
    }

    pub fn error(target: StreamTarget, message: impl Into<String>) -> Self {
        Self {
            target,
            payload: StreamEventPayload::Error(message.into()),
        }
    }
}
