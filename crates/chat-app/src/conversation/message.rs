use murmur_llm::{Role, StreamTarget, TurnId};
use murmur_storage::{MessageRecord, MessageRole};

/// Cursor appended to assistant text while tokens are still arriving.
pub const STREAMING_MARKER: char = '▌';

/// In-memory identity of one displayed message. Distinct from the storage id,
/// which only exists once the turn is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageKey(pub u64);

impl MessageKey {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// Lifecycle status for one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageStatus {
    Streaming(TurnId),
    Done,
    Error(String),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub key: MessageKey,
    pub role: Role,
    pub content: String,
    pub status: MessageStatus,
}

impl Message {
    pub fn new(
        key: MessageKey,
        role: Role,
        content: impl Into<String>,
        status: MessageStatus,
    ) -> Self {
        Self {
            key,
            role,
            content: content.into(),
            status,
        }
    }

    pub fn user(key: MessageKey, content: impl Into<String>) -> Self {
        Self::new(key, Role::User, content, MessageStatus::Done)
    }

    /// Empty assistant placeholder filled in as tokens arrive.
    pub fn assistant_streaming(key: MessageKey, turn_id: TurnId) -> Self {
        Self::new(
            key,
            Role::Assistant,
            String::new(),
            MessageStatus::Streaming(turn_id),
        )
    }

    pub fn from_record(key: MessageKey, record: MessageRecord) -> Self {
        let role = match record.role {
            MessageRole::User => Role::User,
            MessageRole::Assistant => Role::Assistant,
        };
        Self::new(key, role, record.content, MessageStatus::Done)
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.status, MessageStatus::Streaming(_))
    }

    /// Text as shown on the display surface: the streaming marker is appended
    /// only while the message is still streaming.
    pub fn display_text(&self) -> String {
        if self.is_streaming() {
            let mut text = String::with_capacity(self.content.len() + STREAMING_MARKER.len_utf8());
            text.push_str(&self.content);
            text.push(STREAMING_MARKER);
            text
        } else {
            self.content.clone()
        }
    }
}

/// Stream lifecycle for the active conversation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StreamState {
    #[default]
    Idle,
    Streaming(StreamTarget),
    Done(StreamTarget),
    Error {
        target: StreamTarget,
        message: String,
    },
    Cancelled(StreamTarget),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTransition {
    Start(StreamTarget),
    Complete(StreamTarget),
    Fail {
        target: StreamTarget,
        message: String,
    },
    Cancel(StreamTarget),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTransitionRejection {
    AlreadyStreaming {
        active: StreamTarget,
        attempted: StreamTarget,
    },
    NoActiveStream,
    TargetMismatch {
        active: StreamTarget,
        attempted: StreamTarget,
    },
}

pub type StreamTransitionResult = Result<StreamState, StreamTransitionRejection>;

impl StreamState {
    /// Returns true when incoming stream data matches the active turn.
    pub fn accepts_stream_event(&self, target: StreamTarget) -> bool {
        matches!(self, Self::Streaming(active) if *active == target)
    }

    /// Applies one transition.
    ///
    /// Non-streaming states may start a new turn directly. Terminal transitions
    /// (`Complete`/`Fail`/`Cancel`) must match the active target exactly.
    pub fn apply(&self, transition: StreamTransition) -> StreamTransitionResult {
        match transition {
            StreamTransition::Start(target) => self.apply_start(target),
            StreamTransition::Complete(target) => {
                self.apply_terminal(target, || Self::Done(target))
            }
            StreamTransition::Fail { target, message } => {
                self.apply_terminal(target, || Self::Error { target, message })
            }
            StreamTransition::Cancel(target) => {
                self.apply_terminal(target, || Self::Cancelled(target))
            }
        }
    }

    fn apply_start(&self, target: StreamTarget) -> StreamTransitionResult {
        match self {
            Self::Streaming(active) if *active != target => {
                Err(StreamTransitionRejection::AlreadyStreaming {
                    active: *active,
                    attempted: target,
                })
            }
            Self::Streaming(_) => Ok(self.clone()),
            Self::Idle | Self::Done(_) | Self::Error { .. } | Self::Cancelled(_) => {
                Ok(Self::Streaming(target))
            }
        }
    }

    fn apply_terminal(
        &self,
        target: StreamTarget,
        next: impl FnOnce() -> Self,
    ) -> StreamTransitionResult {
        match self {
            Self::Streaming(active) if *active == target => Ok(next()),
            Self::Streaming(active) => Err(StreamTransitionRejection::TargetMismatch {
                active: *active,
                attempted: target,
            }),
            Self::Idle | Self::Done(_) | Self::Error { .. } | Self::Cancelled(_) => {
                Err(StreamTransitionRejection::NoActiveStream)
            }
        }
    }
}
