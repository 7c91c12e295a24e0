use std::sync::{Arc, Mutex};

use murmur_llm::PullProgress;
use murmur_storage::{SessionId, SessionRecord};
use tokio::sync::oneshot;

use super::message::{Message, MessageKey, MessageStatus};

/// Notifications for the display surface, delivered in order over an unbounded channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplayEvent {
    MessageAppended(Message),
    /// `text` is the content as it should be shown, including the streaming
    /// marker while the message is still streaming.
    MessageUpdated {
        key: MessageKey,
        text: String,
        status: MessageStatus,
    },
    /// The whole visible history was replaced (session switch or reset).
    MessagesReplaced {
        session_id: Option<SessionId>,
        messages: Vec<Message>,
    },
    SessionsRefreshed(Vec<SessionRecord>),
    PullProgress {
        model_id: String,
        progress: PullProgress,
    },
    Notice(String),
}

impl DisplayEvent {
    pub fn updated(message: &Message) -> Self {
        Self::MessageUpdated {
            key: message.key,
            text: message.display_text(),
            status: message.status.clone(),
        }
    }
}

/// Cloneable handle that cancels the in-flight turn, if any.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    slot: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl StopHandle {
    /// Returns true when a running turn received the stop signal.
    pub fn stop(&self) -> bool {
        let sender = match self.slot.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        sender.is_some_and(|sender| sender.send(()).is_ok())
    }

    pub(crate) fn arm(&self) -> oneshot::Receiver<()> {
        let (stop_tx, stop_rx) = oneshot::channel();
        self.replace(Some(stop_tx));
        stop_rx
    }

    pub(crate) fn disarm(&self) {
        self.replace(None);
    }

    fn replace(&self, value: Option<oneshot::Sender<()>>) {
        match self.slot.lock() {
            Ok(mut slot) => *slot = value,
            Err(poisoned) => *poisoned.into_inner() = value,
        }
    }
}
