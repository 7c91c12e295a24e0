pub mod controller;
pub mod events;
pub mod message;
pub mod title;

pub use controller::{ConversationController, PullOutcome, TurnOutcome};
pub use events::{DisplayEvent, StopHandle};
pub use message::{
    Message, MessageKey, MessageStatus, STREAMING_MARKER, StreamState, StreamTransition,
    StreamTransitionRejection,
};
pub use title::synthesize_title;
