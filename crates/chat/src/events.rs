use adhikari_backend::{Identity, MessageId};

use crate::message::{ChatMessage, MessageKey};
use crate::plan::PlanResult;

/// Notifications from the controller to whatever renders the chat panel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerEvent {
    /// The visible list changed; `latest` is the row the view should scroll to.
    MessagesChanged {
        messages: Vec<ChatMessage>,
        latest: Option<MessageKey>,
    },
    IdentityChanged(Identity),
    /// A submission needs a signed-in user.
    AuthRequired,
    AuthPromptChanged(bool),
    BusyChanged(bool),
    SubmitFailed {
        reason: String,
    },
}

/// Inputs accepted by [`crate::ConversationSyncController::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerCommand {
    SetInput(String),
    Submit(String),
    PlanResult(PlanResult),
    DismissAuthPrompt,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Blank input or a plan request already in flight.
    Ignored,
    AuthRequired,
    Forwarded { message_id: MessageId },
    PersistFailed,
    /// The provider reports a different user than the controller has loaded.
    IdentityChanged,
}
