//! Conversation state for the fashion stylist chat.

pub mod controller;
pub mod engine;
pub mod error;
pub mod events;
pub mod log;
pub mod message;
pub mod plan;

pub use controller::{ConversationSyncController, DEFAULT_STORE_TIMEOUT, SyncConfig};
pub use engine::RecommendationEngine;
pub use error::{SyncError, SyncResult};
pub use events::{ControllerCommand, ControllerEvent, SubmitOutcome};
pub use log::MessageLog;
pub use message::{ChatMessage, MessageKey, WELCOME_MESSAGE};
pub use plan::{PlanResult, PlanSubject};
