//! Client-side view of the chat backend: the durable message log, its realtime
//! insert feed, and the identity provider that gates access to both.

use std::future::Future;
use std::pin::Pin;

pub mod auth;
pub mod error;
pub mod feed;
pub mod ids;
pub mod sqlite;
pub mod types;

pub use auth::{
    AuthError, AuthResult, AuthenticatedUser, Identity, IdentityProvider, IdentityWatch,
    LocalSessionProvider,
};
pub use error::{StorageError, StorageResult};
pub use feed::{InsertFeed, InsertSubscription};
pub use ids::{MessageId, UserId};
pub use sqlite::SqliteStorage;
pub use types::{MessageRecord, MessageRole, NewMessage};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Append-only chat log with row-level visibility by owner.
pub trait MessageStore: Send + Sync {
    /// Every row owned by `user_id`, oldest first.
    fn fetch_messages<'a>(&'a self, user_id: UserId)
    -> BoxFuture<'a, StorageResult<Vec<MessageRecord>>>;

    /// Durably appends one row and returns it with its server-assigned id and time.
    fn insert_message<'a>(
        &'a self,
        user_id: UserId,
        input: NewMessage,
    ) -> BoxFuture<'a, StorageResult<MessageRecord>>;

    /// Live feed of rows inserted for `user_id` from now on.
    fn subscribe_inserts(&self, user_id: UserId) -> InsertSubscription;
}
