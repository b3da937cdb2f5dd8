use tokio::sync::broadcast::{self, error::RecvError};

use super::ids::UserId;
use super::types::MessageRecord;

pub const DEFAULT_FEED_CAPACITY: usize = 256;

/// Fan-out of committed inserts to every live subscription.
///
/// Rows are published after the write commits. Visibility is applied per
/// subscription, so a subscriber only ever observes rows owned by its user.
#[derive(Debug, Clone)]
pub struct InsertFeed {
    sender: broadcast::Sender<MessageRecord>,
}

impl InsertFeed {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, record: MessageRecord) {
        // No receivers simply means nobody is listening right now.
        let receivers = self.sender.send(record).unwrap_or(0);
        tracing::trace!(receivers, "published chat insert");
    }

    pub fn subscribe(&self, user_id: UserId) -> InsertSubscription {
        InsertSubscription {
            user_id,
            source: Some(self.sender.subscribe()),
        }
    }
}

impl Default for InsertFeed {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_CAPACITY)
    }
}

/// Owned handle on a live insert feed scoped to one user.
///
/// Dropping the handle cancels it.
#[derive(Debug)]
pub struct InsertSubscription {
    user_id: UserId,
    source: Option<broadcast::Receiver<MessageRecord>>,
}

impl InsertSubscription {
    pub fn is_active(&self) -> bool {
        self.source.is_some()
    }

    /// Waits for the next insert visible to this subscription.
    ///
    /// Returns `None` once the subscription is cancelled or the feed is gone.
    pub async fn recv(&mut self) -> Option<MessageRecord> {
        loop {
            let received = match self.source.as_mut() {
                Some(source) => source.recv().await,
                None => return None,
            };

            match received {
                Ok(record) if record.user_id == self.user_id => return Some(record),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        user_id = %self.user_id,
                        skipped,
                        "insert subscription lagged behind the feed"
                    );
                }
                Err(RecvError::Closed) => {
                    self.source = None;
                    return None;
                }
            }
        }
    }

    /// Stops delivery. Returns `true` only for the call that actually cancelled.
    pub fn cancel(&mut self) -> bool {
        let cancelled = self.source.take().is_some();
        if cancelled {
            tracing::debug!(user_id = %self.user_id, "insert subscription cancelled");
        }
        cancelled
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::ids::MessageId;
    use crate::types::MessageRole;

    fn record(user_id: UserId, content: &str) -> MessageRecord {
        MessageRecord {
            id: MessageId::new_v7(),
            user_id,
            role: MessageRole::User,
            content: content.to_string(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn subscription_only_sees_rows_of_its_user() {
        let feed = InsertFeed::default();
        let ada = UserId::from_email("ada@example.com");
        let grace = UserId::from_email("grace@example.com");
        let mut subscription = feed.subscribe(ada);

        feed.publish(record(grace, "not yours"));
        feed.publish(record(ada, "yours"));

        let delivered = subscription.recv().await.unwrap();
        assert_eq!(delivered.content, "yours");
        assert_eq!(delivered.user_id, ada);
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_stops_delivery() {
        let feed = InsertFeed::default();
        let ada = UserId::from_email("ada@example.com");
        let mut subscription = feed.subscribe(ada);

        assert!(subscription.cancel());
        assert!(!subscription.cancel());
        assert!(!subscription.is_active());

        feed.publish(record(ada, "after cancel"));
        assert!(subscription.recv().await.is_none());
    }
}
