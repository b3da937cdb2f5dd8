use std::collections::HashSet;

use crate::message::{ChatMessage, MessageKey};

#[derive(Debug, Clone)]
struct Entry {
    message: ChatMessage,
    arrival: u64,
}

/// Ordered, duplicate-free list of messages shown in the chat panel.
///
/// Every mutation goes through [`MessageLog::merge`]: rows are unioned by key and
/// kept sorted by timestamp, with arrival order breaking ties.
#[derive(Debug, Clone, Default)]
pub struct MessageLog {
    entries: Vec<Entry>,
    next_arrival: u64,
}

impl MessageLog {
    pub fn with_welcome(content: impl Into<String>) -> Self {
        let mut log = Self::default();
        log.merge([ChatMessage::welcome(content)]);
        log
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn latest_key(&self) -> Option<MessageKey> {
        self.entries.last().map(|entry| entry.message.key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChatMessage> {
        self.entries.iter().map(|entry| &entry.message)
    }

    pub fn snapshot(&self) -> Vec<ChatMessage> {
        self.iter().cloned().collect()
    }

    /// Unions `incoming` into the log. Returns whether anything was added.
    pub fn merge(&mut self, incoming: impl IntoIterator<Item = ChatMessage>) -> bool {
        let mut known = self
            .entries
            .iter()
            .map(|entry| entry.message.key)
            .collect::<HashSet<_>>();
        let mut added = false;

        for message in incoming {
            if !known.insert(message.key) {
                continue;
            }

            self.entries.push(Entry {
                message,
                arrival: self.next_arrival,
            });
            self.next_arrival += 1;
            added = true;
        }

        if added {
            self.entries.sort_by(|left, right| {
                left.message
                    .timestamp
                    .cmp(&right.message.timestamp)
                    .then_with(|| left.arrival.cmp(&right.arrival))
            });
        }

        added
    }

    /// Swaps local placeholders for fetched history.
    ///
    /// Durable rows already in the log (delivered live while the fetch was in
    /// flight) are kept; history rows take precedence in arrival order.
    pub fn replace_with_history(&mut self, history: impl IntoIterator<Item = ChatMessage>) {
        let live_rows = self
            .entries
            .drain(..)
            .filter(|entry| entry.message.key.is_durable())
            .map(|entry| entry.message)
            .collect::<Vec<_>>();

        self.merge(history);
        self.merge(live_rows);
    }

    pub fn reset_to_welcome(&mut self, content: impl Into<String>) {
        self.entries.clear();
        self.merge([ChatMessage::welcome(content)]);
    }
}
