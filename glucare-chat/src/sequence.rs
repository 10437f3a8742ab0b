//! Ordered, id-unique message sequence owned by one conversation view.

use std::collections::HashSet;

use shared::models::Message;
use uuid::Uuid;

/// Result of merging one message into a [`MessageSequence`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Inserted at the given position.
    Inserted(usize),
    /// A message with the same id is already present; nothing changed.
    Duplicate,
}

/// Messages ordered by `(created_at, id)` with no repeated ids.
///
/// History seeds the sequence; live deliveries and confirmed sends are merged
/// afterwards. Merging is idempotent, so an echo of a message that is already
/// present never changes the sequence.
#[derive(Debug, Clone, Default)]
pub struct MessageSequence {
    messages: Vec<Message>,
    ids: HashSet<Uuid>,
}

impl MessageSequence {
    /// Empty sequence.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence seeded with `history`, tolerating unsorted or repeated input.
    #[must_use]
    pub fn from_history(history: Vec<Message>) -> Self {
        let mut sequence = Self::new();
        sequence.extend(history);
        sequence
    }

    /// Inserts `message` at its ordered position unless its id is present.
    pub fn merge(&mut self, message: Message) -> MergeOutcome {
        if !self.ids.insert(message.id) {
            return MergeOutcome::Duplicate;
        }

        let key = message.ordering_key();
        let position = self
            .messages
            .partition_point(|existing| existing.ordering_key() <= key);
        self.messages.insert(position, message);
        MergeOutcome::Inserted(position)
    }

    /// Merges every message and returns how many were new.
    pub fn extend(&mut self, messages: impl IntoIterator<Item = Message>) -> usize {
        let mut inserted = 0;
        for message in messages {
            if let MergeOutcome::Inserted(_) = self.merge(message) {
                inserted += 1;
            }
        }
        inserted
    }

    /// Whether a message with `id` is present.
    #[must_use]
    pub fn contains(&self, id: Uuid) -> bool {
        self.ids.contains(&id)
    }

    /// Number of messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the sequence is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Messages in order.
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Most recent message.
    #[must_use]
    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Removes every message.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.ids.clear();
    }
}
