//! Ordered, identifier-unique message collection.
//!
//! [`MessageStore`] keeps messages sorted by a caller-supplied comparator,
//! with the [`MessageKey`] as the final tie-break so the order is total.
//! Inserting a key that already exists replaces the stored element instead
//! of appending a duplicate.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use chatline_proto::message::{Message, MessageKey};

/// Comparator used to order messages; ties are broken by key afterwards.
pub type SortComparator = Arc<dyn Fn(&Message, &Message) -> Ordering + Send + Sync>;

/// Ascending ordering key (creation time, then key).
#[must_use]
pub fn default_comparator() -> SortComparator {
    Arc::new(Message::cmp_ordering_key)
}

/// Result of a single [`MessageStore::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// The key was not present before.
    Inserted,
    /// The key was present and the stored message changed.
    Replaced,
    /// The key was present with identical content.
    Unchanged,
}

/// Summary of a [`MessageStore::upsert_batch`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Keys that were new to the collection, in batch order.
    pub inserted: Vec<MessageKey>,
    /// Keys that already existed and changed.
    pub replaced: Vec<MessageKey>,
    /// Number of entries that changed nothing.
    pub unchanged: usize,
}

impl BatchOutcome {
    /// Keys that changed the collection (inserted, then replaced).
    pub fn changed(&self) -> impl Iterator<Item = &MessageKey> {
        self.inserted.iter().chain(self.replaced.iter())
    }

    /// Returns `true` if the batch left the collection untouched.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.inserted.is_empty() && self.replaced.is_empty()
    }
}

/// The authoritative ordered set of messages for one view.
pub struct MessageStore {
    messages: Vec<Message>,
    keys: HashSet<MessageKey>,
    comparator: SortComparator,
    snapshot: OnceLock<Arc<[Message]>>,
}

impl MessageStore {
    /// Create an empty store ordered by `comparator`.
    #[must_use]
    pub fn new(comparator: SortComparator) -> Self {
        Self {
            messages: Vec::new(),
            keys: HashSet::new(),
            comparator,
            snapshot: OnceLock::new(),
        }
    }

    fn compare(&self, a: &Message, b: &Message) -> Ordering {
        (self.comparator)(a, b).then_with(|| a.key.cmp(&b.key))
    }

    fn index_of(&self, key: &MessageKey) -> Option<usize> {
        if !self.keys.contains(key) {
            return None;
        }
        self.messages.iter().position(|m| m.key == *key)
    }

    fn insertion_point(&self, message: &Message) -> usize {
        self.messages
            .binary_search_by(|probe| self.compare(probe, message))
            .unwrap_or_else(|idx| idx)
    }

    fn fits_at(&self, idx: usize, message: &Message) -> bool {
        let after_prev = idx == 0 || self.compare(&self.messages[idx - 1], message).is_lt();
        let before_next = self
            .messages
            .get(idx + 1)
            .is_none_or(|next| self.compare(message, next).is_lt());
        after_prev && before_next
    }

    fn invalidate(&mut self) {
        self.snapshot = OnceLock::new();
    }

    /// Insert `message`, or replace the stored message with the same key.
    ///
    /// A replacement keeps its slot when its sort position is unchanged and
    /// moves otherwise.
    pub fn upsert(&mut self, message: Message) -> Upsert {
        if let Some(idx) = self.index_of(&message.key) {
            if self.messages[idx] == message {
                return Upsert::Unchanged;
            }
            if self.fits_at(idx, &message) {
                self.messages[idx] = message;
            } else {
                self.messages.remove(idx);
                let at = self.insertion_point(&message);
                self.messages.insert(at, message);
            }
            self.invalidate();
            return Upsert::Replaced;
        }

        let at = self.insertion_point(&message);
        self.keys.insert(message.key.clone());
        self.messages.insert(at, message);
        self.invalidate();
        Upsert::Inserted
    }

    /// Apply a batch of upserts in order; later duplicates win.
    ///
    /// A key inserted and then replaced within the same batch is reported
    /// as inserted.
    pub fn upsert_batch<I>(&mut self, messages: I) -> BatchOutcome
    where
        I: IntoIterator<Item = Message>,
    {
        let mut outcome = BatchOutcome::default();
        for message in messages {
            let key = message.key.clone();
            match self.upsert(message) {
                Upsert::Inserted => outcome.inserted.push(key),
                Upsert::Replaced => {
                    if !outcome.inserted.contains(&key) && !outcome.replaced.contains(&key) {
                        outcome.replaced.push(key);
                    }
                }
                Upsert::Unchanged => outcome.unchanged += 1,
            }
        }
        outcome
    }

    /// Apply `change` to the message stored under `key` and re-sort it.
    ///
    /// Returns `None` if the key is absent.
    pub fn modify<F>(&mut self, key: &MessageKey, change: F) -> Option<Upsert>
    where
        F: FnOnce(&mut Message),
    {
        let mut message = self.get(key)?.clone();
        change(&mut message);
        if message.key != *key {
            self.remove(key);
        }
        Some(self.upsert(message))
    }

    /// Remove the message stored under `key`; no-op if absent.
    pub fn remove(&mut self, key: &MessageKey) -> Option<Message> {
        let idx = self.index_of(key)?;
        self.keys.remove(key);
        let removed = self.messages.remove(idx);
        self.invalidate();
        Some(removed)
    }

    /// Drop every message.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.keys.clear();
        self.invalidate();
    }

    /// The message stored under `key`, if any.
    #[must_use]
    pub fn get(&self, key: &MessageKey) -> Option<&Message> {
        self.index_of(key).map(|idx| &self.messages[idx])
    }

    /// Returns `true` if a message with `key` is stored.
    #[must_use]
    pub fn contains(&self, key: &MessageKey) -> bool {
        self.keys.contains(key)
    }

    /// Number of stored messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Returns `true` if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Oldest message in sort order.
    #[must_use]
    pub fn first(&self) -> Option<&Message> {
        self.messages.first()
    }

    /// Newest message in sort order.
    #[must_use]
    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Immutable ordered snapshot, shared until the next mutation.
    #[must_use]
    pub fn to_ordered_sequence(&self) -> Arc<[Message]> {
        Arc::clone(
            self.snapshot
                .get_or_init(|| Arc::from(self.messages.as_slice())),
        )
    }
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new(default_comparator())
    }
}

impl std::fmt::Debug for MessageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageStore")
            .field("len", &self.messages.len())
            .finish_non_exhaustive()
    }
}
