//! Lifecycle tracking for locally originated sends and updates.
//!
//! The [`PendingTracker`] owns one [`PendingRecord`] per message with an
//! operation that is in flight or has failed. It never touches the message
//! store; the stream facade applies the matching store changes.
//!
//! Operations on the same message form a chain serialized by an async
//! mutex, so an update issued while the original send is still pending
//! waits for the send to resolve and then targets the server identity
//! recorded in the alias table.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex as ChainLock;

use chatline_proto::message::{MessageDraft, MessageId, MessageKey, Payload, RequestId};

/// The network operation behind a pending record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Send of a new message shown under a temporary identifier.
    Send {
        /// Temporary identifier of the optimistic message.
        request_id: RequestId,
        /// What is being sent.
        draft: MessageDraft,
    },
    /// Edit of a server-confirmed message.
    Update {
        /// Message being edited.
        target: MessageId,
        /// New content.
        payload: Payload,
        /// Content before the edit, restored on failure.
        previous: Payload,
    },
}

/// Where a tracked operation is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationState {
    /// Issued, awaiting the server.
    Pending,
    /// Rejected or unreachable; eligible for resend.
    Failed(String),
}

/// A tracked operation and its state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRecord {
    /// The operation to (re)issue.
    pub operation: Operation,
    /// Current lifecycle state.
    pub state: OperationState,
}

/// Why a resend was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResendRefusal {
    /// No operation is tracked for the key.
    Unknown,
    /// The operation is still pending.
    NotFailed,
}

/// Tracks pending and failed operations for one stream epoch.
#[derive(Debug, Default)]
pub struct PendingTracker {
    records: HashMap<MessageKey, PendingRecord>,
    aliases: HashMap<RequestId, MessageId>,
    chains: HashMap<MessageKey, Arc<ChainLock<()>>>,
}

impl PendingTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The chain lock serializing operations on `key`.
    pub fn chain(&mut self, key: &MessageKey) -> Arc<ChainLock<()>> {
        self.prune_idle_chains();
        Arc::clone(self.chains.entry(key.clone()).or_default())
    }

    /// Drop chain locks nobody holds or waits on and no record needs.
    fn prune_idle_chains(&mut self) {
        let records = &self.records;
        self.chains
            .retain(|key, chain| Arc::strong_count(chain) > 1 || records.contains_key(key));
    }

    /// Start tracking a send shown under `request_id`.
    pub fn begin_send(&mut self, request_id: RequestId, draft: MessageDraft) {
        self.records.insert(
            MessageKey::Local(request_id),
            PendingRecord {
                operation: Operation::Send { request_id, draft },
                state: OperationState::Pending,
            },
        );
    }

    /// Record the server identity of a completed send and stop tracking it.
    ///
    /// The temporary identifier stays resolvable through [`resolve`](Self::resolve).
    pub fn complete_send(&mut self, request_id: RequestId, server_id: MessageId) {
        self.records.remove(&MessageKey::Local(request_id));
        self.aliases.insert(request_id, server_id);
        self.prune_idle_chains();
    }

    /// Start tracking an edit of `target`, replacing any failed edit.
    pub fn begin_update(&mut self, target: MessageId, payload: Payload, previous: Payload) {
        self.records.insert(
            MessageKey::Server(target.clone()),
            PendingRecord {
                operation: Operation::Update {
                    target,
                    payload,
                    previous,
                },
                state: OperationState::Pending,
            },
        );
    }

    /// Stop tracking a successful operation on `key`.
    pub fn complete(&mut self, key: &MessageKey) {
        self.records.remove(key);
        self.prune_idle_chains();
    }

    /// Mark the operation on `key` failed. Returns `false` if untracked.
    pub fn fail(&mut self, key: &MessageKey, reason: impl Into<String>) -> bool {
        match self.records.get_mut(key) {
            Some(record) => {
                record.state = OperationState::Failed(reason.into());
                true
            }
            None => false,
        }
    }

    /// Move a failed operation back to pending and return it for reissue.
    ///
    /// # Errors
    ///
    /// Returns [`ResendRefusal`] if nothing is tracked for `key` or the
    /// operation has not failed.
    pub fn begin_resend(&mut self, key: &MessageKey) -> Result<Operation, ResendRefusal> {
        let record = self.records.get_mut(key).ok_or(ResendRefusal::Unknown)?;
        if record.state == OperationState::Pending {
            return Err(ResendRefusal::NotFailed);
        }
        record.state = OperationState::Pending;
        Ok(record.operation.clone())
    }

    /// Stop tracking `key` entirely (used when the message is deleted).
    pub fn forget(&mut self, key: &MessageKey) -> Option<PendingRecord> {
        self.chains.remove(key);
        self.records.remove(key)
    }

    /// The tracked record for `key`.
    #[must_use]
    pub fn record(&self, key: &MessageKey) -> Option<&PendingRecord> {
        self.records.get(key)
    }

    /// The current state for `key`, if tracked.
    #[must_use]
    pub fn state(&self, key: &MessageKey) -> Option<&OperationState> {
        self.records.get(key).map(|record| &record.state)
    }

    /// Resolve a key to its server identity, following send aliases.
    #[must_use]
    pub fn resolve(&self, key: &MessageKey) -> Option<MessageId> {
        match key {
            MessageKey::Server(id) => Some(id.clone()),
            MessageKey::Local(request_id) => self.aliases.get(request_id).cloned(),
        }
    }

    /// Number of tracked (pending or failed) operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns `true` if nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of chain locks currently kept.
    #[must_use]
    pub fn chain_count(&self) -> usize {
        self.chains.len()
    }
}
