//! In-process backend for tests and demos.
//!
//! [`InMemoryBackend`] keeps one channel's log sorted by ordering key,
//! assigns sequential server identifiers (`m1`, `m2`, ...) and timestamps
//! from a logical clock, and lets callers inject failures or hold calls
//! at a gate to reproduce interleavings deterministically.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::watch;

use chatline_proto::message::{
    ChannelId, Message, MessageDraft, MessageId, MessageKey, MessageStatus, Payload, RequestId,
    Timestamp, UserId,
};
use chatline_proto::page::{Direction, Page, Position};

use super::{BackendError, ChannelBackend};

/// The backend operations that can be paused, failed or counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendOp {
    /// [`ChannelBackend::fetch_page`].
    Fetch,
    /// [`ChannelBackend::send_message`].
    Send,
    /// [`ChannelBackend::update_message`].
    Update,
    /// [`ChannelBackend::delete_message`].
    Delete,
}

/// A single-channel message log held in memory.
pub struct InMemoryBackend {
    /// Channel this backend serves.
    channel_id: ChannelId,
    /// Author assigned to messages sent through [`ChannelBackend::send_message`].
    user: UserId,
    /// Messages sorted by ordering key.
    log: Mutex<Vec<Message>>,
    /// Next numeric suffix for server identifiers.
    next_id: AtomicU64,
    /// Logical clock in milliseconds.
    clock: AtomicU64,
    /// Injected failures, returned after the gate opens.
    faults: Mutex<HashMap<BackendOp, BackendError>>,
    /// Number of calls started per operation.
    calls: Mutex<HashMap<BackendOp, usize>>,
    /// Operations currently held at the gate.
    paused: watch::Sender<HashSet<BackendOp>>,
}

impl InMemoryBackend {
    /// Create an empty log for `channel_id`, sending as `user`.
    #[must_use]
    pub fn new(channel_id: ChannelId, user: UserId) -> Self {
        let (paused, _) = watch::channel(HashSet::new());
        Self {
            channel_id,
            user,
            log: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            clock: AtomicU64::new(1),
            faults: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            paused,
        }
    }

    fn next_message_id(&self) -> MessageId {
        MessageId::new(format!("m{}", self.next_id.fetch_add(1, Ordering::SeqCst)))
    }

    fn tick(&self) -> Timestamp {
        Timestamp::from_millis(self.clock.fetch_add(1, Ordering::SeqCst))
    }

    fn insert_sorted(&self, message: Message) {
        let mut log = self.log.lock();
        let at = log.partition_point(|m| m.cmp_ordering_key(&message).is_lt());
        log.insert(at, message);
    }

    fn build(&self, sender: UserId, payload: Payload, at: Timestamp) -> Message {
        Message {
            key: MessageKey::Server(self.next_message_id()),
            channel_id: self.channel_id.clone(),
            sender,
            payload,
            created_at: at,
            updated_at: at,
            status: MessageStatus::Succeeded,
            parent: None,
            request_id: None,
        }
    }

    /// Append a message created at `at` by `sender`, bypassing gates and faults.
    ///
    /// The logical clock is moved past `at` so later sends sort after it.
    pub fn seed(&self, sender: &UserId, payload: Payload, at: Timestamp) -> Message {
        let message = self.build(sender.clone(), payload, at);
        self.clock
            .fetch_max(at.as_millis().saturating_add(1), Ordering::SeqCst);
        self.insert_sorted(message.clone());
        message
    }

    /// Append a message from `sender` at the current logical time.
    ///
    /// Use this to simulate another participant posting; feed the result to
    /// the stream as a live event.
    pub fn post(&self, sender: &UserId, payload: Payload) -> Message {
        let at = self.tick();
        let message = self.build(sender.clone(), payload, at);
        self.insert_sorted(message.clone());
        message
    }

    /// Set the logical clock used for the next accepted message.
    pub fn set_clock(&self, at: Timestamp) {
        self.clock.store(at.as_millis(), Ordering::SeqCst);
    }

    /// Snapshot of the full server-side log.
    #[must_use]
    pub fn messages(&self) -> Vec<Message> {
        self.log.lock().clone()
    }

    /// Make every future call of `op` fail with `error` until [`heal`](Self::heal).
    pub fn fail(&self, op: BackendOp, error: BackendError) {
        self.faults.lock().insert(op, error);
    }

    /// Remove an injected failure.
    pub fn heal(&self, op: BackendOp) {
        self.faults.lock().remove(&op);
    }

    /// Hold calls of `op` at the gate until [`resume`](Self::resume).
    pub fn pause(&self, op: BackendOp) {
        self.paused.send_modify(|paused| {
            paused.insert(op);
        });
    }

    /// Release calls of `op` held at the gate.
    pub fn resume(&self, op: BackendOp) {
        self.paused.send_modify(|paused| {
            paused.remove(&op);
        });
    }

    /// Number of calls of `op` started so far, including held ones.
    #[must_use]
    pub fn calls(&self, op: BackendOp) -> usize {
        self.calls.lock().get(&op).copied().unwrap_or(0)
    }

    /// Count the call, wait at the gate, then apply any injected failure.
    async fn enter(&self, op: BackendOp) -> Result<(), BackendError> {
        *self.calls.lock().entry(op).or_insert(0) += 1;

        let mut gate = self.paused.subscribe();
        if gate.wait_for(|paused| !paused.contains(&op)).await.is_err() {
            return Err(BackendError::Network("backend shut down".into()));
        }

        match self.faults.lock().get(&op) {
            Some(error) => {
                tracing::debug!(?op, %error, "injected backend failure");
                Err(error.clone())
            }
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for InMemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBackend")
            .field("channel_id", &self.channel_id)
            .field("messages", &self.log.lock().len())
            .finish_non_exhaustive()
    }
}

impl ChannelBackend for InMemoryBackend {
    async fn fetch_page(
        &self,
        direction: Direction,
        position: &Position,
        page_size: usize,
    ) -> Result<Page, BackendError> {
        self.enter(BackendOp::Fetch).await?;

        let log = self.log.lock();
        let mut beyond = log.iter().filter(|m| position.admits(direction, m));
        let page = match direction {
            Direction::Previous => {
                let older: Vec<&Message> = beyond.collect();
                let start = older.len().saturating_sub(page_size);
                Page {
                    messages: older[start..].iter().map(|m| (*m).clone()).collect(),
                    has_more: start > 0,
                }
            }
            Direction::Next => {
                let messages: Vec<Message> = beyond.by_ref().take(page_size).cloned().collect();
                Page {
                    messages,
                    has_more: beyond.next().is_some(),
                }
            }
        };
        Ok(page)
    }

    async fn send_message(
        &self,
        channel: &ChannelId,
        request_id: RequestId,
        draft: &MessageDraft,
    ) -> Result<Message, BackendError> {
        self.enter(BackendOp::Send).await?;

        if *channel != self.channel_id {
            return Err(BackendError::Rejected(format!("unknown channel {channel}")));
        }
        let mut message = self.build(self.user.clone(), draft.payload.clone(), self.tick());
        message.parent.clone_from(&draft.parent);
        message.request_id = Some(request_id);
        self.insert_sorted(message.clone());
        Ok(message)
    }

    async fn update_message(
        &self,
        id: &MessageId,
        payload: &Payload,
    ) -> Result<Message, BackendError> {
        self.enter(BackendOp::Update).await?;

        let updated_at = self.tick();
        let mut log = self.log.lock();
        let key = MessageKey::Server(id.clone());
        let message = log
            .iter_mut()
            .find(|m| m.key == key)
            .ok_or_else(|| BackendError::NotFound(id.clone()))?;
        message.payload = payload.clone();
        message.updated_at = updated_at;
        Ok(message.clone())
    }

    async fn delete_message(&self, id: &MessageId) -> Result<(), BackendError> {
        self.enter(BackendOp::Delete).await?;

        let mut log = self.log.lock();
        let key = MessageKey::Server(id.clone());
        let before = log.len();
        log.retain(|m| m.key != key);
        if log.len() == before {
            return Err(BackendError::NotFound(id.clone()));
        }
        Ok(())
    }
}
