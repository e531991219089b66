//! Message stream controller for one conversation view.
//!
//! [`MessageStream`] owns the ordered message store and the pending
//! operation tracker for a single channel view. It merges historical
//! pages, live events and optimistic local operations into one ordered
//! collection, keeps the scroll-gated new-message counter, and publishes
//! every change on the view's [`EventBus`].
//!
//! All state lives behind one lock that is never held across an `.await`;
//! backend calls suspend without it, so other events may interleave while
//! a fetch or send is outstanding. Merges are keyed by message identity and
//! ordering key only, which makes those interleavings safe.

pub mod pagination;
pub mod pending;
mod receive;
mod send;
pub mod store;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::watch;

use chatline_proto::message::{
    ChannelId, Message, MessageDraft, MessageKey, Payload, UserId, ValidationError,
};
use chatline_proto::page::Direction;

use crate::backend::{BackendError, ChannelBackend};
use crate::bus::{EventBus, EventKind, StreamEvent, Subscription};
use crate::config::StreamConfig;

use pagination::Pagination;
use pending::{OperationState, PendingTracker};
use store::{MessageStore, SortComparator, default_comparator};

/// Decides whether received messages count as new while at the bottom.
pub type CountPredicate = Arc<dyn Fn() -> bool + Send + Sync>;

/// Rewrites a draft before it is sent.
pub type DraftHook = Arc<dyn Fn(MessageDraft) -> MessageDraft + Send + Sync>;

/// Rewrites a payload before an update is issued.
pub type PayloadHook = Arc<dyn Fn(Payload) -> Payload + Send + Sync>;

/// Errors returned by send, update, resend and delete.
///
/// Failures never leave the controller unusable; the affected message
/// carries the terminal state where one applies.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OperationError {
    /// The payload failed validation; nothing was inserted.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// The backend call failed.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// The key is not part of the current view.
    #[error("message {0} is not in this view")]
    UnknownMessage(MessageKey),

    /// Only failed operations can be resent.
    #[error("message {0} has no failed operation to resend")]
    NotRetryable(MessageKey),

    /// The message's send failed, so it has no server identity to edit.
    #[error("message {0} was never confirmed by the server")]
    TargetNotConfirmed(MessageKey),

    /// The message has an operation awaiting the server.
    #[error("message {0} has an operation in flight")]
    InFlight(MessageKey),
}

/// Read model handed to the rendering layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamView {
    /// Ordered messages, detached from the store.
    pub messages: Arc<[Message]>,
    /// Messages received since the viewer last reached the bottom.
    pub new_message_count: usize,
    /// Whether the initial window is still loading.
    pub loading: bool,
    /// Whether newer history can be fetched.
    pub has_next: bool,
    /// Whether older history can be fetched.
    pub has_previous: bool,
    /// Whether the viewer is at the bottom of the list.
    pub is_at_bottom: bool,
    /// Whether the channel was deleted while the view was open.
    pub channel_deleted: bool,
}

/// Everything guarded by the stream lock.
struct StreamState {
    store: MessageStore,
    pending: PendingTracker,
    pagination: Pagination,
    new_message_count: usize,
    is_at_bottom: bool,
    loading: bool,
    channel_deleted: bool,
}

impl StreamState {
    fn new(comparator: SortComparator) -> Self {
        Self {
            store: MessageStore::new(comparator),
            pending: PendingTracker::new(),
            pagination: Pagination::new(),
            new_message_count: 0,
            is_at_bottom: true,
            loading: false,
            channel_deleted: false,
        }
    }

    fn view(&self) -> StreamView {
        StreamView {
            messages: self.store.to_ordered_sequence(),
            new_message_count: self.new_message_count,
            loading: self.loading,
            has_next: self.pagination.has_more(Direction::Next),
            has_previous: self.pagination.has_more(Direction::Previous),
            is_at_bottom: self.is_at_bottom,
            channel_deleted: self.channel_deleted,
        }
    }
}

/// Bidirectionally paginated, optimistically updated message stream.
pub struct MessageStream<B: ChannelBackend> {
    /// History, send and update capability.
    backend: B,
    /// Channel this view shows.
    channel_id: ChannelId,
    /// The local user; their messages never count as new.
    current_user: UserId,
    /// Messages requested per page fetch.
    page_size: usize,
    /// Per-view event bus.
    bus: EventBus,
    /// Store, tracker, cursors and view flags.
    state: Mutex<StreamState>,
    /// Latest view, refreshed on every mutation.
    view_tx: watch::Sender<StreamView>,
    /// Order applied by the store; kept to rebuild it on reset.
    comparator: SortComparator,
    /// Caller policy for counting messages while at the bottom.
    should_count_new_messages: CountPredicate,
    /// Applied to drafts before sending.
    before_send: DraftHook,
    /// Applied to payloads before updating.
    before_update: PayloadHook,
    /// Results dropped because they resolved after a reset.
    stale_discards: AtomicU64,
}

impl<B: ChannelBackend> MessageStream<B> {
    /// Start building a stream for `channel_id` as seen by `current_user`.
    pub fn builder(backend: B, channel_id: ChannelId, current_user: UserId) -> StreamBuilder<B> {
        StreamBuilder {
            backend,
            channel_id,
            current_user,
            config: StreamConfig::default(),
            bus: None,
            comparator: None,
            should_count_new_messages: None,
            before_send: None,
            before_update: None,
        }
    }

    /// The channel this stream shows.
    #[must_use]
    pub const fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    /// The local user.
    #[must_use]
    pub const fn current_user(&self) -> &UserId {
        &self.current_user
    }

    /// The backend this stream drives.
    #[must_use]
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    /// The view's event bus; clone it to hand to other consumers.
    #[must_use]
    pub const fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Shorthand for `self.bus().subscribe(kind, listener)`.
    pub fn subscribe<F>(&self, kind: EventKind, listener: F) -> Subscription
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        self.bus.subscribe(kind, listener)
    }

    /// Current read model.
    #[must_use]
    pub fn view(&self) -> StreamView {
        self.view_tx.borrow().clone()
    }

    /// Receiver that observes every view refresh.
    #[must_use]
    pub fn watch_view(&self) -> watch::Receiver<StreamView> {
        self.view_tx.subscribe()
    }

    /// Ordered messages for display.
    #[must_use]
    pub fn messages(&self) -> Arc<[Message]> {
        self.state.lock().store.to_ordered_sequence()
    }

    /// Whether newer history can be fetched with [`next`](Self::next).
    #[must_use]
    pub fn has_next(&self) -> bool {
        self.view_tx.borrow().has_next
    }

    /// Whether older history can be fetched with [`prev`](Self::prev).
    #[must_use]
    pub fn has_previous(&self) -> bool {
        self.view_tx.borrow().has_previous
    }

    /// Messages received since the viewer last reached the bottom.
    #[must_use]
    pub fn new_message_count(&self) -> usize {
        self.state.lock().new_message_count
    }

    /// Whether the initial window is still loading.
    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.state.lock().loading
    }

    /// Whether the viewer is at the bottom of the list.
    #[must_use]
    pub fn is_at_bottom(&self) -> bool {
        self.state.lock().is_at_bottom
    }

    /// Whether the channel was deleted while this view was open.
    #[must_use]
    pub fn is_channel_deleted(&self) -> bool {
        self.state.lock().channel_deleted
    }

    /// Lifecycle state of the tracked operation on `key`, if any.
    #[must_use]
    pub fn operation_state(&self, key: &MessageKey) -> Option<OperationState> {
        self.state.lock().pending.state(key).cloned()
    }

    /// How many late results were discarded because a reset superseded them.
    #[must_use]
    pub fn stale_discards(&self) -> u64 {
        self.stale_discards.load(Ordering::SeqCst)
    }

    /// Zero the new-message counter.
    pub fn reset_new_messages(&self) {
        let changed = self.mutate(|state| {
            let changed = state.new_message_count != 0;
            state.new_message_count = 0;
            changed
        });
        if changed {
            self.publish(StreamEvent::NewMessageCountChanged { count: 0 });
        }
    }

    /// Record whether the viewer scrolled away from the bottom.
    ///
    /// Returning to the bottom (`false`) also resets the new-message counter.
    pub fn on_scrolled_away_from_bottom(&self, scrolled_away: bool) {
        if !scrolled_away {
            self.reset_new_messages();
        }
        self.mutate(|state| state.is_at_bottom = !scrolled_away);
    }

    /// Run `change` under the state lock and refresh the view.
    fn mutate<R>(&self, change: impl FnOnce(&mut StreamState) -> R) -> R {
        let mut state = self.state.lock();
        let result = change(&mut state);
        self.view_tx.send_replace(state.view());
        result
    }

    fn publish(&self, event: StreamEvent) {
        let delivered = self.bus.publish(&event);
        tracing::trace!(kind = ?event.kind(), delivered, "published stream event");
    }

    fn note_stale(&self, operation: &'static str) {
        self.stale_discards.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(
            channel = %self.channel_id,
            operation,
            "discarding result that resolved after a reset"
        );
    }
}

impl<B: ChannelBackend> std::fmt::Debug for MessageStream<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageStream")
            .field("channel_id", &self.channel_id)
            .field("current_user", &self.current_user)
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

/// Builder for [`MessageStream`].
pub struct StreamBuilder<B: ChannelBackend> {
    backend: B,
    channel_id: ChannelId,
    current_user: UserId,
    config: StreamConfig,
    bus: Option<EventBus>,
    comparator: Option<SortComparator>,
    should_count_new_messages: Option<CountPredicate>,
    before_send: Option<DraftHook>,
    before_update: Option<PayloadHook>,
}

impl<B: ChannelBackend> StreamBuilder<B> {
    /// Use page size and buffer settings from `config`.
    #[must_use]
    pub fn config(mut self, config: &StreamConfig) -> Self {
        self.config = config.clone();
        self
    }

    /// Publish on an existing bus instead of creating one.
    #[must_use]
    pub fn bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Order messages with `comparator` (ties still break by key).
    #[must_use]
    pub fn sort_comparator<F>(mut self, comparator: F) -> Self
    where
        F: Fn(&Message, &Message) -> std::cmp::Ordering + Send + Sync + 'static,
    {
        self.comparator = Some(Arc::new(comparator));
        self
    }

    /// Count received messages even while at the bottom when `predicate` holds.
    #[must_use]
    pub fn should_count_new_messages<F>(mut self, predicate: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.should_count_new_messages = Some(Arc::new(predicate));
        self
    }

    /// Rewrite drafts before they are sent.
    #[must_use]
    pub fn before_send<F>(mut self, hook: F) -> Self
    where
        F: Fn(MessageDraft) -> MessageDraft + Send + Sync + 'static,
    {
        self.before_send = Some(Arc::new(hook));
        self
    }

    /// Rewrite payloads before updates are issued.
    #[must_use]
    pub fn before_update<F>(mut self, hook: F) -> Self
    where
        F: Fn(Payload) -> Payload + Send + Sync + 'static,
    {
        self.before_update = Some(Arc::new(hook));
        self
    }

    /// Build the stream. It starts empty; call
    /// [`MessageStream::reset_with_starting_point`] to load a window.
    #[must_use]
    pub fn build(self) -> MessageStream<B> {
        let comparator = self.comparator.unwrap_or_else(default_comparator);
        let state = StreamState::new(Arc::clone(&comparator));
        let (view_tx, _) = watch::channel(state.view());

        MessageStream {
            backend: self.backend,
            channel_id: self.channel_id,
            current_user: self.current_user,
            page_size: self.config.page_size.max(1),
            bus: self.bus.unwrap_or_default(),
            state: Mutex::new(state),
            view_tx,
            comparator,
            should_count_new_messages: self
                .should_count_new_messages
                .unwrap_or_else(|| Arc::new(|| false)),
            before_send: self.before_send.unwrap_or_else(|| Arc::new(|draft| draft)),
            before_update: self
                .before_update
                .unwrap_or_else(|| Arc::new(|payload| payload)),
            stale_discards: AtomicU64::new(0),
        }
    }
}
