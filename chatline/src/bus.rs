//! Per-view publish/subscribe bus for stream domain events.
//!
//! An [`EventBus`] is created for one conversation view and handed to every
//! consumer that wants to observe the stream (typing indicators, unread
//! badges, analytics). Listeners receive owned snapshots of event payloads,
//! never references into the message store.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use chatline_proto::message::{ChannelId, Message, MessageKey, RequestId, UserId};
use chatline_proto::page::StartingPoint;

/// Domain events published by the stream controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// An optimistic message was inserted and its send is in flight.
    MessageSentPending {
        /// The pending message as shown to the user.
        message: Message,
    },
    /// The server accepted a send; the pending message was replaced.
    MessageSentSuccess {
        /// Temporary identifier the message was shown under.
        request_id: RequestId,
        /// The server-confirmed message.
        message: Message,
    },
    /// A send failed; the message stays visible with a failed status.
    MessageSendFailed {
        /// The failed message.
        message: Message,
        /// Why the send failed.
        reason: String,
    },
    /// An update failed; the message was restored to its prior content.
    MessageUpdateFailed {
        /// The restored message, marked failed.
        message: Message,
        /// Why the update failed.
        reason: String,
    },
    /// Messages arrived through the live-event source.
    MessagesReceived {
        /// Messages the merge inserted or changed, as stored.
        messages: Vec<Message>,
    },
    /// Messages changed content or status.
    MessagesUpdated {
        /// Messages as stored after the change.
        messages: Vec<Message>,
    },
    /// Messages were removed from the collection.
    MessagesDeleted {
        /// Keys that were removed.
        keys: Vec<MessageKey>,
    },
    /// The channel backing this view was deleted.
    ChannelDeleted {
        /// The deleted channel.
        channel_id: ChannelId,
    },
    /// The set of users typing in this channel changed.
    TypingStatusChanged {
        /// Users typing right now.
        typing: Vec<UserId>,
    },
    /// The unseen new-message counter changed.
    NewMessageCountChanged {
        /// Current counter value.
        count: usize,
    },
    /// The stream was re-anchored and its collection discarded.
    StreamReset {
        /// The new anchor.
        starting_point: StartingPoint,
    },
}

impl StreamEvent {
    /// The [`EventKind`] of this event.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::MessageSentPending { .. } => EventKind::MessageSentPending,
            Self::MessageSentSuccess { .. } => EventKind::MessageSentSuccess,
            Self::MessageSendFailed { .. } => EventKind::MessageSendFailed,
            Self::MessageUpdateFailed { .. } => EventKind::MessageUpdateFailed,
            Self::MessagesReceived { .. } => EventKind::MessagesReceived,
            Self::MessagesUpdated { .. } => EventKind::MessagesUpdated,
            Self::MessagesDeleted { .. } => EventKind::MessagesDeleted,
            Self::ChannelDeleted { .. } => EventKind::ChannelDeleted,
            Self::TypingStatusChanged { .. } => EventKind::TypingStatusChanged,
            Self::NewMessageCountChanged { .. } => EventKind::NewMessageCountChanged,
            Self::StreamReset { .. } => EventKind::StreamReset,
        }
    }
}

/// Subscription filter; `Any` matches every event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Every event.
    Any,
    /// See [`StreamEvent::MessageSentPending`].
    MessageSentPending,
    /// See [`StreamEvent::MessageSentSuccess`].
    MessageSentSuccess,
    /// See [`StreamEvent::MessageSendFailed`].
    MessageSendFailed,
    /// See [`StreamEvent::MessageUpdateFailed`].
    MessageUpdateFailed,
    /// See [`StreamEvent::MessagesReceived`].
    MessagesReceived,
    /// See [`StreamEvent::MessagesUpdated`].
    MessagesUpdated,
    /// See [`StreamEvent::MessagesDeleted`].
    MessagesDeleted,
    /// See [`StreamEvent::ChannelDeleted`].
    ChannelDeleted,
    /// See [`StreamEvent::TypingStatusChanged`].
    TypingStatusChanged,
    /// See [`StreamEvent::NewMessageCountChanged`].
    NewMessageCountChanged,
    /// See [`StreamEvent::StreamReset`].
    StreamReset,
}

impl EventKind {
    /// Returns `true` if a subscription for `self` should see `event`.
    #[must_use]
    pub fn matches(self, event: &StreamEvent) -> bool {
        self == Self::Any || self == event.kind()
    }
}

type Listener = Arc<dyn Fn(&StreamEvent) + Send + Sync>;

struct Entry {
    id: u64,
    kind: EventKind,
    listener: Listener,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    entries: Vec<Entry>,
}

/// In-process publish/subscribe channel scoped to one conversation view.
///
/// Cloning an `EventBus` yields another handle to the same registry.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
}

impl EventBus {
    /// Create a bus with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` for events of `kind`.
    ///
    /// The listener stays registered until the returned [`Subscription`] is
    /// dropped or [`Subscription::unsubscribe`] is called.
    pub fn subscribe<F>(&self, kind: EventKind, listener: F) -> Subscription
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        let mut registry = self.registry.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.entries.push(Entry {
            id,
            kind,
            listener: Arc::new(listener),
        });
        tracing::trace!(subscription = id, ?kind, "event bus subscription added");

        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Register a channel-backed subscriber for events of `kind`.
    ///
    /// Delivery is best-effort: when the receiver falls `buffer` events
    /// behind, further events are dropped for that subscriber.
    pub fn subscribe_channel(
        &self,
        kind: EventKind,
        buffer: usize,
    ) -> (Subscription, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let subscription = self.subscribe(kind, move |event| {
            if let Err(mpsc::error::TrySendError::Full(event)) = tx.try_send(event.clone()) {
                tracing::debug!(kind = ?event.kind(), "event channel full, dropping event");
            }
        });
        (subscription, rx)
    }

    /// Deliver `event` to every matching listener, returning how many ran.
    ///
    /// Listeners run after the registry lock is released, so they may
    /// subscribe or unsubscribe re-entrantly.
    pub fn publish(&self, event: &StreamEvent) -> usize {
        let listeners: Vec<Listener> = self
            .registry
            .lock()
            .entries
            .iter()
            .filter(|entry| entry.kind.matches(event))
            .map(|entry| Arc::clone(&entry.listener))
            .collect();

        for listener in &listeners {
            listener(event);
        }
        listeners.len()
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.registry.lock().entries.len()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Handle returned by [`EventBus::subscribe`]; dropping it unsubscribes.
#[must_use = "dropping a Subscription immediately unsubscribes its listener"]
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    /// Remove the listener from its bus.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().entries.retain(|entry| entry.id != self.id);
            tracing::trace!(subscription = self.id, "event bus subscription removed");
        }
    }
}
