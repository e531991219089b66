//! Live-event handling for [`MessageStream`].
//!
//! Applies pushed changes from the live-event source to the store and
//! maintains the new-message counter. Events for other channels are
//! dropped.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use chatline_proto::live::LiveEvent;
use chatline_proto::message::{ChannelId, Message, MessageId, MessageKey, MessageStatus};

use crate::backend::ChannelBackend;
use crate::bus::StreamEvent;

use super::MessageStream;
use super::store::Upsert;

impl<B: ChannelBackend> MessageStream<B> {
    /// Apply one event from the live-event source.
    ///
    /// - **Received**: upserted by key, so redelivery is harmless. An insert
    ///   counts as new when it is a confirmed message from another user and
    ///   the viewer is scrolled away, or the count predicate holds.
    /// - **Updated**: replaces messages already in the window; others are
    ///   ignored.
    /// - **Deleted**: removes the messages and any tracked operation on them.
    /// - **Channel deleted**: flags the view; the stream stays usable.
    /// - **Typing**: forwarded to the bus.
    pub fn handle_live_event(&self, event: LiveEvent) {
        tracing::trace!(channel = %self.channel_id, event = event.name(), "live event");
        match event {
            LiveEvent::MessagesReceived(messages) => self.apply_received(messages),
            LiveEvent::MessagesUpdated(messages) => self.apply_updated(messages),
            LiveEvent::MessagesDeleted(ids) => self.apply_deleted(ids),
            LiveEvent::ChannelDeleted(channel_id) => self.apply_channel_deleted(&channel_id),
            LiveEvent::TypingStatusChanged { typing } => {
                self.publish(StreamEvent::TypingStatusChanged { typing });
            }
        }
    }

    fn for_this_channel(&self, messages: Vec<Message>) -> Vec<Message> {
        messages
            .into_iter()
            .filter(|message| {
                let ours = message.channel_id == self.channel_id;
                if !ours {
                    tracing::debug!(
                        channel = %self.channel_id,
                        other = %message.channel_id,
                        key = %message.key,
                        "ignoring live message for another channel"
                    );
                }
                ours
            })
            .collect()
    }

    fn counts_as_new(&self, message: &Message) -> bool {
        !message.key.is_local()
            && message.status == MessageStatus::Succeeded
            && !message.is_from(&self.current_user)
    }

    fn apply_received(&self, messages: Vec<Message>) {
        let messages = self.for_this_channel(messages);
        if messages.is_empty() {
            return;
        }

        // Caller code; must run outside the state lock.
        let count_at_bottom = (self.should_count_new_messages)();

        let (stored, count) = self.mutate(|state| {
            let counting = !state.is_at_bottom || count_at_bottom;
            let mut stored = Vec::with_capacity(messages.len());
            let mut counted = 0;
            for message in messages {
                let key = message.key.clone();
                let is_new = self.counts_as_new(&message);
                // An echo of our own send can beat the send's response.
                if let (Some(request_id), Some(server_id)) = (message.request_id, key.as_server())
                    && state.store.remove(&MessageKey::Local(request_id)).is_some()
                {
                    state.pending.complete_send(request_id, server_id.clone());
                }
                match state.store.upsert(message) {
                    Upsert::Unchanged => continue,
                    Upsert::Inserted if is_new && counting => counted += 1,
                    Upsert::Inserted | Upsert::Replaced => {}
                }
                stored.extend(state.store.get(&key).cloned());
            }
            state.new_message_count += counted;
            (stored, (counted > 0).then_some(state.new_message_count))
        });

        if stored.is_empty() {
            tracing::trace!(channel = %self.channel_id, "live messages already present");
            return;
        }
        tracing::debug!(channel = %self.channel_id, count = stored.len(), "live messages merged");
        self.publish(StreamEvent::MessagesReceived { messages: stored });
        if let Some(count) = count {
            self.publish(StreamEvent::NewMessageCountChanged { count });
        }
    }

    fn apply_updated(&self, messages: Vec<Message>) {
        let messages = self.for_this_channel(messages);
        let changed = self.mutate(|state| {
            let mut changed = Vec::new();
            for message in messages {
                if !state.store.contains(&message.key) {
                    continue;
                }
                let key = message.key.clone();
                if state.store.upsert(message) == Upsert::Replaced {
                    changed.extend(state.store.get(&key).cloned());
                }
            }
            changed
        });

        if !changed.is_empty() {
            self.publish(StreamEvent::MessagesUpdated { messages: changed });
        }
    }

    fn apply_deleted(&self, ids: Vec<MessageId>) {
        let removed = self.mutate(|state| {
            ids.into_iter()
                .map(MessageKey::Server)
                .filter(|key| {
                    state.pending.forget(key);
                    state.store.remove(key).is_some()
                })
                .collect::<Vec<_>>()
        });

        if !removed.is_empty() {
            self.publish(StreamEvent::MessagesDeleted { keys: removed });
        }
    }

    fn apply_channel_deleted(&self, channel_id: &ChannelId) {
        if *channel_id != self.channel_id {
            tracing::debug!(channel = %self.channel_id, other = %channel_id, "ignoring deletion of another channel");
            return;
        }
        let first = self.mutate(|state| !std::mem::replace(&mut state.channel_deleted, true));
        if first {
            tracing::warn!(channel = %self.channel_id, "channel deleted while open");
            self.publish(StreamEvent::ChannelDeleted {
                channel_id: channel_id.clone(),
            });
        }
    }
}

impl<B: ChannelBackend + 'static> MessageStream<B> {
    /// Drive [`handle_live_event`](Self::handle_live_event) from `events`
    /// on a background task until the sender side closes.
    pub fn spawn_event_pump(self: &Arc<Self>, mut events: mpsc::Receiver<LiveEvent>) -> JoinHandle<()> {
        let stream = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                stream.handle_live_event(event);
            }
            tracing::debug!(channel = %stream.channel_id, "live event source closed");
        })
    }
}
