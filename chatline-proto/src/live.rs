//! Push events delivered by the live-event source.
//!
//! Events arrive asynchronously and are not ordered relative to page
//! fetches; consumers must reconcile them by ordering key only.

use serde::{Deserialize, Serialize};

use crate::message::{ChannelId, Message, MessageId, UserId};

/// A live event for one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LiveEvent {
    /// New messages were posted.
    MessagesReceived(Vec<Message>),
    /// Existing messages were edited.
    MessagesUpdated(Vec<Message>),
    /// Messages were deleted.
    MessagesDeleted(Vec<MessageId>),
    /// The channel itself was deleted.
    ChannelDeleted(ChannelId),
    /// The set of users currently typing changed.
    TypingStatusChanged {
        /// Users typing right now.
        typing: Vec<UserId>,
    },
}

impl LiveEvent {
    /// Short name used in log fields.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::MessagesReceived(_) => "messages_received",
            Self::MessagesUpdated(_) => "messages_updated",
            Self::MessagesDeleted(_) => "messages_deleted",
            Self::ChannelDeleted(_) => "channel_deleted",
            Self::TypingStatusChanged { .. } => "typing_status_changed",
        }
    }
}
