//! Collaborator interface for history fetches, sends, updates and deletes.
//!
//! Defines the [`ChannelBackend`] trait the stream controller drives.
//! Concrete implementations include:
//! - [`memory::InMemoryBackend`] — in-process ordered log for tests and demos

pub mod memory;

use chatline_proto::message::{ChannelId, Message, MessageDraft, MessageId, Payload, RequestId};
use chatline_proto::page::{Direction, Page, Position};

/// Errors reported by a [`ChannelBackend`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// The request did not reach the server or timed out.
    #[error("network error: {0}")]
    Network(String),

    /// The server refused the request.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// The referenced message does not exist on the server.
    #[error("message {0} not found")]
    NotFound(MessageId),

    /// The server answered with something the controller cannot use.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Async access to one channel's server-side message log.
///
/// Implementations return messages in ascending ordering-key order and
/// assign server identifiers ([`chatline_proto::message::MessageKey::Server`])
/// to everything they accept.
pub trait ChannelBackend: Send + Sync {
    /// Fetch up to `page_size` messages strictly beyond `position` in `direction`.
    ///
    /// For [`Direction::Previous`] the page holds the newest messages older
    /// than `position`; for [`Direction::Next`] the oldest messages newer
    /// than it.
    fn fetch_page(
        &self,
        direction: Direction,
        position: &Position,
        page_size: usize,
    ) -> impl std::future::Future<Output = Result<Page, BackendError>> + Send;

    /// Send a new message to `channel`, returning the accepted message.
    ///
    /// The accepted message, and every live echo of it, carries
    /// `request_id` so the sender can match it to its optimistic copy.
    fn send_message(
        &self,
        channel: &ChannelId,
        request_id: RequestId,
        draft: &MessageDraft,
    ) -> impl std::future::Future<Output = Result<Message, BackendError>> + Send;

    /// Replace the payload of an existing message, returning the stored result.
    fn update_message(
        &self,
        id: &MessageId,
        payload: &Payload,
    ) -> impl std::future::Future<Output = Result<Message, BackendError>> + Send;

    /// Delete a message.
    fn delete_message(
        &self,
        id: &MessageId,
    ) -> impl std::future::Future<Output = Result<(), BackendError>> + Send;
}
