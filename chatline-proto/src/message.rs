//! Message model shared between the stream controller and its collaborators.
//!
//! A [`Message`] is identified by a [`MessageKey`]: either the identifier the
//! server assigned once it accepted the message, or a locally generated
//! [`RequestId`] while an optimistic send is still in flight.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::page::Position;

/// Maximum allowed text payload size in bytes (64 KB).
pub const MAX_TEXT_SIZE: usize = 64 * 1024;

/// Server-assigned message identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Wraps a server-assigned identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Temporary identifier for an optimistically created message (UUID v7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Creates a new time-ordered request identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates a `RequestId` from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the inner UUID value.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a message inside an ordered collection.
///
/// The derived ordering is total: all server keys sort before local keys,
/// server keys compare by identifier string and local keys by UUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MessageKey {
    /// Accepted by the server.
    Server(MessageId),
    /// Created locally, not (yet) accepted.
    Local(RequestId),
}

impl MessageKey {
    /// Returns the server identifier, if the message has one.
    #[must_use]
    pub const fn as_server(&self) -> Option<&MessageId> {
        match self {
            Self::Server(id) => Some(id),
            Self::Local(_) => None,
        }
    }

    /// Returns `true` for keys that were generated locally.
    #[must_use]
    pub const fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }
}

impl From<MessageId> for MessageKey {
    fn from(id: MessageId) -> Self {
        Self::Server(id)
    }
}

impl From<RequestId> for MessageKey {
    fn from(id: RequestId) -> Self {
        Self::Local(id)
    }
}

impl std::fmt::Display for MessageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Server(id) => write!(f, "{id}"),
            Self::Local(id) => write!(f, "local:{id}"),
        }
    }
}

/// Identifies a message author.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    /// Creates a user identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies the conversation a message belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(String);

impl ChannelId {
    /// Creates a channel identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Millisecond-precision UTC timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The largest representable timestamp, used as the "latest" anchor.
    pub const MAX: Self = Self(u64::MAX);

    /// Creates a timestamp for the current instant.
    #[must_use]
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// Creates a timestamp from milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Reference to an uploaded file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    /// Display name of the file.
    pub name: String,
    /// Location the file can be fetched from.
    pub url: String,
    /// MIME type, when known.
    pub mime_type: Option<String>,
    /// Size in bytes, when known.
    pub size: Option<u64>,
}

/// Content of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    /// Plain text.
    Text(String),
    /// A file attachment.
    File(FileRef),
}

impl Payload {
    /// Convenience constructor for a text payload.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    /// Validates this payload for sending or updating.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] if text is empty or larger than
    /// [`MAX_TEXT_SIZE`], or if a file reference lacks a name or URL.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Self::Text(text) => {
                if text.is_empty() {
                    return Err(ValidationError::EmptyText);
                }
                if text.len() > MAX_TEXT_SIZE {
                    return Err(ValidationError::TooLarge {
                        size: text.len(),
                        max: MAX_TEXT_SIZE,
                    });
                }
            }
            Self::File(file) => {
                if file.name.is_empty() {
                    return Err(ValidationError::MissingFileName);
                }
                if file.url.is_empty() {
                    return Err(ValidationError::MissingFileUrl);
                }
            }
        }
        Ok(())
    }
}

/// Error returned when a payload fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Text content is empty.
    #[error("message text is empty")]
    EmptyText,
    /// Text content exceeds the maximum allowed size.
    #[error("message too large ({size} bytes, max {max} bytes)")]
    TooLarge {
        /// Actual size of the content in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },
    /// File reference has no name.
    #[error("file attachment has no name")]
    MissingFileName,
    /// File reference has no URL.
    #[error("file attachment has no url")]
    MissingFileUrl,
}

/// Lifecycle of a message as seen by the local view.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageStatus {
    /// Locally created or edited, awaiting the server.
    Pending,
    /// Confirmed by the server.
    Succeeded,
    /// The last send or update failed with a reason.
    Failed(String),
}

impl MessageStatus {
    /// Returns `true` for [`MessageStatus::Pending`].
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    /// Returns `true` for [`MessageStatus::Failed`].
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// A message in a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Identity within the collection.
    pub key: MessageKey,
    /// Channel the message belongs to.
    pub channel_id: ChannelId,
    /// Author of the message.
    pub sender: UserId,
    /// Text or file content.
    pub payload: Payload,
    /// Server creation time, or a local placeholder while pending.
    pub created_at: Timestamp,
    /// Last time the content changed.
    pub updated_at: Timestamp,
    /// Local lifecycle status.
    pub status: MessageStatus,
    /// Message this one replies to, if any.
    pub parent: Option<MessageId>,
    /// Temporary identifier the message was sent under, echoed by the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
}

impl Message {
    /// Compares two messages by ordering key: creation time, then key.
    #[must_use]
    pub fn cmp_ordering_key(&self, other: &Self) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then_with(|| self.key.cmp(&other.key))
    }

    /// Pagination position of this message.
    #[must_use]
    pub fn position(&self) -> Position {
        Position {
            timestamp: self.created_at,
            message_id: self.key.as_server().cloned(),
        }
    }

    /// Returns `true` if `user` authored this message.
    #[must_use]
    pub fn is_from(&self, user: &UserId) -> bool {
        self.sender == *user
    }
}

/// What a caller provides to send a new message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDraft {
    /// Content to send.
    pub payload: Payload,
    /// Optional reply target.
    pub parent: Option<MessageId>,
}

impl MessageDraft {
    /// A plain text draft with no reply target.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            payload: Payload::text(text),
            parent: None,
        }
    }

    /// A file draft with no reply target.
    #[must_use]
    pub const fn file(file: FileRef) -> Self {
        Self {
            payload: Payload::File(file),
            parent: None,
        }
    }

    /// Sets the reply target.
    #[must_use]
    pub fn replying_to(mut self, parent: MessageId) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Validates the draft payload.
    ///
    /// # Errors
    ///
    /// See [`Payload::validate`].
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.payload.validate()
    }
}
