//! Pagination types exchanged with the historical-fetch collaborator.

use serde::{Deserialize, Serialize};

use crate::message::{Message, MessageId, Timestamp};

/// Which way a page fetch walks the historical log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Towards older messages (before the head cursor).
    Previous,
    /// Towards newer messages (after the tail cursor).
    Next,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Previous => write!(f, "previous"),
            Self::Next => write!(f, "next"),
        }
    }
}

/// A bound in the historical log, comparable with a message's ordering key.
///
/// A position without a message id sits before every message sharing its
/// timestamp, so `Previous` from `at(t)` yields messages older than `t` and
/// `Next` from `at(t)` yields messages at or after `t`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Position {
    /// Creation time of the bounding message.
    pub timestamp: Timestamp,
    /// Identifier of the bounding message, if the bound is a message.
    pub message_id: Option<MessageId>,
}

impl Position {
    /// A bound at `timestamp` that is not tied to a specific message.
    #[must_use]
    pub const fn at(timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            message_id: None,
        }
    }

    /// A bound after every message in the log.
    #[must_use]
    pub const fn latest() -> Self {
        Self::at(Timestamp::MAX)
    }

    /// Returns `true` if `message` lies strictly beyond this bound in `direction`.
    #[must_use]
    pub fn admits(&self, direction: Direction, message: &Message) -> bool {
        let position = message.position();
        match direction {
            Direction::Previous => position < *self,
            Direction::Next => position > *self,
        }
    }
}

/// Where a freshly reset stream anchors its window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum StartingPoint {
    /// The newest end of the log; nothing can be fetched forward.
    #[default]
    Latest,
    /// Centered on a point in time.
    At(Timestamp),
}

impl StartingPoint {
    /// The position both cursors start from.
    #[must_use]
    pub const fn position(self) -> Position {
        match self {
            Self::Latest => Position::latest(),
            Self::At(ts) => Position::at(ts),
        }
    }
}

/// One page returned by a historical fetch, in ascending ordering-key order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Page {
    /// Messages beyond the requested position.
    pub messages: Vec<Message>,
    /// Whether the log continues past the last message of this page.
    pub has_more: bool,
}
