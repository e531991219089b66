//! Bidirectional pagination for [`MessageStream`].
//!
//! Two cursors bound the loaded window of the historical log: the head
//! cursor for older messages and the tail cursor for newer ones. Each
//! direction allows one fetch in flight; a second request for the same
//! direction joins the in-flight fetch and receives its result.
//!
//! Every reset bumps an epoch. A fetch records the epoch it started in,
//! and a result that resolves under a later epoch is dropped.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use chatline_proto::message::Message;
use chatline_proto::page::{Direction, Page, Position, StartingPoint};

use crate::backend::{BackendError, ChannelBackend};
use crate::bus::StreamEvent;

use super::pending::PendingTracker;
use super::store::MessageStore;
use super::{MessageStream, StreamState};

/// Result of a successful [`MessageStream::next`] or [`MessageStream::prev`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageOutcome {
    /// A page was fetched and merged; these are the page's messages.
    Applied(Vec<Message>),
    /// The direction already reached the end of the log; nothing was fetched.
    Exhausted,
    /// The fetch resolved after a reset and was discarded.
    Stale,
}

/// A page fetch that did not complete.
///
/// The cursor is left where it was, so calling again retries the same window.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// The backend call failed.
    #[error("{direction} page fetch failed: {source}")]
    Backend {
        /// Direction of the failed fetch.
        direction: Direction,
        /// What the backend reported.
        source: BackendError,
    },

    /// The fetch this request joined was dropped before it resolved.
    #[error("{0} page fetch was abandoned before completing")]
    Abandoned(Direction),
}

type Slot = Option<Result<PageOutcome, FetchError>>;

/// Bound of the loaded window in one direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    position: Position,
    exhausted: bool,
}

impl Cursor {
    const fn new(position: Position, exhausted: bool) -> Self {
        Self {
            position,
            exhausted,
        }
    }

    /// Where the next fetch in this direction starts.
    #[must_use]
    pub const fn position(&self) -> &Position {
        &self.position
    }

    /// Whether the log boundary was reached.
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Move past `page`; an empty or final page closes the cursor.
    fn advance(&mut self, direction: Direction, page: &Page) {
        let positions = page.messages.iter().map(Message::position);
        let edge = match direction {
            Direction::Previous => positions.min(),
            Direction::Next => positions.max(),
        };
        if let Some(edge) = edge {
            self.position = edge;
        }
        self.exhausted = page.messages.is_empty() || !page.has_more;
    }
}

struct InFlight {
    ticket: u64,
    outcome: watch::Receiver<Slot>,
}

/// Cursor and in-flight bookkeeping for both directions.
pub(super) struct Pagination {
    epoch: u64,
    head: Cursor,
    tail: Cursor,
    previous: Option<InFlight>,
    next: Option<InFlight>,
    next_ticket: u64,
}

enum Begin {
    Exhausted,
    Join(watch::Receiver<Slot>),
    Lead(Lead),
}

struct Lead {
    ticket: u64,
    epoch: u64,
    position: Position,
    outcome: watch::Sender<Slot>,
}

impl Pagination {
    /// Both directions closed until the first reset.
    pub(super) const fn new() -> Self {
        Self {
            epoch: 0,
            head: Cursor::new(Position::latest(), true),
            tail: Cursor::new(Position::latest(), true),
            previous: None,
            next: None,
            next_ticket: 0,
        }
    }

    pub(super) const fn epoch(&self) -> u64 {
        self.epoch
    }

    pub(super) const fn cursor(&self, direction: Direction) -> &Cursor {
        match direction {
            Direction::Previous => &self.head,
            Direction::Next => &self.tail,
        }
    }

    pub(super) const fn has_more(&self, direction: Direction) -> bool {
        !self.cursor(direction).exhausted
    }

    pub(super) const fn is_fetching(&self, direction: Direction) -> bool {
        match direction {
            Direction::Previous => self.previous.is_some(),
            Direction::Next => self.next.is_some(),
        }
    }

    const fn slot_mut(&mut self, direction: Direction) -> &mut Option<InFlight> {
        match direction {
            Direction::Previous => &mut self.previous,
            Direction::Next => &mut self.next,
        }
    }

    /// Re-anchor both cursors at `starting_point` and start a new epoch.
    fn reset(&mut self, starting_point: StartingPoint) -> u64 {
        self.epoch += 1;
        let position = starting_point.position();
        self.head = Cursor::new(position.clone(), false);
        self.tail = Cursor::new(position, starting_point == StartingPoint::Latest);
        self.previous = None;
        self.next = None;
        self.epoch
    }

    fn begin(&mut self, direction: Direction) -> Begin {
        if self.cursor(direction).exhausted {
            return Begin::Exhausted;
        }
        if let Some(in_flight) = self.slot_mut(direction) {
            return Begin::Join(in_flight.outcome.clone());
        }

        let (tx, rx) = watch::channel(None);
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        *self.slot_mut(direction) = Some(InFlight {
            ticket,
            outcome: rx,
        });
        Begin::Lead(Lead {
            ticket,
            epoch: self.epoch,
            position: self.cursor(direction).position.clone(),
            outcome: tx,
        })
    }

    /// Release the in-flight slot if it still belongs to `ticket`.
    fn finish(&mut self, direction: Direction, ticket: u64) {
        let slot = self.slot_mut(direction);
        if slot.as_ref().is_some_and(|in_flight| in_flight.ticket == ticket) {
            *slot = None;
        }
    }

    fn advance(&mut self, direction: Direction, page: &Page) {
        match direction {
            Direction::Previous => self.head.advance(direction, page),
            Direction::Next => self.tail.advance(direction, page),
        }
    }
}

/// Frees the in-flight slot if the leading fetch is dropped mid-await.
struct InFlightGuard<'a> {
    state: &'a Mutex<StreamState>,
    direction: Direction,
    ticket: u64,
    armed: bool,
}

impl InFlightGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            tracing::debug!(direction = %self.direction, "page fetch dropped while in flight");
            self.state
                .lock()
                .pagination
                .finish(self.direction, self.ticket);
        }
    }
}

async fn join_in_flight(
    direction: Direction,
    mut outcome: watch::Receiver<Slot>,
) -> Result<PageOutcome, FetchError> {
    let resolved = match outcome.wait_for(Option::is_some).await {
        Ok(slot) => slot.clone(),
        Err(_) => None,
    };
    resolved.unwrap_or(Err(FetchError::Abandoned(direction)))
}

impl<B: ChannelBackend> MessageStream<B> {
    /// Fetch the page after the tail cursor and merge it.
    ///
    /// Returns [`PageOutcome::Exhausted`] without a backend call when there
    /// is nothing newer. Joins a next-fetch that is already in flight.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] if the backend fails; the cursor is unchanged
    /// and nothing is retried automatically.
    pub async fn next(&self) -> Result<PageOutcome, FetchError> {
        self.fetch(Direction::Next).await
    }

    /// Fetch the page before the head cursor and merge it.
    ///
    /// # Errors
    ///
    /// See [`next`](Self::next).
    pub async fn prev(&self) -> Result<PageOutcome, FetchError> {
        self.fetch(Direction::Previous).await
    }

    /// Whether a fetch in `direction` is in flight.
    #[must_use]
    pub fn is_fetching(&self, direction: Direction) -> bool {
        self.state.lock().pagination.is_fetching(direction)
    }

    /// Discard the collection and pending operations, re-anchor both cursors
    /// at `starting_point`, and load the initial window around it.
    ///
    /// Any fetch, send or update still in flight from before the reset has
    /// its result discarded when it resolves.
    ///
    /// # Errors
    ///
    /// Returns the first [`FetchError`] of the initial fetches. Whatever
    /// loaded successfully stays in the collection.
    pub async fn reset_with_starting_point(
        &self,
        starting_point: StartingPoint,
    ) -> Result<(), FetchError> {
        let (epoch, cleared_count) = self.mutate(|state| {
            let epoch = state.pagination.reset(starting_point);
            state.store = MessageStore::new(Arc::clone(&self.comparator));
            state.pending = PendingTracker::new();
            let cleared_count = std::mem::take(&mut state.new_message_count) != 0;
            state.loading = true;
            (epoch, cleared_count)
        });
        tracing::info!(channel = %self.channel_id, ?starting_point, epoch, "stream reset");

        self.publish(StreamEvent::StreamReset { starting_point });
        if cleared_count {
            self.publish(StreamEvent::NewMessageCountChanged { count: 0 });
        }

        let (previous, next) = tokio::join!(
            self.fetch(Direction::Previous),
            self.fetch(Direction::Next)
        );

        self.mutate(|state| {
            if state.pagination.epoch() == epoch {
                state.loading = false;
            }
        });

        previous?;
        next?;
        Ok(())
    }

    async fn fetch(&self, direction: Direction) -> Result<PageOutcome, FetchError> {
        let begin = self.state.lock().pagination.begin(direction);
        match begin {
            Begin::Exhausted => Ok(PageOutcome::Exhausted),
            Begin::Join(outcome) => {
                tracing::debug!(%direction, "joining in-flight page fetch");
                join_in_flight(direction, outcome).await
            }
            Begin::Lead(lead) => self.lead_fetch(direction, lead).await,
        }
    }

    async fn lead_fetch(&self, direction: Direction, lead: Lead) -> Result<PageOutcome, FetchError> {
        let guard = InFlightGuard {
            state: &self.state,
            direction,
            ticket: lead.ticket,
            armed: true,
        };
        let result = self
            .backend
            .fetch_page(direction, &lead.position, self.page_size)
            .await;
        guard.disarm();

        let applied = self.mutate(|state| {
            state.pagination.finish(direction, lead.ticket);
            if state.pagination.epoch() != lead.epoch {
                return None;
            }
            Some(result.map(|page| {
                state.store.upsert_batch(page.messages.iter().cloned());
                state.pagination.advance(direction, &page);
                page.messages
            }))
        });

        let outcome = match applied {
            None => {
                self.note_stale("fetch_page");
                Ok(PageOutcome::Stale)
            }
            Some(Ok(messages)) => {
                tracing::debug!(%direction, count = messages.len(), "page merged");
                Ok(PageOutcome::Applied(messages))
            }
            Some(Err(source)) => {
                tracing::warn!(%direction, error = %source, "page fetch failed");
                Err(FetchError::Backend { direction, source })
            }
        };

        lead.outcome.send_replace(Some(outcome.clone()));
        outcome
    }
}
