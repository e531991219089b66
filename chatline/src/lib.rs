//! `chatline` — message stream controller for chat views.
//!
//! Keeps one ordered, de-duplicated collection per conversation view and
//! feeds it from three sources: paginated history, a live-event push
//! channel, and the user's own optimistic sends and edits.
//!
//! - [`stream`] — the [`stream::MessageStream`] facade, store, pagination
//!   and pending-operation tracking
//! - [`bus`] — per-view event bus
//! - [`backend`] — history/send/update collaborator trait and an in-memory
//!   implementation
//! - [`config`] — layered configuration

pub mod backend;
pub mod bus;
pub mod config;
pub mod stream;
