//! Shared message model for the `chatline` stream controller.

pub mod live;
pub mod message;
pub mod page;
