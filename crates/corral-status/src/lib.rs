//! corral-status — fan-out of container status changes.
//!
//! A [`StatusFanout`] multiplexes the store's per-key watch streams to
//! any number of in-process subscribers, one watch task per actively
//! subscribed container. Raw serialized container records are delivered
//! as they are committed; slow subscribers lose messages rather than
//! delaying the rest.

pub mod error;
pub mod fanout;

pub use error::{StatusError, StatusResult};
pub use fanout::{StatusFanout, Subscription};
