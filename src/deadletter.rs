//! Permanently abandoned requests and their aggregate counters.

pub mod entry;
pub mod sink;

pub use entry::{DeadLetterEntry, RequestSnapshot};
pub use sink::{DeadLetterSink, DeadLetterStats, DEFAULT_RECENT_CAPACITY};
