//! The dispatch loop: the time-ordered frontier, per-domain gates, fetch
//! workers, and the `Dispatcher` that owns their lifecycle.

pub mod dispatcher;
pub mod frontier;
mod lifecycle;
pub mod request;
pub mod throttle;
pub mod worker;
mod worker_pool;

pub use dispatcher::Dispatcher;
pub use frontier::Frontier;
pub use request::CrawlRequest;
pub use throttle::{DomainSnapshot, ThrottleSettings};
pub use worker::{DispatchOutcome, WorkerActivityTracker};
