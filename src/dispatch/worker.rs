//! Fetch workers, split across focused submodules:
//! - `shared`: state shared across workers (frontier, gates, pool, activity)
//! - `types`: per-attempt outcome types
//! - `process`: worker struct plus the run/dispatch loop
//! - `tests`: worker unit tests against a scripted transport

mod process;
mod shared;
mod types;


pub(crate) use process::Worker;
pub(crate) use shared::{WorkerShared, WorkerSharedParams};
pub use shared::{WorkerActivityGuard, WorkerActivityTracker};
pub use types::DispatchOutcome;
