//! Egress identities: the pool with its health records, per-dispatch
//! fingerprint generation, and the background health monitor.

pub mod fingerprint;
pub mod health;
pub mod monitor;
pub mod pool;

pub use fingerprint::{Fingerprint, FingerprintGenerator, Viewport, FALLBACK_USER_AGENTS};
pub use health::{HealthState, IdentityHealth};
pub use monitor::{HealthMonitor, ProbeSummary};
pub use pool::{
    EgressIdentity, IdentityError, IdentityId, IdentityPool, IdentityPoolStats, IdentityStats,
};
