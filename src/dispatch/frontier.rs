//! Time-ordered frontier.
//!
//! Requests are keyed by `(eligible_at, sequence)`, so retries scheduled in
//! the future sit in the frontier without holding a worker. Workers block in
//! [`Frontier::pop_admissible`] until an eligible request passes their
//! admission check, a new request arrives, or shutdown fires.

use super::request::CrawlRequest;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::Notify;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

/// Verdict of an admission check on an eligible request.
pub(crate) enum Admission<T> {
    Admit(T),
    /// Not now. `Some(at)` asks to be re-checked at `at`; `None` waits for a wake-up.
    Defer(Option<Instant>),
}

#[derive(Default)]
struct FrontierState {
    entries: BTreeMap<(Instant, u64), CrawlRequest>,
    next_seq: u64,
}

#[derive(Default)]
pub struct Frontier {
    state: Mutex<FrontierState>,
    notify: Notify,
    outstanding: AtomicUsize,
}

impl Frontier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a brand-new logical request.
    pub fn submit(&self, request: CrawlRequest) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        self.push(request);
    }

    /// Puts an in-flight request back, keyed by its `eligible_at`.
    pub(crate) fn push(&self, request: CrawlRequest) {
        {
            let mut state = self.state.lock().expect("frontier mutex poisoned");
            let seq = state.next_seq;
            state.next_seq = state.next_seq.wrapping_add(1);
            state.entries.insert((request.eligible_at(), seq), request);
        }
        self.notify.notify_waiters();
    }

    /// Marks one logical request as terminal (delivered, dead-lettered, discarded).
    pub(crate) fn settle(&self) {
        let _ = self
            .outstanding
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    /// Wakes every waiter so it re-runs its admission check.
    pub(crate) fn wake(&self) {
        self.notify.notify_waiters();
    }

    /// Requests currently queued, including future retries.
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .expect("frontier mutex poisoned")
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Logical requests that have not reached a terminal outcome, queued or in flight.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    pub fn next_eligible_at(&self) -> Option<Instant> {
        self.state
            .lock()
            .expect("frontier mutex poisoned")
            .entries
            .keys()
            .next()
            .map(|(at, _)| *at)
    }

    /// Removes and returns every queued request in eligibility order.
    pub fn drain(&self) -> Vec<CrawlRequest> {
        let drained: Vec<CrawlRequest> = {
            let mut state = self.state.lock().expect("frontier mutex poisoned");
            std::mem::take(&mut state.entries).into_values().collect()
        };
        let count = drained.len();
        let _ = self
            .outstanding
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                Some(n.saturating_sub(count))
            });
        drained
    }

    /// Cancels `admission` under the frontier lock. A scan that admitted a
    /// request before this call has already run its `admit` side effects;
    /// every later scan observes the cancellation and admits nothing.
    pub(crate) fn close_admission(&self, admission: &CancellationToken) {
        let _state = self.state.lock().expect("frontier mutex poisoned");
        admission.cancel();
    }

    /// Waits for the first eligible request that `admit` accepts. Returns
    /// `None` once `shutdown` is cancelled.
    pub(crate) async fn pop_admissible<T, F>(
        &self,
        shutdown: &CancellationToken,
        mut admit: F,
    ) -> Option<(CrawlRequest, T)>
    where
        F: FnMut(&CrawlRequest) -> Admission<T>,
    {
        loop {
            if shutdown.is_cancelled() {
                return None;
            }

            let notified = self.notify.notified();
            let mut wake_at: Option<Instant> = None;
            {
                let mut state = self.state.lock().expect("frontier mutex poisoned");
                if shutdown.is_cancelled() {
                    return None;
                }
                let now = Instant::now();
                let mut admitted = None;

                for (key, request) in state.entries.iter() {
                    if key.0 > now {
                        wake_at = earliest(wake_at, Some(key.0));
                        break;
                    }
                    match admit(request) {
                        Admission::Admit(token) => {
                            admitted = Some((*key, token));
                            break;
                        }
                        Admission::Defer(at) => wake_at = earliest(wake_at, at),
                    }
                }

                if let Some((key, token)) = admitted {
                    if let Some(request) = state.entries.remove(&key) {
                        return Some((request, token));
                    }
                }
            }

            match wake_at {
                Some(at) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => return None,
                        _ = notified => {}
                        _ = time::sleep_until(at) => {}
                    }
                }
                None => {
                    tokio::select! {
                        _ = shutdown.cancelled() => return None,
                        _ = notified => {}
                    }
                }
            }
        }
    }
}

fn earliest(current: Option<Instant>, candidate: Option<Instant>) -> Option<Instant> {
    match (current, candidate) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}
