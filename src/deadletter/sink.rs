//! Append-only dead-letter sink: unbounded counters plus a small ring buffer
//! of the latest entries for operator inspection. Process-scoped; nothing
//! survives a restart.

use super::entry::DeadLetterEntry;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

pub const DEFAULT_RECENT_CAPACITY: usize = 10;

#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterStats {
    pub total: u64,
    pub by_reason: BTreeMap<String, u64>,
    pub by_spider: BTreeMap<String, u64>,
    /// Oldest first.
    pub recent_items: Vec<DeadLetterEntry>,
}

#[derive(Debug, Default)]
struct SinkState {
    total: u64,
    by_reason: BTreeMap<String, u64>,
    by_spider: BTreeMap<String, u64>,
    recent: VecDeque<Arc<DeadLetterEntry>>,
}

#[derive(Debug)]
pub struct DeadLetterSink {
    capacity: usize,
    state: Mutex<SinkState>,
}

impl Default for DeadLetterSink {
    fn default() -> Self {
        Self::new(DEFAULT_RECENT_CAPACITY)
    }
}

impl DeadLetterSink {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            state: Mutex::new(SinkState {
                recent: VecDeque::with_capacity(capacity),
                ..SinkState::default()
            }),
        }
    }

    pub fn append(&self, entry: DeadLetterEntry) {
        tracing::warn!(
            url = entry.url(),
            spider = entry.spider(),
            reason = entry.reason(),
            attempts = entry.attempt_count(),
            "request dead-lettered"
        );

        let mut state = self.state.lock().expect("dead letter mutex poisoned");
        state.total = state.total.saturating_add(1);
        *state.by_reason.entry(entry.reason().to_owned()).or_default() += 1;
        *state.by_spider.entry(entry.spider().to_owned()).or_default() += 1;
        if state.recent.len() == self.capacity {
            state.recent.pop_front();
        }
        state.recent.push_back(Arc::new(entry));
    }

    pub fn total(&self) -> u64 {
        self.state.lock().expect("dead letter mutex poisoned").total
    }

    pub fn stats(&self) -> DeadLetterStats {
        let state = self.state.lock().expect("dead letter mutex poisoned");
        DeadLetterStats {
            total: state.total,
            by_reason: state.by_reason.clone(),
            by_spider: state.by_spider.clone(),
            recent_items: state
                .recent
                .iter()
                .map(|entry| entry.as_ref().clone())
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::CrawlRequest;
    use std::thread;

    fn entry(spider: &str, reason: &str, path: usize) -> DeadLetterEntry {
        let request = CrawlRequest::new(spider, format!("https://example.com/{path}"));
        DeadLetterEntry::new(&request, reason, reason)
    }

    #[test]
    fn counters_aggregate_by_reason_and_spider() {
        let sink = DeadLetterSink::default();
        sink.append(entry("rent", "HTTP 503", 1));
        sink.append(entry("rent", "HTTP 404", 2));
        sink.append(entry("sale", "HTTP 503", 3));

        let stats = sink.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_reason["HTTP 503"], 2);
        assert_eq!(stats.by_reason["HTTP 404"], 1);
        assert_eq!(stats.by_spider["rent"], 2);
        assert_eq!(stats.by_spider["sale"], 1);
        assert_eq!(stats.recent_items.len(), 3);
    }

    #[test]
    fn ring_buffer_keeps_latest_entries() {
        let sink = DeadLetterSink::new(3);
        for path in 0..7 {
            sink.append(entry("rent", "Timeout", path));
        }

        let stats = sink.stats();
        assert_eq!(stats.total, 7);
        let urls: Vec<&str> = stats.recent_items.iter().map(|e| e.url()).collect();
        assert_eq!(
            urls,
            vec![
                "https://example.com/4",
                "https://example.com/5",
                "https://example.com/6"
            ]
        );
    }

    #[test]
    fn concurrent_appends_are_not_lost() {
        let sink = Arc::new(DeadLetterSink::default());
        let threads: Vec<_> = (0..8)
            .map(|worker| {
                let sink = sink.clone();
                thread::spawn(move || {
                    for path in 0..250 {
                        sink.append(entry(&format!("spider-{}", worker % 2), "HTTP 500", path));
                    }
                })
            })
            .collect();
        for handle in threads {
            handle.join().unwrap();
        }

        let stats = sink.stats();
        assert_eq!(stats.total, 2_000);
        assert_eq!(stats.by_reason["HTTP 500"], 2_000);
        assert_eq!(stats.by_spider["spider-0"], 1_000);
        assert_eq!(stats.recent_items.len(), DEFAULT_RECENT_CAPACITY);
    }
}
