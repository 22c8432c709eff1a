//! Pipeline counters.
//!
//! Cheap atomic counters shared across requests; the gateway exposes a
//! snapshot on `/metrics`. The cache-hit counter is the observable that
//! proves a repeated request never re-contacted the summarizer.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use serde::Serialize;

use shadowgate_protocol::CompressionStatus;

#[derive(Debug, Default)]
pub struct PipeMetrics {
    cache_hits: AtomicU64,
    compressions: AtomicU64,
    failures: AtomicU64,
    passthroughs: AtomicU64,
    expansions: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub cache_hits: u64,
    pub compressions: u64,
    pub failures: u64,
    pub passthroughs: u64,
    pub expansions: u64,
}

impl PipeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, status: CompressionStatus) {
        let counter = match status {
            CompressionStatus::Hit => &self.cache_hits,
            CompressionStatus::Compressed => &self.compressions,
            CompressionStatus::Miss => &self.failures,
            CompressionStatus::PassthroughSmall
            | CompressionStatus::PassthroughLarge
            | CompressionStatus::SkippedByToolName => &self.passthroughs,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_expansion(&self) {
        self.expansions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            compressions: self.compressions.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            passthroughs: self.passthroughs.load(Ordering::Relaxed),
            expansions: self.expansions.load(Ordering::Relaxed),
        }
    }
}
