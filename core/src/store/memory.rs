//! In-memory shadow store.
//!
//! Three lock-guarded tables, one per value class, each entry carrying its
//! own expiry. Expiry checks happen under the lock; the sweeper takes the
//! write lock per table but never blocks correctness of concurrent readers
//! (a reader that loses the race simply observes a miss).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;

use tokio::time::Instant;

use super::ExpansionRecord;
use super::ShadowStore;

/// Default TTL for verbatim originals.
pub const DEFAULT_ORIGINAL_TTL: Duration = Duration::from_secs(300);

/// Default TTL for compressed summaries.
pub const DEFAULT_COMPRESSED_TTL: Duration = Duration::from_secs(86400);

struct Entry<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Entry<T> {
    fn live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

type Table<T> = RwLock<HashMap<String, Entry<T>>>;

fn table_get<T: Clone>(table: &Table<T>, id: &str) -> Option<T> {
    let now = Instant::now();
    let guard = table.read().unwrap_or_else(|poisoned| poisoned.into_inner());
    guard.get(id).filter(|entry| entry.live(now)).map(|entry| entry.value.clone())
}

fn table_set<T>(table: &Table<T>, id: &str, value: T, ttl: Duration) {
    let entry = Entry {
        value,
        expires_at: Instant::now() + ttl,
    };
    let mut guard = table.write().unwrap_or_else(|poisoned| poisoned.into_inner());
    guard.insert(id.to_string(), entry);
}

fn table_delete<T>(table: &Table<T>, id: &str) {
    let mut guard = table.write().unwrap_or_else(|poisoned| poisoned.into_inner());
    guard.remove(id);
}

fn table_sweep<T>(table: &Table<T>) -> usize {
    let now = Instant::now();
    let mut guard = table.write().unwrap_or_else(|poisoned| poisoned.into_inner());
    let before = guard.len();
    guard.retain(|_, entry| entry.live(now));
    before - guard.len()
}

/// Process-local [`ShadowStore`] with dual TTLs.
pub struct MemoryShadowStore {
    originals: Table<String>,
    compressed: Table<String>,
    expansions: Table<ExpansionRecord>,
    original_ttl: Duration,
    compressed_ttl: Duration,
}

impl MemoryShadowStore {
    pub fn new(original_ttl: Duration, compressed_ttl: Duration) -> Self {
        Self {
            originals: RwLock::new(HashMap::new()),
            compressed: RwLock::new(HashMap::new()),
            expansions: RwLock::new(HashMap::new()),
            original_ttl,
            compressed_ttl,
        }
    }

    /// Entry counts per table (originals, compressed, expansion records),
    /// including entries that have expired but not yet been swept.
    pub fn sizes(&self) -> (usize, usize, usize) {
        let originals = self.originals.read().unwrap_or_else(|p| p.into_inner()).len();
        let compressed = self.compressed.read().unwrap_or_else(|p| p.into_inner()).len();
        let expansions = self.expansions.read().unwrap_or_else(|p| p.into_inner()).len();
        (originals, compressed, expansions)
    }
}

impl Default for MemoryShadowStore {
    fn default() -> Self {
        Self::new(DEFAULT_ORIGINAL_TTL, DEFAULT_COMPRESSED_TTL)
    }
}

impl ShadowStore for MemoryShadowStore {
    fn set_original(&self, id: &str, content: String) {
        table_set(&self.originals, id, content, self.original_ttl);
    }

    fn get_original(&self, id: &str) -> Option<String> {
        table_get(&self.originals, id)
    }

    fn delete_original(&self, id: &str) {
        table_delete(&self.originals, id);
    }

    fn set_compressed(&self, id: &str, summary: String) {
        table_set(&self.compressed, id, summary, self.compressed_ttl);
    }

    fn get_compressed(&self, id: &str) -> Option<String> {
        table_get(&self.compressed, id)
    }

    fn delete_compressed(&self, id: &str) {
        table_delete(&self.compressed, id);
    }

    fn set_expansion_record(&self, id: &str, record: ExpansionRecord) {
        // Expansion records share the long TTL: they exist to rebuild
        // history for as long as identical summaries are being served.
        table_set(&self.expansions, id, record, self.compressed_ttl);
    }

    fn get_expansion_record(&self, id: &str) -> Option<ExpansionRecord> {
        table_get(&self.expansions, id)
    }

    fn delete_expansion_record(&self, id: &str) {
        table_delete(&self.expansions, id);
    }

    fn sweep(&self) {
        let originals = table_sweep(&self.originals);
        let compressed = table_sweep(&self.compressed);
        let expansions = table_sweep(&self.expansions);
        if originals + compressed + expansions > 0 {
            tracing::debug!(originals, compressed, expansions, "swept expired shadow entries");
        }
    }
}

/// Spawn the periodic sweep task for a store.
///
/// The handle is detached by callers that run for the process lifetime;
/// tests abort it.
pub fn spawn_sweeper(
    store: Arc<MemoryShadowStore>,
    period: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick fires immediately; skip it so the store is not swept
        // before anything is written.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            store.sweep();
        }
    })
}
