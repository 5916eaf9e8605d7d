//! Look-aside cache for hot read paths.
//!
//! Two logical namespaces: `latest-version` (space + slug + channel) and
//! `version-list` (space + slug). Entries carry a TTL; every successful
//! create or delete touching an app invalidates both namespaces for that
//! app by key prefix. Misses fall through to the document store
//! transparently.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;

use crate::version::Channel;

/// Default entry lifetime.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

/// Entries kept per namespace before least-recently-used eviction.
const CAPACITY: usize = 256;

const LATEST_VERSION_NS: &str = "latest-version";
const VERSION_LIST_NS: &str = "version-list";

/// Key for the latest version of an app on a channel.
#[must_use]
pub fn latest_version_key(space: &str, slug: &str, channel: Channel) -> String {
    format!("{LATEST_VERSION_NS}:{space}/{slug}/{channel}")
}

/// Key for the channel-grouped version list of an app.
#[must_use]
pub fn version_list_key(space: &str, slug: &str) -> String {
    format!("{VERSION_LIST_NS}:{space}/{slug}")
}

/// Prefixes covering every cached entry of one app, for invalidation.
#[must_use]
pub fn app_key_prefixes(space: &str, slug: &str) -> [String; 2] {
    [
        format!("{LATEST_VERSION_NS}:{space}/{slug}"),
        format!("{VERSION_LIST_NS}:{space}/{slug}"),
    ]
}

/// Cache abstraction. A remote key/value store is one implementation;
/// [`MemoryCache`] is the in-process one.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Fetches a live entry.
    async fn get(&self, key: &str) -> Option<Bytes>;

    /// Stores an entry with the given lifetime.
    async fn put(&self, key: &str, value: Bytes, ttl: Duration);

    /// Drops every entry whose key starts with the prefix.
    async fn invalidate(&self, key_prefix: &str);
}

struct Entry {
    value: Bytes,
    expires_at: Instant,
    last_used: u64,
}

#[derive(Default)]
struct Shard {
    entries: HashMap<String, Entry>,
    tick: u64,
}

impl Shard {
    fn touch(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn evict_one(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(key, _)| key.clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }
}

/// In-process cache: per-namespace LRU of [`CAPACITY`] entries with TTL.
#[derive(Default)]
pub struct MemoryCache {
    shards: RwLock<HashMap<String, Shard>>,
}

impl MemoryCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn shard_name(key: &str) -> &str {
        key.split(':').next().unwrap_or(key)
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Option<Bytes> {
        let mut shards = self.shards.write().expect("cache lock poisoned");
        let shard = shards.get_mut(Self::shard_name(key))?;
        let tick = shard.touch();
        let now = Instant::now();
        if shard.entries.get(key).is_some_and(|e| e.expires_at <= now) {
            shard.entries.remove(key);
            return None;
        }
        let entry = shard.entries.get_mut(key)?;
        entry.last_used = tick;
        Some(entry.value.clone())
    }

    async fn put(&self, key: &str, value: Bytes, ttl: Duration) {
        let mut shards = self.shards.write().expect("cache lock poisoned");
        let shard = shards
            .entry(Self::shard_name(key).to_owned())
            .or_default();
        let tick = shard.touch();
        if shard.entries.len() >= CAPACITY && !shard.entries.contains_key(key) {
            shard.evict_one();
        }
        shard.entries.insert(
            key.to_owned(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
                last_used: tick,
            },
        );
    }

    async fn invalidate(&self, key_prefix: &str) {
        let mut shards = self.shards.write().expect("cache lock poisoned");
        if let Some(shard) = shards.get_mut(Self::shard_name(key_prefix)) {
            shard.entries.retain(|key, _| !key.starts_with(key_prefix));
        }
    }
}
