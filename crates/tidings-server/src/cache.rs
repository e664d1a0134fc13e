//! Rolling cache of the newest messages per conversation.
//!
//! An entry, when present, always holds the complete newest
//! `min(10, total)` messages of its conversation, newest first in the log's
//! `(created_at, id)` order. `push` only extends an entry that already
//! exists and slots the message into that order, so completion order of
//! concurrent sends never leaks into a window. Every key also carries a
//! version that `push` and `remove` bump; a cold read's `set` only lands if
//! the version it saw on the miss is still current. Readers go through
//! [`RecentWindows`], which bounds every call by a timeout and turns any
//! failure into a miss.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tokio::sync::RwLock;

use tidings_shared::constants::ROLLING_CACHE_CAP;
use tidings_shared::{ConversationKey, MessageView};

use crate::error::CacheError;

/// What a backend holds for one key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    /// `None` when there is no window (absent or expired).
    pub window: Option<Vec<MessageView>>,
    /// Zero for a key nothing has touched.
    pub version: u64,
}

#[async_trait]
pub trait RollingCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Snapshot, CacheError>;

    /// Replace the window with (at most the first ten of) `newest_first`,
    /// unless the key's version moved past `expected`. Returns whether the
    /// window was written.
    async fn set(
        &self,
        key: &str,
        newest_first: &[MessageView],
        ttl: Duration,
        expected: u64,
    ) -> Result<bool, CacheError>;

    /// Insert into an existing window in order, trim to ten and refresh the
    /// TTL. An id already present is left alone. Bumps the version either
    /// way; returns `false` when no window exists.
    async fn push(&self, key: &str, message: &MessageView, ttl: Duration)
        -> Result<bool, CacheError>;

    /// Drop the window and bump the version so in-flight fills are refused.
    async fn remove(&self, key: &str, ttl: Duration) -> Result<(), CacheError>;

    /// Drop expired entries. Returns how many were removed.
    async fn invalidate_expired(&self) -> Result<usize, CacheError>;
}

/// Slot `message` into a newest-first window, keeping at most the cap.
fn insert_ordered(items: &mut VecDeque<MessageView>, message: &MessageView) {
    if items.iter().any(|m| m.id == message.id) {
        return;
    }
    let at = items
        .iter()
        .position(|m| m.order_key() < message.order_key())
        .unwrap_or(items.len());
    items.insert(at, message.clone());
    items.truncate(ROLLING_CACHE_CAP);
}

// ---------------------------------------------------------------------------
// In-process backend
// ---------------------------------------------------------------------------

struct Entry {
    /// `None` marks a key that only carries a version.
    window: Option<VecDeque<MessageView>>,
    version: u64,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

#[derive(Default)]
struct Slots {
    entries: HashMap<String, Entry>,
    clock: u64,
}

impl Slots {
    fn live(&self, key: &str, now: Instant) -> Option<&Entry> {
        self.entries.get(key).filter(|e| e.is_live(now))
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

/// Single-process cache backend.
#[derive(Default)]
pub struct MemoryCache {
    slots: RwLock<Slots>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.slots.read().await.entries.len()
    }

    #[cfg(test)]
    pub async fn clear(&self) {
        self.slots.write().await.entries.clear();
    }
}

#[async_trait]
impl RollingCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Snapshot, CacheError> {
        let slots = self.slots.read().await;
        Ok(match slots.live(key, Instant::now()) {
            Some(entry) => Snapshot {
                window: entry.window.as_ref().map(|w| w.iter().cloned().collect()),
                version: entry.version,
            },
            None => Snapshot::default(),
        })
    }

    async fn set(
        &self,
        key: &str,
        newest_first: &[MessageView],
        ttl: Duration,
        expected: u64,
    ) -> Result<bool, CacheError> {
        let mut slots = self.slots.write().await;
        let now = Instant::now();
        let current = slots.live(key, now).map_or(0, |e| e.version);
        if current != expected {
            return Ok(false);
        }
        let entry = Entry {
            window: Some(newest_first.iter().take(ROLLING_CACHE_CAP).cloned().collect()),
            version: current,
            expires_at: now + ttl,
        };
        slots.entries.insert(key.to_string(), entry);
        Ok(true)
    }

    async fn push(
        &self,
        key: &str,
        message: &MessageView,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let mut slots = self.slots.write().await;
        let now = Instant::now();
        let version = slots.tick();
        let live = slots.live(key, now).is_some();
        let entry = slots.entries.entry(key.to_string()).or_insert(Entry {
            window: None,
            version,
            expires_at: now,
        });
        if !live {
            entry.window = None;
        }
        entry.version = version;
        entry.expires_at = now + ttl;
        match entry.window.as_mut() {
            Some(items) => {
                insert_ordered(items, message);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn remove(&self, key: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut slots = self.slots.write().await;
        let version = slots.tick();
        slots.entries.insert(
            key.to_string(),
            Entry {
                window: None,
                version,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn invalidate_expired(&self) -> Result<usize, CacheError> {
        let mut slots = self.slots.write().await;
        let now = Instant::now();
        let before = slots.entries.len();
        slots.entries.retain(|_, e| e.is_live(now));
        Ok(before - slots.entries.len())
    }
}

// ---------------------------------------------------------------------------
// Redis backend
// ---------------------------------------------------------------------------

/// KEYS: window, marker, version. ARGV: expected version, ttl, then
/// `score, member` pairs.
const SET_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[3]) or '0')
if current ~= tonumber(ARGV[1]) then
    return 0
end
redis.call('DEL', KEYS[1])
for i = 3, #ARGV, 2 do
    redis.call('ZADD', KEYS[1], ARGV[i], ARGV[i + 1])
end
if #ARGV > 2 then
    redis.call('EXPIRE', KEYS[1], ARGV[2])
end
redis.call('SET', KEYS[2], '1', 'EX', ARGV[2])
return 1
"#;

/// KEYS: window, marker, version. ARGV: score, member, id, cap, ttl.
/// Only touches the window when the liveness marker exists.
const PUSH_SCRIPT: &str = r#"
redis.call('INCR', KEYS[3])
redis.call('EXPIRE', KEYS[3], ARGV[5])
if redis.call('EXISTS', KEYS[2]) == 0 then
    return 0
end
local present = false
for _, member in ipairs(redis.call('ZRANGE', KEYS[1], 0, -1)) do
    if string.sub(member, 1, #ARGV[3]) == ARGV[3] then
        present = true
        break
    end
end
if not present then
    redis.call('ZADD', KEYS[1], ARGV[1], ARGV[2])
    redis.call('ZREMRANGEBYRANK', KEYS[1], 0, -(tonumber(ARGV[4]) + 1))
end
redis.call('EXPIRE', KEYS[1], ARGV[5])
redis.call('EXPIRE', KEYS[2], ARGV[5])
return 1
"#;

/// Cache shared across processes. Each conversation is a sorted set scored
/// by timestamp micros whose members are `<id>|<json>`, so equal timestamps
/// fall back to id order. A marker key tells an empty window from a miss and
/// a counter key carries the version.
pub struct RedisCache {
    conn: ConnectionManager,
    prefix: String,
    set_script: redis::Script,
    push_script: redis::Script,
}

impl RedisCache {
    pub async fn connect(client: redis::Client) -> Result<Self, CacheError> {
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            prefix: "tidings:recent:".to_string(),
            set_script: redis::Script::new(SET_SCRIPT),
            push_script: redis::Script::new(PUSH_SCRIPT),
        })
    }

    fn window_key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }

    fn marker_key(&self, key: &str) -> String {
        format!("{}{key}:live", self.prefix)
    }

    fn version_key(&self, key: &str) -> String {
        format!("{}{key}:ver", self.prefix)
    }
}

fn score(message: &MessageView) -> i64 {
    message.created_at.timestamp_micros()
}

fn member(message: &MessageView) -> Result<String, CacheError> {
    Ok(format!("{}|{}", message.id, serde_json::to_string(message)?))
}

fn decode_member(raw: &str) -> Result<MessageView, CacheError> {
    let json = raw
        .split_once('|')
        .map(|(_, json)| json)
        .ok_or_else(|| CacheError::Backend(format!("malformed window member: {raw}")))?;
    Ok(serde_json::from_str(json)?)
}

#[async_trait]
impl RollingCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Snapshot, CacheError> {
        let mut conn = self.conn.clone();
        let (present, raw, version): (bool, Vec<String>, Option<u64>) = redis::pipe()
            .atomic()
            .cmd("EXISTS")
            .arg(self.marker_key(key))
            .cmd("ZREVRANGE")
            .arg(self.window_key(key))
            .arg(0)
            .arg(ROLLING_CACHE_CAP as i64 - 1)
            .cmd("GET")
            .arg(self.version_key(key))
            .query_async(&mut conn)
            .await?;

        let window = if present {
            Some(
                raw.iter()
                    .map(String::as_str)
                    .map(decode_member)
                    .collect::<Result<Vec<_>, _>>()?,
            )
        } else {
            None
        };
        Ok(Snapshot {
            window,
            version: version.unwrap_or(0),
        })
    }

    async fn set(
        &self,
        key: &str,
        newest_first: &[MessageView],
        ttl: Duration,
        expected: u64,
    ) -> Result<bool, CacheError> {
        let mut invocation = self.set_script.prepare_invoke();
        invocation
            .key(self.window_key(key))
            .key(self.marker_key(key))
            .key(self.version_key(key))
            .arg(expected)
            .arg(ttl.as_secs().max(1));
        for message in newest_first.iter().take(ROLLING_CACHE_CAP) {
            invocation.arg(score(message)).arg(member(message)?);
        }

        let mut conn = self.conn.clone();
        let written: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(written == 1)
    }

    async fn push(
        &self,
        key: &str,
        message: &MessageView,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let pushed: i64 = self
            .push_script
            .key(self.window_key(key))
            .key(self.marker_key(key))
            .key(self.version_key(key))
            .arg(score(message))
            .arg(member(message)?)
            .arg(format!("{}|", message.id))
            .arg(ROLLING_CACHE_CAP)
            .arg(ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await?;
        Ok(pushed == 1)
    }

    async fn remove(&self, key: &str, ttl: Duration) -> Result<(), CacheError> {
        let version = self.version_key(key);
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("DEL")
            .arg(self.window_key(key))
            .arg(self.marker_key(key))
            .ignore()
            .cmd("INCR")
            .arg(&version)
            .ignore()
            .cmd("EXPIRE")
            .arg(&version)
            .arg(ttl.as_secs().max(1))
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn invalidate_expired(&self) -> Result<usize, CacheError> {
        // Redis expires every key itself.
        Ok(0)
    }
}

// ---------------------------------------------------------------------------
// Fail-open front
// ---------------------------------------------------------------------------

/// Outcome of a window lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Cached {
    Hit(Vec<MessageView>),
    /// No window; a [`RecentWindows::fill`] carrying this version lands only
    /// if no send touched the key in between.
    Miss(u64),
    /// The backend failed or timed out. Read the log and skip the fill.
    Unavailable,
}

/// What the rest of the server sees of the cache: keyed by conversation,
/// time-bounded, and never an error.
#[derive(Clone)]
pub struct RecentWindows {
    backend: Arc<dyn RollingCache>,
    ttl: Duration,
    timeout: Duration,
}

impl RecentWindows {
    pub fn new(backend: Arc<dyn RollingCache>, ttl: Duration, timeout: Duration) -> Self {
        Self {
            backend,
            ttl,
            timeout,
        }
    }

    pub async fn window(&self, key: &ConversationKey) -> Cached {
        let encoded = key.encode();
        match self.bounded(self.backend.get(&encoded)).await {
            Ok(Snapshot {
                window: Some(items),
                ..
            }) => Cached::Hit(items),
            Ok(Snapshot { version, .. }) => Cached::Miss(version),
            Err(e) => {
                tracing::warn!(key = %encoded, error = %e, "cache read failed, treating as miss");
                Cached::Unavailable
            }
        }
    }

    pub async fn fill(&self, key: &ConversationKey, version: u64, newest_first: &[MessageView]) {
        let encoded = key.encode();
        match self
            .bounded(self.backend.set(&encoded, newest_first, self.ttl, version))
            .await
        {
            Ok(true) => {}
            Ok(false) => tracing::debug!(key = %encoded, "cache fill superseded by a send"),
            Err(e) => tracing::warn!(key = %encoded, error = %e, "cache fill failed"),
        }
    }

    /// Extend the window of the conversation `message` belongs to. A failed
    /// push drops the window so the next read goes to the log.
    pub async fn record(&self, message: &MessageView) {
        let Some(key) = ConversationKey::of(message) else {
            return;
        };
        let encoded = key.encode();
        match self
            .bounded(self.backend.push(&encoded, message, self.ttl))
            .await
        {
            Ok(true) => tracing::trace!(key = %encoded, "cache window extended"),
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(key = %encoded, error = %e, "cache push failed, dropping window");
                if let Err(e) = self.bounded(self.backend.remove(&encoded, self.ttl)).await {
                    tracing::error!(key = %encoded, error = %e, "cache window could not be dropped");
                }
            }
        }
    }

    pub async fn sweep(&self) -> usize {
        match self.bounded(self.backend.invalidate_expired()).await {
            Ok(removed) => removed,
            Err(e) => {
                tracing::warn!(error = %e, "cache sweep failed");
                0
            }
        }
    }

    async fn bounded<T>(
        &self,
        call: impl std::future::Future<Output = Result<T, CacheError>>,
    ) -> Result<T, CacheError> {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| CacheError::Timeout(self.timeout))?
    }
}
