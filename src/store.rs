// =============================================================================
// Keyed Store -- typed persistence primitives over Redis
// =============================================================================
//
// Every piece of cross-replica state (event logs, dedupe markers, rate
// buckets, the AI single-flight lock, the latest envelope, the runtime
// config) goes through this trait. The production implementation wraps a
// `redis::aio::ConnectionManager`; tests run against the in-memory
// `MemoryStore` below.
//
// Key layout (namespace `tv:`):
//   tv:events:{symbol}      list of JSON events       TTL 24h
//   tv:dedupe:{event_id}    "1"                       TTL 600s
//   tv:rate:{symbol}:{b}    counter                   TTL 2 x window
//   tv:lock:ai:{symbol}     lock token                PX 60000
//   tv:latest:{symbol}      JSON envelope             TTL 48h
//   tv:config               JSON RuntimeConfig        no TTL
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::info;

pub const CONFIG_KEY: &str = "tv:config";

pub fn events_key(symbol: &str) -> String {
    format!("tv:events:{symbol}")
}

pub fn dedupe_key(event_id: &str) -> String {
    format!("tv:dedupe:{event_id}")
}

pub fn rate_key(symbol: &str, bucket: i64) -> String {
    format!("tv:rate:{symbol}:{bucket}")
}

pub fn ai_lock_key(symbol: &str) -> String {
    format!("tv:lock:ai:{symbol}")
}

pub fn latest_key(symbol: &str) -> String {
    format!("tv:latest:{symbol}")
}

// =============================================================================
// Trait
// =============================================================================

/// Async key/value + list primitives required by the ingestion pipeline.
///
/// `set_nx_*` and `compare_and_delete` MUST be atomic against the backing
/// store; dedupe and the AI single-flight lock depend on it.
#[async_trait]
pub trait KeyedStore: Send + Sync {
    async fn ping(&self) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()>;
    /// Set only if absent, with a TTL in seconds. Returns `true` when the
    /// value was written (the key did not exist).
    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool>;
    /// Set only if absent, with a TTL in milliseconds.
    async fn set_nx_px(&self, key: &str, value: &str, ttl_ms: u64) -> Result<bool>;

    async fn incr(&self, key: &str) -> Result<i64>;
    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<()>;
    async fn del(&self, key: &str) -> Result<()>;
    /// Delete the key only if its current value equals `expected`. Returns
    /// `true` when a deletion happened.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool>;

    async fn rpush(&self, key: &str, value: &str) -> Result<i64>;
    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<()>;
    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>>;
    async fn llen(&self, key: &str) -> Result<i64>;
    /// Remove occurrences of `value` from the list. `count` follows LREM
    /// semantics (0 removes all occurrences).
    async fn lrem(&self, key: &str, count: isize, value: &str) -> Result<i64>;

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>>;
}

// =============================================================================
// Redis implementation
// =============================================================================

/// Compare-and-delete executed server-side so that a lock holder can never
/// delete a key it no longer owns.
const COMPARE_AND_DELETE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Open a managed connection to the Redis instance at `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .with_context(|| format!("invalid redis url: {url}"))?;
        let conn = ConnectionManager::new(client)
            .await
            .context("failed to connect to redis")?;
        // Keep credentials out of the log line.
        let visible = url.rsplit('@').next().unwrap_or(url);
        info!(url = %visible, "redis connected");
        Ok(Self { conn })
    }
}

#[async_trait]
impl KeyedStore for RedisStore {
    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let val: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(val)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool> {
        let mut conn = self.conn.clone();
        let set: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await?;
        Ok(set.is_some())
    }

    async fn set_nx_px(&self, key: &str, value: &str, ttl_ms: u64) -> Result<bool> {
        let mut conn = self.conn.clone();
        let set: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(set.is_some())
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        let count: i64 = redis::cmd("INCR").arg(key).query_async(&mut conn).await?;
        Ok(count)
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let script = redis::Script::new(COMPARE_AND_DELETE_SCRIPT);
        let deleted: i64 = script
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        let len: i64 = redis::cmd("RPUSH")
            .arg(key)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }

    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("LTRIM")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let items: Vec<String> = redis::cmd("LRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async(&mut conn)
            .await?;
        Ok(items)
    }

    async fn llen(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        let len: i64 = redis::cmd("LLEN").arg(key).query_async(&mut conn).await?;
        Ok(len)
    }

    async fn lrem(&self, key: &str, count: isize, value: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("LREM")
            .arg(key)
            .arg(count)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(removed)
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut out = Vec::new();
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;
            out.extend(keys);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(out)
    }
}

// =============================================================================
// In-memory implementation (test support)
// =============================================================================

/// In-memory store with the same atomicity guarantees as the Redis
/// implementation (everything runs under one mutex). TTLs are recorded but
/// not enforced; tests assert on them directly where relevant.
#[cfg(test)]
pub struct MemoryStore {
    inner: parking_lot::Mutex<MemoryInner>,
}

#[cfg(test)]
#[derive(Default)]
struct MemoryInner {
    strings: std::collections::HashMap<String, String>,
    lists: std::collections::HashMap<String, Vec<String>>,
    ttls: std::collections::HashMap<String, u64>,
}

#[cfg(test)]
impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: parking_lot::Mutex::new(MemoryInner::default()),
        }
    }

    pub fn ttl_secs(&self, key: &str) -> Option<u64> {
        self.inner.lock().ttls.get(key).copied()
    }

    /// Resolve LRANGE/LTRIM style indexes against a list of `len` items.
    fn resolve_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
        let len = len as isize;
        let mut s = if start < 0 { len + start } else { start };
        let mut e = if stop < 0 { len + stop } else { stop };
        if s < 0 {
            s = 0;
        }
        if e >= len {
            e = len - 1;
        }
        if s > e || len == 0 {
            return None;
        }
        Some((s as usize, e as usize))
    }

    fn glob_match(pattern: &str, key: &str) -> bool {
        // Only '*' wildcards, which is all the rate-bucket scan needs.
        let parts: Vec<&str> = pattern.split('*').collect();
        let mut rest = key;
        for (i, part) in parts.iter().enumerate() {
            if part.is_empty() {
                continue;
            }
            if i == 0 {
                match rest.strip_prefix(part) {
                    Some(r) => rest = r,
                    None => return false,
                }
            } else if i == parts.len() - 1 && !pattern.ends_with('*') {
                match rest.strip_suffix(part) {
                    Some(r) => rest = r,
                    None => return false,
                }
            } else {
                match rest.find(part) {
                    Some(idx) => rest = &rest[idx + part.len()..],
                    None => return false,
                }
            }
        }
        true
    }
}

#[cfg(test)]
#[async_trait]
impl KeyedStore for MemoryStore {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.inner.lock().strings.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.inner.lock().strings.insert(key.into(), value.into());
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.strings.insert(key.into(), value.into());
        inner.ttls.insert(key.into(), ttl_secs);
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool> {
        let mut inner = self.inner.lock();
        if inner.strings.contains_key(key) {
            return Ok(false);
        }
        inner.strings.insert(key.into(), value.into());
        inner.ttls.insert(key.into(), ttl_secs);
        Ok(true)
    }

    async fn set_nx_px(&self, key: &str, value: &str, ttl_ms: u64) -> Result<bool> {
        self.set_nx_ex(key, value, ttl_ms / 1000).await
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut inner = self.inner.lock();
        let next = inner
            .strings
            .get(key)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0)
            + 1;
        inner.strings.insert(key.into(), next.to_string());
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<()> {
        self.inner.lock().ttls.insert(key.into(), ttl_secs);
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.strings.remove(key);
        inner.lists.remove(key);
        Ok(())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        let mut inner = self.inner.lock();
        if inner.strings.get(key).map(String::as_str) == Some(expected) {
            inner.strings.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<i64> {
        let mut inner = self.inner.lock();
        let list = inner.lists.entry(key.into()).or_default();
        list.push(value.into());
        Ok(list.len() as i64)
    }

    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(list) = inner.lists.get_mut(key) {
            match Self::resolve_range(list.len(), start, stop) {
                Some((s, e)) => *list = list[s..=e].to_vec(),
                None => list.clear(),
            }
        }
        Ok(())
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let inner = self.inner.lock();
        Ok(match inner.lists.get(key) {
            Some(list) => match Self::resolve_range(list.len(), start, stop) {
                Some((s, e)) => list[s..=e].to_vec(),
                None => Vec::new(),
            },
            None => Vec::new(),
        })
    }

    async fn llen(&self, key: &str) -> Result<i64> {
        Ok(self.inner.lock().lists.get(key).map_or(0, |l| l.len() as i64))
    }

    async fn lrem(&self, key: &str, count: isize, value: &str) -> Result<i64> {
        let mut inner = self.inner.lock();
        let Some(list) = inner.lists.get_mut(key) else {
            return Ok(0);
        };
        let before = list.len();
        if count == 0 {
            list.retain(|v| v != value);
        } else {
            // Head-first removal of up to `count` occurrences.
            let mut remaining = count.unsigned_abs();
            list.retain(|v| {
                if remaining > 0 && v == value {
                    remaining -= 1;
                    false
                } else {
                    true
                }
            });
        }
        Ok((before - list.len()) as i64)
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let inner = self.inner.lock();
        Ok(inner
            .strings
            .keys()
            .chain(inner.lists.keys())
            .filter(|k| Self::glob_match(pattern, k))
            .cloned()
            .collect())
    }
}

// =============================================================================
// Tests
// =============================================================================
