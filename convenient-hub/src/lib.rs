//! Key-value hub client for hashwerk.
//!
//! The hub is the single coordination point of a hashwerk deployment: it
//! holds graph structure, artefact data, execution state, job queues and the
//! worker registry. This crate provides a small, backend-agnostic client
//! for it:
//!
//! - Plain keys, hashes, sets, sorted sets and lists
//! - `SETNX`-style locks and atomic counters
//! - Atomic command pipelines (MULTI/EXEC on Redis)
//! - Durable FIFO job queues with blocking pops
//! - A worker registry with heartbeats
//!
//! Two backends are provided: [`memory::MemoryHub`], an in-process store
//! used for tests and worker-less runs, and [`redis_hub::RedisHub`], a thin
//! wrapper over a Redis connection. Both are reachable through the [`Hub`]
//! enum, which is cheap to clone and safe to share across threads.
//!
//! # Example
//!
//! ```
//! use convenient_hub::Hub;
//!
//! let hub = Hub::memory();
//! hub.set("greeting", b"hello").unwrap();
//! assert_eq!(hub.get("greeting").unwrap(), Some(b"hello".to_vec()));
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod memory;
pub mod redis_hub;

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use memory::MemoryHub;
use redis_hub::RedisHub;

/// Error type for hub operations.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// Underlying Redis request failed.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// A key holds a value of a different type than the one requested.
    #[error("wrong value type at key {0}")]
    WrongType(String),

    /// The hub URL could not be understood.
    #[error("invalid hub url: {0}")]
    InvalidUrl(String),
}

/// Result type for hub operations.
pub type HubResult<T> = Result<T, HubError>;

/// A single write in an atomic pipeline.
///
/// Pipelines are executed as one transaction: on the Redis backend this is a
/// MULTI/EXEC block, on the memory backend the whole batch runs under one
/// lock acquisition.
#[derive(Debug, Clone)]
pub enum Cmd {
    /// Set a plain key.
    Set {
        /// Key to write.
        key: String,
        /// Value to store.
        value: Vec<u8>,
    },
    /// Set a plain key only if it does not exist.
    SetNx {
        /// Key to write.
        key: String,
        /// Value to store.
        value: Vec<u8>,
    },
    /// Delete a key of any type.
    Del {
        /// Key to remove.
        key: String,
    },
    /// Set one field of a hash.
    HSet {
        /// Hash key.
        key: String,
        /// Field name.
        field: String,
        /// Field value.
        value: Vec<u8>,
    },
    /// Set several fields of a hash at once.
    HSetMap {
        /// Hash key.
        key: String,
        /// Field name/value pairs.
        entries: Vec<(String, Vec<u8>)>,
    },
    /// Add a member to a set.
    SAdd {
        /// Set key.
        key: String,
        /// Member to add.
        member: String,
    },
    /// Add a member to a sorted set (score 0).
    ZAdd {
        /// Sorted set key.
        key: String,
        /// Member to add.
        member: String,
    },
    /// Append a block to a list.
    RPush {
        /// List key.
        key: String,
        /// Block to append.
        value: Vec<u8>,
    },
}

/// Identity and queue assignment of a worker process.
#[derive(Debug, Clone)]
pub struct WorkerInfo {
    /// Unique worker id.
    pub id: String,
    /// Queues the worker listens on, in polling order.
    pub queues: Vec<String>,
    /// OS process id on the worker host.
    pub pid: u32,
}

const QUEUE_PREFIX: &str = "queue";
const QUEUE_INDEX: &str = "queues.index";
const WORKER_PREFIX: &str = "workers";
const WORKER_INDEX: &str = "workers";

fn queue_key(name: &str) -> String {
    format!("{QUEUE_PREFIX}:{name}")
}

fn worker_key(id: &str) -> String {
    format!("{WORKER_PREFIX}:{id}")
}

/// A handle to the hub, over either backend.
///
/// Cloning a `Hub` yields a handle to the same underlying store.
#[derive(Debug, Clone)]
pub enum Hub {
    /// In-process backend.
    Memory(MemoryHub),
    /// Redis backend.
    Redis(RedisHub),
}

impl Hub {
    /// Create a fresh in-process hub.
    #[must_use]
    pub fn memory() -> Self {
        Hub::Memory(MemoryHub::new())
    }

    /// Connect to a Redis hub and check the connection with a PING.
    ///
    /// # Errors
    ///
    /// Returns `HubError::Redis` if the URL is rejected or the server does
    /// not answer.
    pub fn redis(url: &str) -> HubResult<Self> {
        Ok(Hub::Redis(RedisHub::connect(url)?))
    }

    /// Open a hub from a URL.
    ///
    /// `redis://…` connects to Redis; `memory://` creates a fresh
    /// in-process hub.
    ///
    /// # Errors
    ///
    /// Returns `HubError::InvalidUrl` for unknown schemes.
    pub fn from_url(url: &str) -> HubResult<Self> {
        if url.starts_with("redis://") || url.starts_with("rediss://") {
            Self::redis(url)
        } else if url.starts_with("memory://") {
            Ok(Self::memory())
        } else {
            Err(HubError::InvalidUrl(url.to_string()))
        }
    }

    // ------------------------------------------------------------------
    // Plain keys

    /// Read a plain key.
    ///
    /// # Errors
    ///
    /// Returns an error on backend failure or type mismatch.
    pub fn get(&self, key: &str) -> HubResult<Option<Vec<u8>>> {
        match self {
            Hub::Memory(m) => m.get(key),
            Hub::Redis(r) => r.get(key),
        }
    }

    /// Write a plain key.
    ///
    /// # Errors
    ///
    /// Returns an error on backend failure.
    pub fn set(&self, key: &str, value: &[u8]) -> HubResult<()> {
        match self {
            Hub::Memory(m) => m.set(key, value),
            Hub::Redis(r) => r.set(key, value),
        }
    }

    /// Write a plain key only if absent. Returns `true` when the write won.
    ///
    /// # Errors
    ///
    /// Returns an error on backend failure.
    pub fn set_nx(&self, key: &str, value: &[u8]) -> HubResult<bool> {
        match self {
            Hub::Memory(m) => m.set_nx(key, value),
            Hub::Redis(r) => r.set_nx(key, value),
        }
    }

    /// Delete a key of any type.
    ///
    /// # Errors
    ///
    /// Returns an error on backend failure.
    pub fn del(&self, key: &str) -> HubResult<()> {
        match self {
            Hub::Memory(m) => m.del(key),
            Hub::Redis(r) => r.del(key),
        }
    }

    /// Check whether a key exists (any type).
    ///
    /// # Errors
    ///
    /// Returns an error on backend failure.
    pub fn exists(&self, key: &str) -> HubResult<bool> {
        match self {
            Hub::Memory(m) => m.exists(key),
            Hub::Redis(r) => r.exists(key),
        }
    }

    /// List keys matching a glob pattern.
    ///
    /// # Errors
    ///
    /// Returns an error on backend failure.
    pub fn keys(&self, pattern: &str) -> HubResult<Vec<String>> {
        match self {
            Hub::Memory(m) => m.keys(pattern),
            Hub::Redis(r) => r.keys(pattern),
        }
    }

    // ------------------------------------------------------------------
    // Hashes

    /// Set one field of a hash.
    ///
    /// # Errors
    ///
    /// Returns an error on backend failure or type mismatch.
    pub fn hset(&self, key: &str, field: &str, value: &[u8]) -> HubResult<()> {
        match self {
            Hub::Memory(m) => m.hset(key, field, value),
            Hub::Redis(r) => r.hset(key, field, value),
        }
    }

    /// Set several fields of a hash at once.
    ///
    /// # Errors
    ///
    /// Returns an error on backend failure or type mismatch.
    pub fn hset_map(&self, key: &str, entries: &[(String, Vec<u8>)]) -> HubResult<()> {
        match self {
            Hub::Memory(m) => m.hset_map(key, entries),
            Hub::Redis(r) => r.hset_map(key, entries),
        }
    }

    /// Read one field of a hash.
    ///
    /// # Errors
    ///
    /// Returns an error on backend failure or type mismatch.
    pub fn hget(&self, key: &str, field: &str) -> HubResult<Option<Vec<u8>>> {
        match self {
            Hub::Memory(m) => m.hget(key, field),
            Hub::Redis(r) => r.hget(key, field),
        }
    }

    /// Read all fields of a hash. Missing keys yield an empty map.
    ///
    /// # Errors
    ///
    /// Returns an error on backend failure or type mismatch.
    pub fn hgetall(&self, key: &str) -> HubResult<BTreeMap<String, Vec<u8>>> {
        match self {
            Hub::Memory(m) => m.hgetall(key),
            Hub::Redis(r) => r.hgetall(key),
        }
    }

    /// Delete one field of a hash.
    ///
    /// # Errors
    ///
    /// Returns an error on backend failure or type mismatch.
    pub fn hdel(&self, key: &str, field: &str) -> HubResult<()> {
        match self {
            Hub::Memory(m) => m.hdel(key, field),
            Hub::Redis(r) => r.hdel(key, field),
        }
    }

    /// Atomically add `delta` to an integer hash field and return the new
    /// value. Missing fields count as zero.
    ///
    /// # Errors
    ///
    /// Returns an error on backend failure or if the field is not an
    /// integer.
    pub fn hincr_by(&self, key: &str, field: &str, delta: i64) -> HubResult<i64> {
        match self {
            Hub::Memory(m) => m.hincr_by(key, field, delta),
            Hub::Redis(r) => r.hincr_by(key, field, delta),
        }
    }

    // ------------------------------------------------------------------
    // Sets

    /// Add a member to a set. Returns `true` when the member is new.
    ///
    /// # Errors
    ///
    /// Returns an error on backend failure or type mismatch.
    pub fn sadd(&self, key: &str, member: &str) -> HubResult<bool> {
        match self {
            Hub::Memory(m) => m.sadd(key, member),
            Hub::Redis(r) => r.sadd(key, member),
        }
    }

    /// Remove a member from a set.
    ///
    /// # Errors
    ///
    /// Returns an error on backend failure or type mismatch.
    pub fn srem(&self, key: &str, member: &str) -> HubResult<()> {
        match self {
            Hub::Memory(m) => m.srem(key, member),
            Hub::Redis(r) => r.srem(key, member),
        }
    }

    /// Read all members of a set. Missing keys yield an empty set.
    ///
    /// # Errors
    ///
    /// Returns an error on backend failure or type mismatch.
    pub fn smembers(&self, key: &str) -> HubResult<BTreeSet<String>> {
        match self {
            Hub::Memory(m) => m.smembers(key),
            Hub::Redis(r) => r.smembers(key),
        }
    }

    /// Intersect two sets.
    ///
    /// # Errors
    ///
    /// Returns an error on backend failure or type mismatch.
    pub fn sinter(&self, key1: &str, key2: &str) -> HubResult<BTreeSet<String>> {
        match self {
            Hub::Memory(m) => m.sinter(key1, key2),
            Hub::Redis(r) => r.sinter(key1, key2),
        }
    }

    /// Count members of a set.
    ///
    /// # Errors
    ///
    /// Returns an error on backend failure or type mismatch.
    pub fn scard(&self, key: &str) -> HubResult<u64> {
        match self {
            Hub::Memory(m) => m.scard(key),
            Hub::Redis(r) => r.scard(key),
        }
    }

    // ------------------------------------------------------------------
    // Sorted sets

    /// Add a member to a sorted set with score 0.
    ///
    /// # Errors
    ///
    /// Returns an error on backend failure or type mismatch.
    pub fn zadd(&self, key: &str, member: &str) -> HubResult<()> {
        match self {
            Hub::Memory(m) => m.zadd(key, member),
            Hub::Redis(r) => r.zadd(key, member),
        }
    }

    /// Lexicographic range scan: all members `>= lower`, in order.
    ///
    /// # Errors
    ///
    /// Returns an error on backend failure or type mismatch.
    pub fn zrange_from(&self, key: &str, lower: &str) -> HubResult<Vec<String>> {
        match self {
            Hub::Memory(m) => m.zrange_from(key, lower),
            Hub::Redis(r) => r.zrange_from(key, lower),
        }
    }

    // ------------------------------------------------------------------
    // Lists

    /// Append a block to a list.
    ///
    /// # Errors
    ///
    /// Returns an error on backend failure or type mismatch.
    pub fn rpush(&self, key: &str, value: &[u8]) -> HubResult<()> {
        match self {
            Hub::Memory(m) => m.rpush(key, value),
            Hub::Redis(r) => r.rpush(key, value),
        }
    }

    /// Read a whole list in push order. Missing keys yield an empty list.
    ///
    /// # Errors
    ///
    /// Returns an error on backend failure or type mismatch.
    pub fn lrange(&self, key: &str) -> HubResult<Vec<Vec<u8>>> {
        match self {
            Hub::Memory(m) => m.lrange(key),
            Hub::Redis(r) => r.lrange(key),
        }
    }

    /// Length of a list.
    ///
    /// # Errors
    ///
    /// Returns an error on backend failure or type mismatch.
    pub fn llen(&self, key: &str) -> HubResult<u64> {
        match self {
            Hub::Memory(m) => m.llen(key),
            Hub::Redis(r) => r.llen(key),
        }
    }

    // ------------------------------------------------------------------
    // Pipelines

    /// Execute a batch of writes as one atomic transaction.
    ///
    /// # Errors
    ///
    /// Returns an error on backend failure; on error no partial state is
    /// guaranteed to be visible on the Redis backend.
    pub fn pipeline(&self, cmds: Vec<Cmd>) -> HubResult<()> {
        match self {
            Hub::Memory(m) => m.pipeline(cmds),
            Hub::Redis(r) => r.pipeline(cmds),
        }
    }

    // ------------------------------------------------------------------
    // Job queues

    /// Append a job payload to a named queue.
    ///
    /// # Errors
    ///
    /// Returns an error on backend failure.
    pub fn queue_push(&self, queue: &str, payload: &[u8]) -> HubResult<()> {
        self.sadd(QUEUE_INDEX, queue)?;
        self.rpush(&queue_key(queue), payload)
    }

    /// Pop the oldest job from the first non-empty queue, blocking up to
    /// `timeout`. Returns the queue name and the payload.
    ///
    /// # Errors
    ///
    /// Returns an error on backend failure.
    pub fn queue_pop(
        &self,
        queues: &[String],
        timeout: Duration,
    ) -> HubResult<Option<(String, Vec<u8>)>> {
        let keys: Vec<String> = queues.iter().map(|q| queue_key(q)).collect();
        let popped = match self {
            Hub::Memory(m) => m.list_pop_front(&keys, timeout)?,
            Hub::Redis(r) => r.list_pop_front(&keys, timeout)?,
        };
        Ok(popped.map(|(key, payload)| {
            let name = key
                .strip_prefix(&format!("{QUEUE_PREFIX}:"))
                .unwrap_or(&key)
                .to_string();
            (name, payload)
        }))
    }

    /// Number of jobs waiting on a queue.
    ///
    /// # Errors
    ///
    /// Returns an error on backend failure.
    pub fn queue_len(&self, queue: &str) -> HubResult<u64> {
        self.llen(&queue_key(queue))
    }

    /// All queue names that have ever been pushed to.
    ///
    /// # Errors
    ///
    /// Returns an error on backend failure.
    pub fn queue_names(&self) -> HubResult<BTreeSet<String>> {
        self.smembers(QUEUE_INDEX)
    }

    /// Drop a queue and all jobs on it.
    ///
    /// # Errors
    ///
    /// Returns an error on backend failure.
    pub fn queue_drop(&self, queue: &str) -> HubResult<()> {
        self.del(&queue_key(queue))?;
        self.srem(QUEUE_INDEX, queue)
    }

    // ------------------------------------------------------------------
    // Worker registry

    /// Register a worker and write its first heartbeat.
    ///
    /// # Errors
    ///
    /// Returns an error on backend failure.
    pub fn worker_register(&self, info: &WorkerInfo) -> HubResult<()> {
        let now = chrono::Utc::now().to_rfc3339();
        self.sadd(WORKER_INDEX, &info.id)?;
        self.hset_map(
            &worker_key(&info.id),
            &[
                ("queues".to_string(), info.queues.join(",").into_bytes()),
                ("pid".to_string(), info.pid.to_string().into_bytes()),
                ("started".to_string(), now.clone().into_bytes()),
                ("beat".to_string(), now.into_bytes()),
            ],
        )
    }

    /// Refresh a worker's heartbeat timestamp.
    ///
    /// # Errors
    ///
    /// Returns an error on backend failure.
    pub fn worker_beat(&self, id: &str) -> HubResult<()> {
        let now = chrono::Utc::now().to_rfc3339();
        self.hset(&worker_key(id), "beat", now.as_bytes())
    }

    /// Record the op a worker is currently executing.
    ///
    /// # Errors
    ///
    /// Returns an error on backend failure.
    pub fn worker_set_job(&self, id: &str, op: &str) -> HubResult<()> {
        self.hset(&worker_key(id), "job", op.as_bytes())
    }

    /// Clear the worker's current op.
    ///
    /// # Errors
    ///
    /// Returns an error on backend failure.
    pub fn worker_clear_job(&self, id: &str) -> HubResult<()> {
        self.hdel(&worker_key(id), "job")
    }

    /// The op a worker is currently executing, if any.
    ///
    /// # Errors
    ///
    /// Returns an error on backend failure.
    pub fn worker_current_job(&self, id: &str) -> HubResult<Option<String>> {
        Ok(self
            .hget(&worker_key(id), "job")?
            .map(|v| String::from_utf8_lossy(&v).into_owned()))
    }

    /// Remove a worker from the registry.
    ///
    /// # Errors
    ///
    /// Returns an error on backend failure.
    pub fn worker_deregister(&self, id: &str) -> HubResult<()> {
        self.srem(WORKER_INDEX, id)?;
        self.del(&worker_key(id))
    }

    /// Ids of all registered workers.
    ///
    /// # Errors
    ///
    /// Returns an error on backend failure.
    pub fn workers(&self) -> HubResult<BTreeSet<String>> {
        self.smembers(WORKER_INDEX)
    }

    /// Whether a worker's heartbeat is older than `max_age`. Workers with
    /// no readable heartbeat count as stale.
    ///
    /// # Errors
    ///
    /// Returns an error on backend failure.
    pub fn worker_is_stale(&self, id: &str, max_age: Duration) -> HubResult<bool> {
        let Some(raw) = self.hget(&worker_key(id), "beat")? else {
            return Ok(true);
        };
        let Ok(beat) = chrono::DateTime::parse_from_rfc3339(&String::from_utf8_lossy(&raw))
        else {
            return Ok(true);
        };
        let age = chrono::Utc::now().signed_duration_since(beat);
        Ok(age.num_milliseconds() > max_age.as_millis() as i64)
    }

    /// Ask a worker to stop after its current job.
    ///
    /// # Errors
    ///
    /// Returns an error on backend failure.
    pub fn worker_request_shutdown(&self, id: &str) -> HubResult<()> {
        self.hset(&worker_key(id), "shutdown", b"1")
    }

    /// Whether a shutdown was requested for this worker.
    ///
    /// # Errors
    ///
    /// Returns an error on backend failure.
    pub fn worker_shutdown_requested(&self, id: &str) -> HubResult<bool> {
        Ok(self.hget(&worker_key(id), "shutdown")?.is_some())
    }

    /// Ask the backing server to shut down. A no-op on the memory backend.
    ///
    /// # Errors
    ///
    /// Returns an error on backend failure other than the connection
    /// dropping as part of the shutdown itself.
    pub fn server_shutdown(&self) -> HubResult<()> {
        match self {
            Hub::Memory(_) => Ok(()),
            Hub::Redis(r) => r.server_shutdown(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_url_roundtrip() {
        let hub = Hub::from_url("memory://").unwrap();
        hub.set("k", b"v").unwrap();
        assert_eq!(hub.get("k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn unknown_scheme_rejected() {
        assert!(matches!(
            Hub::from_url("bolt://localhost"),
            Err(HubError::InvalidUrl(_))
        ));
    }

    #[test]
    fn queue_fifo_order() {
        let hub = Hub::memory();
        hub.queue_push("default", b"a").unwrap();
        hub.queue_push("default", b"b").unwrap();
        let queues = vec!["default".to_string()];
        let (q, first) = hub
            .queue_pop(&queues, Duration::from_millis(10))
            .unwrap()
            .unwrap();
        assert_eq!(q, "default");
        assert_eq!(first, b"a");
        let (_, second) = hub
            .queue_pop(&queues, Duration::from_millis(10))
            .unwrap()
            .unwrap();
        assert_eq!(second, b"b");
        assert!(hub
            .queue_pop(&queues, Duration::from_millis(10))
            .unwrap()
            .is_none());
    }

    #[test]
    fn queue_pop_scans_in_order() {
        let hub = Hub::memory();
        hub.queue_push("slow", b"s").unwrap();
        hub.queue_push("fast", b"f").unwrap();
        let queues = vec!["fast".to_string(), "slow".to_string()];
        let (q, _) = hub
            .queue_pop(&queues, Duration::from_millis(10))
            .unwrap()
            .unwrap();
        assert_eq!(q, "fast");
    }

    #[test]
    fn worker_registry_lifecycle() {
        let hub = Hub::memory();
        let info = WorkerInfo {
            id: "w1".to_string(),
            queues: vec!["default".to_string()],
            pid: 42,
        };
        hub.worker_register(&info).unwrap();
        assert!(hub.workers().unwrap().contains("w1"));
        assert_eq!(hub.worker_current_job("w1").unwrap(), None);

        hub.worker_set_job("w1", "deadbeef").unwrap();
        assert_eq!(
            hub.worker_current_job("w1").unwrap(),
            Some("deadbeef".to_string())
        );
        hub.worker_clear_job("w1").unwrap();
        assert_eq!(hub.worker_current_job("w1").unwrap(), None);

        assert!(!hub.worker_shutdown_requested("w1").unwrap());
        hub.worker_request_shutdown("w1").unwrap();
        assert!(hub.worker_shutdown_requested("w1").unwrap());

        hub.worker_deregister("w1").unwrap();
        assert!(hub.workers().unwrap().is_empty());
    }
}
