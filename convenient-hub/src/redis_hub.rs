//! Redis hub backend.
//!
//! A thin synchronous wrapper over one Redis connection. The connection is
//! mutex-guarded so a handle can be shared between threads, but workers are
//! expected to open one handle each: a blocking queue pop holds the
//! connection for its whole timeout.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use redis::Commands;
use tracing::debug;

use crate::{Cmd, HubResult};

/// A hub backed by a Redis server.
#[derive(Clone)]
pub struct RedisHub {
    url: String,
    conn: Arc<Mutex<redis::Connection>>,
}

impl std::fmt::Debug for RedisHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Strip credentials before display.
        let host = self.url.split('@').last().unwrap_or(&self.url);
        write!(f, "RedisHub({host})")
    }
}

impl RedisHub {
    /// Connect to a Redis server and verify the connection with a PING.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the server is unreachable.
    pub fn connect(url: &str) -> HubResult<Self> {
        let client = redis::Client::open(url)?;
        let mut conn = client.get_connection()?;
        let _: String = redis::cmd("PING").query(&mut conn)?;
        debug!("connected to {}", url.split('@').last().unwrap_or(url));
        Ok(Self {
            url: url.to_string(),
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn with<T>(&self, f: impl FnOnce(&mut redis::Connection) -> HubResult<T>) -> HubResult<T> {
        let mut guard = self.conn.lock().expect("redis connection lock poisoned");
        f(&mut guard)
    }

    pub(crate) fn get(&self, key: &str) -> HubResult<Option<Vec<u8>>> {
        self.with(|c| Ok(c.get(key)?))
    }

    pub(crate) fn set(&self, key: &str, value: &[u8]) -> HubResult<()> {
        self.with(|c| Ok(c.set(key, value)?))
    }

    pub(crate) fn set_nx(&self, key: &str, value: &[u8]) -> HubResult<bool> {
        self.with(|c| Ok(c.set_nx(key, value)?))
    }

    pub(crate) fn del(&self, key: &str) -> HubResult<()> {
        self.with(|c| Ok(c.del(key)?))
    }

    pub(crate) fn exists(&self, key: &str) -> HubResult<bool> {
        self.with(|c| Ok(c.exists(key)?))
    }

    pub(crate) fn keys(&self, pattern: &str) -> HubResult<Vec<String>> {
        self.with(|c| Ok(c.keys(pattern)?))
    }

    pub(crate) fn hset(&self, key: &str, field: &str, value: &[u8]) -> HubResult<()> {
        self.with(|c| Ok(c.hset(key, field, value)?))
    }

    pub(crate) fn hset_map(&self, key: &str, entries: &[(String, Vec<u8>)]) -> HubResult<()> {
        self.with(|c| Ok(c.hset_multiple(key, entries)?))
    }

    pub(crate) fn hget(&self, key: &str, field: &str) -> HubResult<Option<Vec<u8>>> {
        self.with(|c| Ok(c.hget(key, field)?))
    }

    pub(crate) fn hgetall(&self, key: &str) -> HubResult<BTreeMap<String, Vec<u8>>> {
        self.with(|c| Ok(c.hgetall(key)?))
    }

    pub(crate) fn hdel(&self, key: &str, field: &str) -> HubResult<()> {
        self.with(|c| Ok(c.hdel(key, field)?))
    }

    pub(crate) fn hincr_by(&self, key: &str, field: &str, delta: i64) -> HubResult<i64> {
        self.with(|c| Ok(c.hincr(key, field, delta)?))
    }

    pub(crate) fn sadd(&self, key: &str, member: &str) -> HubResult<bool> {
        self.with(|c| Ok(c.sadd(key, member)?))
    }

    pub(crate) fn srem(&self, key: &str, member: &str) -> HubResult<()> {
        self.with(|c| Ok(c.srem(key, member)?))
    }

    pub(crate) fn smembers(&self, key: &str) -> HubResult<BTreeSet<String>> {
        self.with(|c| Ok(c.smembers(key)?))
    }

    pub(crate) fn sinter(&self, key1: &str, key2: &str) -> HubResult<BTreeSet<String>> {
        self.with(|c| Ok(c.sinter((key1, key2))?))
    }

    pub(crate) fn scard(&self, key: &str) -> HubResult<u64> {
        self.with(|c| Ok(c.scard(key)?))
    }

    pub(crate) fn zadd(&self, key: &str, member: &str) -> HubResult<()> {
        self.with(|c| Ok(c.zadd(key, member, 0)?))
    }

    pub(crate) fn zrange_from(&self, key: &str, lower: &str) -> HubResult<Vec<String>> {
        let min = format!("[{lower}");
        self.with(|c| Ok(c.zrangebylex(key, min.as_str(), "+")?))
    }

    pub(crate) fn rpush(&self, key: &str, value: &[u8]) -> HubResult<()> {
        self.with(|c| Ok(c.rpush(key, value)?))
    }

    pub(crate) fn lrange(&self, key: &str) -> HubResult<Vec<Vec<u8>>> {
        self.with(|c| Ok(c.lrange(key, 0, -1)?))
    }

    pub(crate) fn llen(&self, key: &str) -> HubResult<u64> {
        self.with(|c| Ok(c.llen(key)?))
    }

    pub(crate) fn list_pop_front(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> HubResult<Option<(String, Vec<u8>)>> {
        // BLPOP granularity is whole seconds; round up so a sub-second
        // timeout still blocks.
        let secs = timeout.as_secs().max(1) as usize;
        self.with(|c| Ok(c.blpop(keys, secs)?))
    }

    pub(crate) fn pipeline(&self, cmds: Vec<Cmd>) -> HubResult<()> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        for cmd in cmds {
            match cmd {
                Cmd::Set { key, value } => {
                    pipe.set(key, value).ignore();
                }
                Cmd::SetNx { key, value } => {
                    pipe.set_nx(key, value).ignore();
                }
                Cmd::Del { key } => {
                    pipe.del(key).ignore();
                }
                Cmd::HSet { key, field, value } => {
                    pipe.hset(key, field, value).ignore();
                }
                Cmd::HSetMap { key, entries } => {
                    pipe.hset_multiple(key, &entries).ignore();
                }
                Cmd::SAdd { key, member } => {
                    pipe.sadd(key, member).ignore();
                }
                Cmd::ZAdd { key, member } => {
                    pipe.zadd(key, member, 0).ignore();
                }
                Cmd::RPush { key, value } => {
                    pipe.rpush(key, value).ignore();
                }
            }
        }
        self.with(|c| Ok(pipe.query(c)?))
    }

    pub(crate) fn server_shutdown(&self) -> HubResult<()> {
        // The server drops the connection while executing SHUTDOWN, which
        // surfaces as an I/O error on our side.
        let result = self.with(|c| Ok(redis::cmd("SHUTDOWN").query::<()>(c)));
        match result {
            Ok(Ok(())) | Ok(Err(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
