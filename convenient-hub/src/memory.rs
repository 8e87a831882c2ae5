//! In-process hub backend.
//!
//! Stores everything in a single mutex-guarded map, with the same typed-key
//! discipline as Redis: a key holds exactly one of string, hash, set,
//! sorted set or list, and accessing it as a different type is an error.
//! Used for tests and for worker-less single-process runs.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::{Cmd, HubError, HubResult};

/// Poll interval for blocking pops.
const POP_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
enum Entry {
    Str(Vec<u8>),
    Hash(BTreeMap<String, Vec<u8>>),
    Set(BTreeSet<String>),
    ZSet(BTreeSet<String>),
    List(VecDeque<Vec<u8>>),
}

/// An in-process hub. Cloning shares the underlying store.
#[derive(Clone, Default)]
pub struct MemoryHub {
    data: Arc<Mutex<HashMap<String, Entry>>>,
}

impl std::fmt::Debug for MemoryHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys = self.data.lock().expect("hub lock").len();
        write!(f, "MemoryHub({keys} keys)")
    }
}

fn glob_match(pattern: &str, candidate: &str) -> bool {
    // Supports only the '*' wildcard, which covers the patterns the engine
    // uses (owner-lock sweeps).
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == candidate;
    }
    let mut rest = candidate;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(pos) => rest = &rest[pos + part.len()..],
                None => return false,
            }
        }
    }
    // Pattern ends with '*'
    parts.last().map_or(true, |p| p.is_empty()) || rest.is_empty()
}

impl MemoryHub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(
        &self,
        f: impl FnOnce(&mut HashMap<String, Entry>) -> HubResult<T>,
    ) -> HubResult<T> {
        let mut guard = self.data.lock().expect("hub lock poisoned");
        f(&mut guard)
    }

    /// Read a plain key.
    ///
    /// # Errors
    ///
    /// Returns `HubError::WrongType` if the key holds a non-string value.
    pub fn get(&self, key: &str) -> HubResult<Option<Vec<u8>>> {
        self.with(|data| match data.get(key) {
            None => Ok(None),
            Some(Entry::Str(v)) => Ok(Some(v.clone())),
            Some(_) => Err(HubError::WrongType(key.to_string())),
        })
    }

    /// Write a plain key.
    ///
    /// # Errors
    ///
    /// Never fails on this backend.
    pub fn set(&self, key: &str, value: &[u8]) -> HubResult<()> {
        self.with(|data| {
            data.insert(key.to_string(), Entry::Str(value.to_vec()));
            Ok(())
        })
    }

    /// Write a plain key only if absent.
    ///
    /// # Errors
    ///
    /// Never fails on this backend.
    pub fn set_nx(&self, key: &str, value: &[u8]) -> HubResult<bool> {
        self.with(|data| {
            if data.contains_key(key) {
                Ok(false)
            } else {
                data.insert(key.to_string(), Entry::Str(value.to_vec()));
                Ok(true)
            }
        })
    }

    /// Delete a key of any type.
    ///
    /// # Errors
    ///
    /// Never fails on this backend.
    pub fn del(&self, key: &str) -> HubResult<()> {
        self.with(|data| {
            data.remove(key);
            Ok(())
        })
    }

    /// Check whether a key exists.
    ///
    /// # Errors
    ///
    /// Never fails on this backend.
    pub fn exists(&self, key: &str) -> HubResult<bool> {
        self.with(|data| Ok(data.contains_key(key)))
    }

    /// List keys matching a glob pattern (only `*` is supported).
    ///
    /// # Errors
    ///
    /// Never fails on this backend.
    pub fn keys(&self, pattern: &str) -> HubResult<Vec<String>> {
        self.with(|data| {
            Ok(data
                .keys()
                .filter(|k| glob_match(pattern, k))
                .cloned()
                .collect())
        })
    }

    fn hash_entry<'a>(
        data: &'a mut HashMap<String, Entry>,
        key: &str,
    ) -> HubResult<&'a mut BTreeMap<String, Vec<u8>>> {
        match data
            .entry(key.to_string())
            .or_insert_with(|| Entry::Hash(BTreeMap::new()))
        {
            Entry::Hash(h) => Ok(h),
            _ => Err(HubError::WrongType(key.to_string())),
        }
    }

    /// Set one field of a hash.
    ///
    /// # Errors
    ///
    /// Returns `HubError::WrongType` if the key holds a non-hash value.
    pub fn hset(&self, key: &str, field: &str, value: &[u8]) -> HubResult<()> {
        self.with(|data| {
            Self::hash_entry(data, key)?.insert(field.to_string(), value.to_vec());
            Ok(())
        })
    }

    /// Set several fields of a hash.
    ///
    /// # Errors
    ///
    /// Returns `HubError::WrongType` if the key holds a non-hash value.
    pub fn hset_map(&self, key: &str, entries: &[(String, Vec<u8>)]) -> HubResult<()> {
        self.with(|data| {
            let hash = Self::hash_entry(data, key)?;
            for (field, value) in entries {
                hash.insert(field.clone(), value.clone());
            }
            Ok(())
        })
    }

    /// Read one field of a hash.
    ///
    /// # Errors
    ///
    /// Returns `HubError::WrongType` if the key holds a non-hash value.
    pub fn hget(&self, key: &str, field: &str) -> HubResult<Option<Vec<u8>>> {
        self.with(|data| match data.get(key) {
            None => Ok(None),
            Some(Entry::Hash(h)) => Ok(h.get(field).cloned()),
            Some(_) => Err(HubError::WrongType(key.to_string())),
        })
    }

    /// Read all fields of a hash.
    ///
    /// # Errors
    ///
    /// Returns `HubError::WrongType` if the key holds a non-hash value.
    pub fn hgetall(&self, key: &str) -> HubResult<BTreeMap<String, Vec<u8>>> {
        self.with(|data| match data.get(key) {
            None => Ok(BTreeMap::new()),
            Some(Entry::Hash(h)) => Ok(h.clone()),
            Some(_) => Err(HubError::WrongType(key.to_string())),
        })
    }

    /// Delete one field of a hash.
    ///
    /// # Errors
    ///
    /// Returns `HubError::WrongType` if the key holds a non-hash value.
    pub fn hdel(&self, key: &str, field: &str) -> HubResult<()> {
        self.with(|data| match data.get_mut(key) {
            None => Ok(()),
            Some(Entry::Hash(h)) => {
                h.remove(field);
                Ok(())
            }
            Some(_) => Err(HubError::WrongType(key.to_string())),
        })
    }

    /// Atomically add to an integer hash field.
    ///
    /// # Errors
    ///
    /// Returns `HubError::WrongType` if the key holds a non-hash value or
    /// the field does not parse as an integer.
    pub fn hincr_by(&self, key: &str, field: &str, delta: i64) -> HubResult<i64> {
        self.with(|data| {
            let hash = Self::hash_entry(data, key)?;
            let current = match hash.get(field) {
                None => 0,
                Some(raw) => String::from_utf8_lossy(raw)
                    .parse::<i64>()
                    .map_err(|_| HubError::WrongType(format!("{key}:{field}")))?,
            };
            let next = current + delta;
            hash.insert(field.to_string(), next.to_string().into_bytes());
            Ok(next)
        })
    }

    fn set_entry<'a>(
        data: &'a mut HashMap<String, Entry>,
        key: &str,
    ) -> HubResult<&'a mut BTreeSet<String>> {
        match data
            .entry(key.to_string())
            .or_insert_with(|| Entry::Set(BTreeSet::new()))
        {
            Entry::Set(s) => Ok(s),
            _ => Err(HubError::WrongType(key.to_string())),
        }
    }

    /// Add a member to a set.
    ///
    /// # Errors
    ///
    /// Returns `HubError::WrongType` if the key holds a non-set value.
    pub fn sadd(&self, key: &str, member: &str) -> HubResult<bool> {
        self.with(|data| Ok(Self::set_entry(data, key)?.insert(member.to_string())))
    }

    /// Remove a member from a set.
    ///
    /// # Errors
    ///
    /// Returns `HubError::WrongType` if the key holds a non-set value.
    pub fn srem(&self, key: &str, member: &str) -> HubResult<()> {
        self.with(|data| match data.get_mut(key) {
            None => Ok(()),
            Some(Entry::Set(s)) => {
                s.remove(member);
                Ok(())
            }
            Some(_) => Err(HubError::WrongType(key.to_string())),
        })
    }

    /// All members of a set.
    ///
    /// # Errors
    ///
    /// Returns `HubError::WrongType` if the key holds a non-set value.
    pub fn smembers(&self, key: &str) -> HubResult<BTreeSet<String>> {
        self.with(|data| match data.get(key) {
            None => Ok(BTreeSet::new()),
            Some(Entry::Set(s)) => Ok(s.clone()),
            Some(_) => Err(HubError::WrongType(key.to_string())),
        })
    }

    /// Intersection of two sets.
    ///
    /// # Errors
    ///
    /// Returns `HubError::WrongType` if either key holds a non-set value.
    pub fn sinter(&self, key1: &str, key2: &str) -> HubResult<BTreeSet<String>> {
        let a = self.smembers(key1)?;
        let b = self.smembers(key2)?;
        Ok(a.intersection(&b).cloned().collect())
    }

    /// Cardinality of a set.
    ///
    /// # Errors
    ///
    /// Returns `HubError::WrongType` if the key holds a non-set value.
    pub fn scard(&self, key: &str) -> HubResult<u64> {
        Ok(self.smembers(key)?.len() as u64)
    }

    /// Add a member to a sorted set (score 0).
    ///
    /// # Errors
    ///
    /// Returns `HubError::WrongType` if the key holds a non-zset value.
    pub fn zadd(&self, key: &str, member: &str) -> HubResult<()> {
        self.with(|data| {
            match data
                .entry(key.to_string())
                .or_insert_with(|| Entry::ZSet(BTreeSet::new()))
            {
                Entry::ZSet(z) => {
                    z.insert(member.to_string());
                    Ok(())
                }
                _ => Err(HubError::WrongType(key.to_string())),
            }
        })
    }

    /// Lexicographic scan of a sorted set from `lower` upward.
    ///
    /// # Errors
    ///
    /// Returns `HubError::WrongType` if the key holds a non-zset value.
    pub fn zrange_from(&self, key: &str, lower: &str) -> HubResult<Vec<String>> {
        self.with(|data| match data.get(key) {
            None => Ok(Vec::new()),
            Some(Entry::ZSet(z)) => Ok(z.range(lower.to_string()..).cloned().collect()),
            Some(_) => Err(HubError::WrongType(key.to_string())),
        })
    }

    fn list_entry<'a>(
        data: &'a mut HashMap<String, Entry>,
        key: &str,
    ) -> HubResult<&'a mut VecDeque<Vec<u8>>> {
        match data
            .entry(key.to_string())
            .or_insert_with(|| Entry::List(VecDeque::new()))
        {
            Entry::List(l) => Ok(l),
            _ => Err(HubError::WrongType(key.to_string())),
        }
    }

    /// Append a block to a list.
    ///
    /// # Errors
    ///
    /// Returns `HubError::WrongType` if the key holds a non-list value.
    pub fn rpush(&self, key: &str, value: &[u8]) -> HubResult<()> {
        self.with(|data| {
            Self::list_entry(data, key)?.push_back(value.to_vec());
            Ok(())
        })
    }

    /// The whole list, in push order.
    ///
    /// # Errors
    ///
    /// Returns `HubError::WrongType` if the key holds a non-list value.
    pub fn lrange(&self, key: &str) -> HubResult<Vec<Vec<u8>>> {
        self.with(|data| match data.get(key) {
            None => Ok(Vec::new()),
            Some(Entry::List(l)) => Ok(l.iter().cloned().collect()),
            Some(_) => Err(HubError::WrongType(key.to_string())),
        })
    }

    /// Length of a list.
    ///
    /// # Errors
    ///
    /// Returns `HubError::WrongType` if the key holds a non-list value.
    pub fn llen(&self, key: &str) -> HubResult<u64> {
        self.with(|data| match data.get(key) {
            None => Ok(0),
            Some(Entry::List(l)) => Ok(l.len() as u64),
            Some(_) => Err(HubError::WrongType(key.to_string())),
        })
    }

    /// Pop the front of the first non-empty list among `keys`, waiting up
    /// to `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `HubError::WrongType` if a key holds a non-list value.
    pub fn list_pop_front(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> HubResult<Option<(String, Vec<u8>)>> {
        let deadline = Instant::now() + timeout;
        loop {
            let popped = self.with(|data| {
                for key in keys {
                    if let Some(Entry::List(l)) = data.get_mut(key.as_str()) {
                        if let Some(value) = l.pop_front() {
                            return Ok(Some((key.clone(), value)));
                        }
                    }
                }
                Ok(None)
            })?;
            if popped.is_some() || Instant::now() >= deadline {
                return Ok(popped);
            }
            std::thread::sleep(POP_POLL.min(deadline.saturating_duration_since(Instant::now())));
        }
    }

    /// Execute a batch of writes under a single lock acquisition.
    ///
    /// # Errors
    ///
    /// Returns `HubError::WrongType` on the first type mismatch; earlier
    /// commands in the batch will have been applied.
    pub fn pipeline(&self, cmds: Vec<Cmd>) -> HubResult<()> {
        self.with(|data| {
            for cmd in cmds {
                match cmd {
                    Cmd::Set { key, value } => {
                        data.insert(key, Entry::Str(value));
                    }
                    Cmd::SetNx { key, value } => {
                        data.entry(key).or_insert(Entry::Str(value));
                    }
                    Cmd::Del { key } => {
                        data.remove(&key);
                    }
                    Cmd::HSet { key, field, value } => {
                        Self::hash_entry(data, &key)?.insert(field, value);
                    }
                    Cmd::HSetMap { key, entries } => {
                        let hash = Self::hash_entry(data, &key)?;
                        for (field, value) in entries {
                            hash.insert(field, value);
                        }
                    }
                    Cmd::SAdd { key, member } => {
                        Self::set_entry(data, &key)?.insert(member);
                    }
                    Cmd::ZAdd { key, member } => {
                        match data.entry(key.clone()).or_insert_with(|| Entry::ZSet(BTreeSet::new()))
                        {
                            Entry::ZSet(z) => {
                                z.insert(member);
                            }
                            _ => return Err(HubError::WrongType(key)),
                        }
                    }
                    Cmd::RPush { key, value } => {
                        Self::list_entry(data, &key)?.push_back(value);
                    }
                }
            }
            Ok(())
        })
    }
}
