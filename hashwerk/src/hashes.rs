//! Stable content hashing and the short-hash index.
//!
//! Every entity in the graph is identified by a 40-character SHA-1 hex
//! digest over a version-fixed byte string. Those byte strings are wire
//! format: changing them deprecates every stored database.

use convenient_hub::{Cmd, Hub};
use sha1::{Digest, Sha1};

use crate::constants::HASH_INDEX;
use crate::errors::{EngineError, Result};

/// Length of a full hex hash.
pub const HASH_LEN: usize = 40;

/// Length of a display short hash.
pub const SHORT: usize = 6;

/// A 40-hex content hash identifying one entity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentHash(String);

impl ContentHash {
    /// Wrap an existing hex digest.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::BadHash` unless `s` is exactly 40 lowercase
    /// hex characters.
    pub fn from_hex(s: &str) -> Result<Self> {
        if s.len() == HASH_LEN && s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
        {
            Ok(Self(s.to_string()))
        } else {
            Err(EngineError::BadHash(s.to_string()))
        }
    }

    /// The full hex digest.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The 6-character display prefix.
    #[must_use]
    pub fn short(&self) -> &str {
        &self.0[..SHORT]
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Incremental SHA-1 over canonical entity bytes.
pub struct Hasher(Sha1);

impl Hasher {
    /// Start a digest.
    #[must_use]
    pub fn new() -> Self {
        Self(Sha1::new())
    }

    /// Feed bytes.
    pub fn update(&mut self, bytes: impl AsRef<[u8]>) {
        self.0.update(bytes.as_ref());
    }

    /// Finish and return the hex hash.
    #[must_use]
    pub fn finish(self) -> ContentHash {
        ContentHash(hex::encode(self.0.finalize()))
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Pipeline command recording a hash in the short-hash index.
#[must_use]
pub fn hash_save_cmd(hash: &ContentHash) -> Cmd {
    Cmd::ZAdd {
        key: HASH_INDEX.to_string(),
        member: hash.as_str().to_string(),
    }
}

/// Record a hash in the short-hash index.
///
/// # Errors
///
/// Propagates hub failures.
pub fn hash_save(hub: &Hub, hash: &ContentHash) -> Result<()> {
    hub.zadd(HASH_INDEX, hash.as_str())?;
    Ok(())
}

/// All full hashes starting with `prefix`.
///
/// Lookup is a lexicographic range scan with the prefix as lower bound;
/// the scan stops at the first non-matching member.
///
/// # Errors
///
/// Returns `EngineError::BadHash` for prefixes longer than a full hash and
/// propagates hub failures.
pub fn hash_load(hub: &Hub, prefix: &str) -> Result<Vec<ContentHash>> {
    if prefix.len() > HASH_LEN {
        return Err(EngineError::BadHash(prefix.to_string()));
    }
    let mut out = Vec::new();
    for member in hub.zrange_from(HASH_INDEX, prefix)? {
        if !member.starts_with(prefix) {
            break;
        }
        out.push(ContentHash::from_hex(&member)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable() {
        let mut h = Hasher::new();
        h.update(b"artefact\n");
        h.update(b"constant\n");
        h.update(b"bla bla");
        // sha1("artefact\nconstant\nbla bla"), independently computed.
        assert_eq!(
            h.finish().as_str(),
            "d0c7662f07ea4942e59b589d57c028c5c8bf48aa"
        );
    }

    #[test]
    fn hex_validation() {
        assert!(ContentHash::from_hex("d0c7662f07ea4942e59b589d57c028c5c8bf48aa").is_ok());
        assert!(ContentHash::from_hex("short").is_err());
        assert!(ContentHash::from_hex("D0C7662F07EA4942E59B589D57C028C5C8BF48AA").is_err());
    }

    #[test]
    fn short_hash_lookup() {
        let hub = Hub::memory();
        let a = ContentHash::from_hex("aaaa0000000000000000000000000000000000f1").unwrap();
        let b = ContentHash::from_hex("aaaa0000000000000000000000000000000000f2").unwrap();
        let c = ContentHash::from_hex("bbbb000000000000000000000000000000000000").unwrap();
        for h in [&a, &b, &c] {
            hash_save(&hub, h).unwrap();
        }
        assert_eq!(hash_load(&hub, "aaaa00").unwrap(), vec![a.clone(), b]);
        assert_eq!(hash_load(&hub, "bbbb").unwrap(), vec![c]);
        assert!(hash_load(&hub, "cccc").unwrap().is_empty());
        assert!(hash_load(&hub, &"f".repeat(41)).is_err());
    }
}
