//! Funsies: immutable descriptions of callable units.
//!
//! A funsie says *how* to compute (shell, native function, sub-DAG
//! generator), *what* identifies the computation (command lines, a
//! registered function name) and which named inputs and outputs it has.
//! All of that is hashed. The `extra` side data (packed command lists,
//! env maps) is deliberately not: it must be reproducible from `what`.

use std::collections::BTreeMap;

use convenient_hub::{Cmd, Hub};

use crate::constants::{key, subkey, FUNSIES};
use crate::errors::{EngineError, Lifted, Result};
use crate::hashes::{hash_save_cmd, ContentHash, Hasher};
use crate::serdes::{decode, Encoding, Value};

/// The three ways a funsie can be executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunsieHow {
    /// A registered host-language function.
    Native,
    /// A sequence of shell commands.
    Shell,
    /// A generator that builds a sub-DAG at runtime.
    Subdag,
}

impl FunsieHow {
    /// Integer used in hash strings and hub records. Wire format.
    #[must_use]
    pub fn as_int(self) -> u8 {
        match self {
            FunsieHow::Native => 0,
            FunsieHow::Shell => 1,
            FunsieHow::Subdag => 2,
        }
    }

    fn from_int(v: u8) -> Option<Self> {
        match v {
            0 => Some(FunsieHow::Native),
            1 => Some(FunsieHow::Shell),
            2 => Some(FunsieHow::Subdag),
            _ => None,
        }
    }
}

/// An immutable callable specification.
#[derive(Debug, Clone)]
pub struct Funsie {
    /// Execution kind.
    pub how: FunsieHow,
    /// Semantic identity: command lines or registered name.
    pub what: String,
    /// Input name to encoding.
    pub inp: BTreeMap<String, Encoding>,
    /// Output name to encoding.
    pub out: BTreeMap<String, Encoding>,
    /// Side data excluded from hashing.
    pub extra: BTreeMap<String, Vec<u8>>,
    /// When set, input errors are passed through to the callable.
    pub error_tolerant: bool,
    /// Content hash over the canonical string.
    pub hash: ContentHash,
}

impl Funsie {
    /// Build a funsie and compute its hash.
    #[must_use]
    pub fn new(
        how: FunsieHow,
        what: impl Into<String>,
        inp: BTreeMap<String, Encoding>,
        out: BTreeMap<String, Encoding>,
        extra: BTreeMap<String, Vec<u8>>,
        error_tolerant: bool,
    ) -> Self {
        let what = what.into();
        let mut canonical = format!("how={}\nwhat={}\n", how.as_int(), what);
        for (k, enc) in &inp {
            canonical.push_str(&format!("input:{k} -> {enc}\n"));
        }
        for (k, enc) in &out {
            canonical.push_str(&format!("output:{k} -> {enc}\n"));
        }
        canonical.push_str(&format!("error tolerant:{}\n", u8::from(error_tolerant)));

        let mut hasher = Hasher::new();
        hasher.update(b"funsie");
        hasher.update(canonical.as_bytes());
        let hash = hasher.finish();

        Self {
            how,
            what,
            inp,
            out,
            extra,
            error_tolerant,
            hash,
        }
    }

    /// Decode raw input payloads according to the declared input encodings.
    ///
    /// Errors carried by inputs are preserved as-is; codec failures become
    /// fresh data errors naming `carry` as their source.
    #[must_use]
    pub fn decode_inputs(
        &self,
        input_data: &BTreeMap<String, Lifted<Vec<u8>>>,
        carry: Option<&crate::hashes::ContentHash>,
    ) -> BTreeMap<String, Lifted<Value>> {
        let mut out = BTreeMap::new();
        for (name, enc) in &self.inp {
            let lifted = match input_data.get(name) {
                Some(Ok(bytes)) => decode(*enc, bytes, carry),
                Some(Err(e)) => Err(e.clone()),
                None => continue,
            };
            out.insert(name.clone(), lifted);
        }
        out
    }

    /// Commands persisting this funsie, for inclusion in a pipeline.
    #[must_use]
    pub fn persist_cmds(&self) -> Vec<Cmd> {
        let base = key(FUNSIES, self.hash.as_str());
        let mut cmds = vec![Cmd::HSetMap {
            key: base,
            entries: vec![
                (
                    "hash".to_string(),
                    self.hash.as_str().as_bytes().to_vec(),
                ),
                (
                    "how".to_string(),
                    self.how.as_int().to_string().into_bytes(),
                ),
                ("what".to_string(), self.what.as_bytes().to_vec()),
                (
                    "error_tolerant".to_string(),
                    u8::from(self.error_tolerant).to_string().into_bytes(),
                ),
            ],
        }];
        if !self.inp.is_empty() {
            cmds.push(Cmd::HSetMap {
                key: subkey(FUNSIES, self.hash.as_str(), "inp"),
                entries: self
                    .inp
                    .iter()
                    .map(|(k, enc)| (k.clone(), enc.as_str().as_bytes().to_vec()))
                    .collect(),
            });
        }
        if !self.out.is_empty() {
            cmds.push(Cmd::HSetMap {
                key: subkey(FUNSIES, self.hash.as_str(), "out"),
                entries: self
                    .out
                    .iter()
                    .map(|(k, enc)| (k.clone(), enc.as_str().as_bytes().to_vec()))
                    .collect(),
            });
        }
        if !self.extra.is_empty() {
            cmds.push(Cmd::HSetMap {
                key: subkey(FUNSIES, self.hash.as_str(), "extra"),
                entries: self
                    .extra
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            });
        }
        cmds.push(hash_save_cmd(&self.hash));
        cmds
    }

    /// Save this funsie to the hub.
    ///
    /// # Errors
    ///
    /// Propagates hub failures.
    pub fn put(&self, hub: &Hub) -> Result<()> {
        hub.pipeline(self.persist_cmds())?;
        Ok(())
    }

    /// Load a funsie from the hub.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Missing` when nothing is stored under the
    /// hash, `EngineError::Corrupt` on malformed records.
    pub fn grab(hub: &Hub, hash: &ContentHash) -> Result<Self> {
        let base = key(FUNSIES, hash.as_str());
        let meta = hub.hgetall(&base)?;
        if meta.is_empty() {
            return Err(EngineError::Missing {
                kind: "funsie",
                address: hash.as_str().to_string(),
            });
        }
        let corrupt = || EngineError::Corrupt {
            kind: "funsie",
            address: hash.as_str().to_string(),
        };
        let how = meta
            .get("how")
            .and_then(|raw| String::from_utf8_lossy(raw).parse::<u8>().ok())
            .and_then(FunsieHow::from_int)
            .ok_or_else(corrupt)?;
        let what = meta
            .get("what")
            .map(|raw| String::from_utf8_lossy(raw).into_owned())
            .ok_or_else(corrupt)?;
        let error_tolerant = meta
            .get("error_tolerant")
            .map(|raw| raw.as_slice() == b"1")
            .ok_or_else(corrupt)?;

        let parse_encodings = |raw: BTreeMap<String, Vec<u8>>| -> Result<BTreeMap<String, Encoding>> {
            raw.into_iter()
                .map(|(k, v)| {
                    Encoding::from_name(&String::from_utf8_lossy(&v))
                        .map(|enc| (k, enc))
                        .ok_or_else(corrupt)
                })
                .collect()
        };
        let inp = parse_encodings(hub.hgetall(&subkey(FUNSIES, hash.as_str(), "inp"))?)?;
        let out = parse_encodings(hub.hgetall(&subkey(FUNSIES, hash.as_str(), "out"))?)?;
        let extra = hub.hgetall(&subkey(FUNSIES, hash.as_str(), "extra"))?;

        Ok(Self::new(how, what, inp, out, extra, error_tolerant))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Funsie {
        let mut inp = BTreeMap::new();
        inp.insert("x".to_string(), Encoding::Blob);
        inp.insert("y".to_string(), Encoding::Json);
        let mut out = BTreeMap::new();
        out.insert("out".to_string(), Encoding::Json);
        Funsie::new(FunsieHow::Native, "my.module:double", inp, out, BTreeMap::new(), false)
    }

    #[test]
    fn hash_depends_on_identity_not_extra() {
        let a = sample();
        let mut b = sample();
        b.extra
            .insert("env".to_string(), b"{\"PATH\": \"/bin\"}".to_vec());
        assert_eq!(a.hash, b.hash);

        let mut inp = a.inp.clone();
        inp.insert("z".to_string(), Encoding::Blob);
        let c = Funsie::new(
            FunsieHow::Native,
            "my.module:double",
            inp,
            a.out.clone(),
            BTreeMap::new(),
            false,
        );
        assert_ne!(a.hash, c.hash);

        let tolerant = Funsie::new(
            FunsieHow::Native,
            "my.module:double",
            a.inp.clone(),
            a.out.clone(),
            BTreeMap::new(),
            true,
        );
        assert_ne!(a.hash, tolerant.hash);
    }

    #[test]
    fn hash_is_order_insensitive_on_inputs() {
        // BTreeMap insertion order does not matter; the canonical string is
        // sorted either way.
        let mut inp1 = BTreeMap::new();
        inp1.insert("b".to_string(), Encoding::Blob);
        inp1.insert("a".to_string(), Encoding::Blob);
        let mut inp2 = BTreeMap::new();
        inp2.insert("a".to_string(), Encoding::Blob);
        inp2.insert("b".to_string(), Encoding::Blob);
        let f1 = Funsie::new(FunsieHow::Shell, "cat a b", inp1, BTreeMap::new(), BTreeMap::new(), false);
        let f2 = Funsie::new(FunsieHow::Shell, "cat a b", inp2, BTreeMap::new(), BTreeMap::new(), false);
        assert_eq!(f1.hash, f2.hash);
    }

    #[test]
    fn grab_restores_identity() {
        let hub = Hub::memory();
        let mut funsie = sample();
        funsie
            .extra
            .insert("cmds".to_string(), b"[\"true\"]".to_vec());
        funsie.put(&hub).unwrap();
        let loaded = Funsie::grab(&hub, &funsie.hash).unwrap();
        assert_eq!(loaded.hash, funsie.hash);
        assert_eq!(loaded.what, funsie.what);
        assert_eq!(loaded.inp, funsie.inp);
        assert_eq!(loaded.out, funsie.out);
        assert_eq!(loaded.extra, funsie.extra);
    }

    #[test]
    fn grab_missing_funsie_fails() {
        let hub = Hub::memory();
        let absent =
            ContentHash::from_hex("0000000000000000000000000000000000000000").unwrap();
        assert!(matches!(
            Funsie::grab(&hub, &absent),
            Err(EngineError::Missing { kind: "funsie", .. })
        ));
    }

    #[test]
    fn decode_inputs_preserves_errors() {
        use crate::errors::{Error, ErrorKind};
        let funsie = sample();
        let mut data: BTreeMap<String, Lifted<Vec<u8>>> = BTreeMap::new();
        data.insert("x".to_string(), Ok(b"raw".to_vec()));
        data.insert(
            "y".to_string(),
            Err(Error::new(ErrorKind::NotFound)),
        );
        let decoded = funsie.decode_inputs(&data, None);
        assert_eq!(decoded["x"], Ok(Value::Bytes(b"raw".to_vec())));
        assert_eq!(decoded["y"].as_ref().unwrap_err().kind, ErrorKind::NotFound);
    }
}
