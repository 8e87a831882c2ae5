//! The artefact and operation graph.
//!
//! Artefacts are content-addressed slots for single values; operations bind
//! a funsie to concrete input artefacts and own their output artefacts.
//! Everything here is persisted to the hub; process state is only ever a
//! cheap view of it.

use std::collections::BTreeMap;

use convenient_hub::{Cmd, Hub};
use convenient_store::{Storage, StoreError};
use tracing::{debug, error};

use crate::constants::{key, subkey, ARTEFACTS, OPERATIONS, ROOT};
use crate::errors::{EngineError, Error, ErrorKind, Lifted, Result};
use crate::funsie::Funsie;
use crate::hashes::{hash_save_cmd, ContentHash, Hasher};
use crate::options::Options;
use crate::serdes::{encode, Encoding, Value};

// ---------------------------------------------------------------------------
// Status

/// Status of the data associated with an artefact.
///
/// The variant order is meaningful: everything after `NoData` counts as
/// "computed" for caching and readiness checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ArtefactStatus {
    /// Data was deleted by a reset.
    Deleted,
    /// No such artefact.
    NotFound,
    /// Artefact exists but has not been computed.
    NoData,
    /// Computed by an operation.
    Done,
    /// Constant, set at creation.
    Const,
    /// Holds an error value.
    Error,
    /// Redirects to another artefact.
    Linked,
}

impl ArtefactStatus {
    /// Integer stored in the hub. Wire format.
    #[must_use]
    pub fn as_int(self) -> i64 {
        match self {
            ArtefactStatus::Deleted => -2,
            ArtefactStatus::NotFound => -1,
            ArtefactStatus::NoData => 0,
            ArtefactStatus::Done => 1,
            ArtefactStatus::Const => 2,
            ArtefactStatus::Error => 3,
            ArtefactStatus::Linked => 4,
        }
    }

    fn from_int(v: i64) -> Self {
        match v {
            -2 => ArtefactStatus::Deleted,
            0 => ArtefactStatus::NoData,
            1 => ArtefactStatus::Done,
            2 => ArtefactStatus::Const,
            3 => ArtefactStatus::Error,
            4 => ArtefactStatus::Linked,
            _ => ArtefactStatus::NotFound,
        }
    }

    /// Whether this status counts as computed.
    #[must_use]
    pub fn is_ready(self) -> bool {
        self.as_int() > 0
    }
}

/// Read the status of an artefact. Missing keys read as `NotFound`.
///
/// # Errors
///
/// Propagates hub failures.
pub fn get_status(hub: &Hub, address: &ContentHash) -> Result<ArtefactStatus> {
    let raw = hub.get(&subkey(ARTEFACTS, address.as_str(), "status"))?;
    Ok(match raw {
        None => ArtefactStatus::NotFound,
        Some(v) => ArtefactStatus::from_int(
            String::from_utf8_lossy(&v).parse::<i64>().unwrap_or(-1),
        ),
    })
}

fn status_cmd(address: &ContentHash, status: ArtefactStatus) -> Cmd {
    Cmd::Set {
        key: subkey(ARTEFACTS, address.as_str(), "status"),
        value: status.as_int().to_string().into_bytes(),
    }
}

fn status_nx_cmd(address: &ContentHash, status: ArtefactStatus) -> Cmd {
    Cmd::SetNx {
        key: subkey(ARTEFACTS, address.as_str(), "status"),
        value: status.as_int().to_string().into_bytes(),
    }
}

fn set_status(hub: &Hub, address: &ContentHash, status: ArtefactStatus) -> Result<()> {
    hub.set(
        &subkey(ARTEFACTS, address.as_str(), "status"),
        status.as_int().to_string().as_bytes(),
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Artefacts

/// Producer of an artefact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parent {
    /// Constant or session input; nothing computes it.
    Root,
    /// The operation that produces this artefact.
    Op(ContentHash),
}

impl Parent {
    /// Stored string form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Parent::Root => ROOT,
            Parent::Op(h) => h.as_str(),
        }
    }

    fn from_stored(raw: &str) -> Result<Self> {
        if raw == ROOT {
            Ok(Parent::Root)
        } else {
            Ok(Parent::Op(ContentHash::from_hex(raw)?))
        }
    }
}

/// An instantiated artefact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artefact {
    /// Content hash identifying this slot.
    pub hash: ContentHash,
    /// Producing operation, or root.
    pub parent: Parent,
    /// Declared payload encoding.
    pub kind: Encoding,
}

impl Artefact {
    /// Commands persisting the artefact record and indexing its hash.
    #[must_use]
    pub fn persist_cmds(&self) -> Vec<Cmd> {
        vec![
            Cmd::HSetMap {
                key: key(ARTEFACTS, self.hash.as_str()),
                entries: vec![
                    ("hash".to_string(), self.hash.as_str().as_bytes().to_vec()),
                    (
                        "parent".to_string(),
                        self.parent.as_str().as_bytes().to_vec(),
                    ),
                    (
                        "kind".to_string(),
                        self.kind.as_str().as_bytes().to_vec(),
                    ),
                ],
            },
            hash_save_cmd(&self.hash),
        ]
    }

    /// Load an artefact record from the hub.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Missing` when nothing is stored under the
    /// hash.
    pub fn grab(hub: &Hub, hash: &ContentHash) -> Result<Self> {
        let data = hub.hgetall(&key(ARTEFACTS, hash.as_str()))?;
        if data.is_empty() {
            return Err(EngineError::Missing {
                kind: "artefact",
                address: hash.as_str().to_string(),
            });
        }
        let corrupt = || EngineError::Corrupt {
            kind: "artefact",
            address: hash.as_str().to_string(),
        };
        let parent =
            Parent::from_stored(&String::from_utf8_lossy(data.get("parent").ok_or_else(corrupt)?))?;
        let kind = data
            .get("kind")
            .and_then(|raw| Encoding::from_name(&String::from_utf8_lossy(raw)))
            .ok_or_else(corrupt)?;
        Ok(Self {
            hash: hash.clone(),
            parent,
            kind,
        })
    }
}

/// Whether a hash corresponds to an artefact record.
///
/// # Errors
///
/// Propagates hub failures.
pub fn is_artefact(hub: &Hub, address: &ContentHash) -> Result<bool> {
    Ok(hub.exists(&key(ARTEFACTS, address.as_str()))?)
}

/// Store an error value on an artefact. Consts are left untouched.
///
/// # Errors
///
/// Propagates hub failures.
pub fn mark_error(hub: &Hub, address: &ContentHash, err: &Error) -> Result<()> {
    if get_status(hub, address)? == ArtefactStatus::Const {
        error!("attempted to mark in error a const artefact");
        Ok(())
    } else {
        set_status(hub, address, ArtefactStatus::Error)?;
        err.put(hub, address)
    }
}

/// Follow link indirections down to a concrete artefact hash.
///
/// # Errors
///
/// Propagates hub failures.
pub fn resolve_link(hub: &Hub, address: &ContentHash) -> Result<ContentHash> {
    let mut current = address.clone();
    while get_status(hub, &current)? == ArtefactStatus::Linked {
        match hub.get(&subkey(ARTEFACTS, current.as_str(), "link"))? {
            Some(raw) => current = ContentHash::from_hex(&String::from_utf8_lossy(&raw))?,
            None => {
                return Err(EngineError::Corrupt {
                    kind: "link",
                    address: current.as_str().to_string(),
                })
            }
        }
    }
    Ok(current)
}

/// Redirect artefact `from` to artefact `to`.
///
/// # Errors
///
/// Returns `EngineError::ConstArtefact` when `from` is a const.
pub fn write_link(hub: &Hub, from: &ContentHash, to: &ContentHash) -> Result<()> {
    if get_status(hub, from)? == ArtefactStatus::Const {
        return Err(EngineError::ConstArtefact(from.as_str().to_string()));
    }
    hub.pipeline(vec![
        Cmd::Set {
            key: subkey(ARTEFACTS, from.as_str(), "link"),
            value: to.as_str().as_bytes().to_vec(),
        },
        status_cmd(from, ArtefactStatus::Linked),
    ])?;
    Ok(())
}

/// Retrieve the payload of an artefact, following links.
///
/// Data-level problems (upstream errors, missing or mismatched data) are
/// returned inside the `Lifted` value; the outer `Result` carries
/// infrastructure failures only. `carry` names the operation on whose
/// behalf the read happens, so fresh errors can name their source.
///
/// # Errors
///
/// Propagates hub failures.
pub fn get_data(
    hub: &Hub,
    store: &Storage,
    artefact: &Artefact,
    carry: Option<&ContentHash>,
) -> Result<Lifted<Vec<u8>>> {
    let status = get_status(hub, &artefact.hash)?;
    match status {
        ArtefactStatus::Error => Ok(Err(Error::grab(hub, &artefact.hash)?)),
        ArtefactStatus::Linked => {
            let target = resolve_link(hub, &artefact.hash)?;
            let resolved = Artefact::grab(hub, &target)?;
            get_data(hub, store, &resolved, carry)
        }
        s if !s.is_ready() => {
            let mut err = Error::new(ErrorKind::NotFound)
                .with_details(format!("no data associated with artefact: {s:?}"));
            if let Some(source) = carry {
                err = err.with_source(source.clone());
            }
            Ok(Err(err))
        }
        _ => match store.get(artefact.hash.as_str()) {
            Ok(bytes) => Ok(Ok(bytes)),
            Err(StoreError::NotFound(_)) => {
                let mut err = Error::new(ErrorKind::Mismatch)
                    .with_details("expected data was not found");
                if let Some(source) = carry {
                    err = err.with_source(source.clone());
                }
                Ok(Err(err))
            }
            Err(e) => {
                let mut err =
                    Error::new(ErrorKind::ExceptionRaised).with_details(e.to_string());
                if let Some(source) = carry {
                    err = err.with_source(source.clone());
                }
                Ok(Err(err))
            }
        },
    }
}

/// Write the payload of an artefact and move it to `status`.
///
/// # Errors
///
/// Returns `EngineError::ConstArtefact` / `EngineError::LinkedArtefact`
/// when the target refuses writes, and propagates storage failures.
pub fn set_data(
    hub: &Hub,
    store: &Storage,
    address: &ContentHash,
    value: &[u8],
    status: ArtefactStatus,
) -> Result<()> {
    let current = get_status(hub, address)?;
    if current == ArtefactStatus::Const && status != ArtefactStatus::Const {
        return Err(EngineError::ConstArtefact(address.as_str().to_string()));
    }
    if current == ArtefactStatus::Linked {
        return Err(EngineError::LinkedArtefact(address.as_str().to_string()));
    }
    store.put(address.as_str(), value)?;
    set_status(hub, address, status)
}

/// Create (or re-create) a constant artefact holding `value`.
///
/// # Errors
///
/// Returns `EngineError::Unwrap` if the value cannot be serialized and
/// propagates hub/storage failures.
pub fn constant_artefact(hub: &Hub, store: &Storage, value: &Value) -> Result<Artefact> {
    let kind = value.natural_encoding();
    let bytes = encode(kind, value).map_err(EngineError::Unwrap)?;

    let mut hasher = Hasher::new();
    hasher.update(b"artefact\n");
    hasher.update(b"constant\n");
    hasher.update(&bytes);
    let hash = hasher.finish();

    let node = Artefact {
        hash,
        parent: Parent::Root,
        kind,
    };
    hub.pipeline(node.persist_cmds())?;
    set_data(hub, store, &node.hash, &bytes, ArtefactStatus::Const)?;
    debug!("stored constant {}", node.hash.short());
    Ok(node)
}

/// Append commands creating a variable artefact owned by `parent`.
#[must_use]
pub fn variable_artefact(
    cmds: &mut Vec<Cmd>,
    parent: &ContentHash,
    name: &str,
    kind: Encoding,
) -> Artefact {
    let mut hasher = Hasher::new();
    hasher.update(b"artefact\n");
    hasher.update(b"variable\n");
    hasher.update(format!("parent:{parent}\n"));
    hasher.update(format!("name:{name}\n"));
    let hash = hasher.finish();

    let node = Artefact {
        hash,
        parent: Parent::Op(parent.clone()),
        kind,
    };
    cmds.extend(node.persist_cmds());
    cmds.push(status_nx_cmd(&node.hash, ArtefactStatus::NoData));
    node
}

/// Invalidate the data of an artefact, marking it deleted.
///
/// Consts refuse deletion; the attempt is logged and ignored.
///
/// # Errors
///
/// Propagates hub/storage failures.
pub fn delete_artefact(hub: &Hub, store: &Storage, address: &ContentHash) -> Result<()> {
    if get_status(hub, address)? == ArtefactStatus::Const {
        error!(
            "attempted to delete const artefact {}; set a different value instead",
            address.short()
        );
        return Ok(());
    }
    set_status(hub, address, ArtefactStatus::Deleted)?;
    store.delete(address.as_str())?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Operations

/// A funsie bound to concrete input artefacts.
#[derive(Debug, Clone)]
pub struct Operation {
    /// Content hash identifying this operation.
    pub hash: ContentHash,
    /// Hash of the funsie being run.
    pub funsie: ContentHash,
    /// Input name to artefact hash.
    pub inp: BTreeMap<String, ContentHash>,
    /// Output name to artefact hash.
    pub out: BTreeMap<String, ContentHash>,
    /// Runtime options. Never hashed.
    pub options: Options,
}

impl Operation {
    /// Commands persisting this operation record.
    ///
    /// # Errors
    ///
    /// Propagates option serialization failures.
    pub fn persist_cmds(&self) -> Result<Vec<Cmd>> {
        let mut cmds = Vec::new();
        if !self.inp.is_empty() {
            cmds.push(Cmd::HSetMap {
                key: subkey(OPERATIONS, self.hash.as_str(), "inp"),
                entries: self
                    .inp
                    .iter()
                    .map(|(k, v)| (k.clone(), v.as_str().as_bytes().to_vec()))
                    .collect(),
            });
        }
        if !self.out.is_empty() {
            cmds.push(Cmd::HSetMap {
                key: subkey(OPERATIONS, self.hash.as_str(), "out"),
                entries: self
                    .out
                    .iter()
                    .map(|(k, v)| (k.clone(), v.as_str().as_bytes().to_vec()))
                    .collect(),
            });
        }
        cmds.push(Cmd::Set {
            key: subkey(OPERATIONS, self.hash.as_str(), "options"),
            value: self.options.pack()?.into_bytes(),
        });
        cmds.push(Cmd::HSetMap {
            key: key(OPERATIONS, self.hash.as_str()),
            entries: vec![
                ("hash".to_string(), self.hash.as_str().as_bytes().to_vec()),
                (
                    "funsie".to_string(),
                    self.funsie.as_str().as_bytes().to_vec(),
                ),
            ],
        });
        cmds.push(hash_save_cmd(&self.hash));
        Ok(cmds)
    }

    /// Load an operation from the hub.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Missing` when nothing is stored under the
    /// hash.
    pub fn grab(hub: &Hub, hash: &ContentHash) -> Result<Self> {
        let meta = hub.hgetall(&key(OPERATIONS, hash.as_str()))?;
        if meta.is_empty() {
            return Err(EngineError::Missing {
                kind: "operation",
                address: hash.as_str().to_string(),
            });
        }
        let funsie = meta
            .get("funsie")
            .map(|raw| ContentHash::from_hex(&String::from_utf8_lossy(raw)))
            .transpose()?
            .ok_or(EngineError::Corrupt {
                kind: "operation",
                address: hash.as_str().to_string(),
            })?;
        let parse_hashes = |raw: BTreeMap<String, Vec<u8>>| -> Result<BTreeMap<String, ContentHash>> {
            raw.into_iter()
                .map(|(k, v)| Ok((k, ContentHash::from_hex(&String::from_utf8_lossy(&v))?)))
                .collect()
        };
        let inp = parse_hashes(hub.hgetall(&subkey(OPERATIONS, hash.as_str(), "inp"))?)?;
        let out = parse_hashes(hub.hgetall(&subkey(OPERATIONS, hash.as_str(), "out"))?)?;
        let options = op_options(hub, hash)?;
        Ok(Self {
            hash: hash.clone(),
            funsie,
            inp,
            out,
            options,
        })
    }
}

/// Whether a hash corresponds to an operation record.
///
/// # Errors
///
/// Propagates hub failures.
pub fn is_operation(hub: &Hub, address: &ContentHash) -> Result<bool> {
    Ok(hub.exists(&key(OPERATIONS, address.as_str()))?)
}

/// Load the runtime options of an operation. Missing records fall back to
/// defaults.
///
/// # Errors
///
/// Propagates hub failures.
pub fn op_options(hub: &Hub, hash: &ContentHash) -> Result<Options> {
    match hub.get(&subkey(OPERATIONS, hash.as_str(), "options"))? {
        Some(raw) => Options::unpack(&String::from_utf8_lossy(&raw)),
        None => Ok(Options::default()),
    }
}

/// Bind a funsie to concrete inputs and persist the resulting operation.
///
/// Outputs are created as `no_data` variable artefacts whose hashes derive
/// from the operation hash; all records and edges land in one pipelined
/// write. Re-making an identical operation is a no-op by construction.
///
/// # Errors
///
/// Returns `EngineError::UnexpectedInput` / `EngineError::UndefinedInput`
/// when the inputs do not match the funsie signature, and propagates hub
/// failures.
pub fn make_op(
    hub: &Hub,
    funsie: &Funsie,
    inp: &BTreeMap<String, Artefact>,
    options: &Options,
) -> Result<Operation> {
    for name in inp.keys() {
        if !funsie.inp.contains_key(name) {
            return Err(EngineError::UnexpectedInput(name.clone()));
        }
    }
    for name in funsie.inp.keys() {
        if !inp.contains_key(name) {
            return Err(EngineError::UndefinedInput(name.clone()));
        }
    }

    let mut hasher = Hasher::new();
    hasher.update(b"op");
    hasher.update(funsie.hash.as_str());
    for (name, artefact) in inp {
        hasher.update(format!("file={name}, hash={}", artefact.hash));
    }
    let ophash = hasher.finish();

    let mut cmds = funsie.persist_cmds();

    let mut out = BTreeMap::new();
    for (name, kind) in &funsie.out {
        let artefact = variable_artefact(&mut cmds, &ophash, name, *kind);
        out.insert(name.clone(), artefact.hash);
    }

    let node = Operation {
        hash: ophash.clone(),
        funsie: funsie.hash.clone(),
        inp: inp
            .iter()
            .map(|(k, v)| (k.clone(), v.hash.clone()))
            .collect(),
        out,
        options: options.clone(),
    };
    cmds.extend(node.persist_cmds()?);

    // Edges: parents/children between operations, dependents per artefact.
    let mut root = true;
    for artefact in inp.values() {
        cmds.push(Cmd::SAdd {
            key: subkey(ARTEFACTS, artefact.hash.as_str(), "dependents"),
            member: ophash.as_str().to_string(),
        });
        if let Parent::Op(parent) = &artefact.parent {
            root = false;
            cmds.push(Cmd::SAdd {
                key: subkey(OPERATIONS, ophash.as_str(), "parents"),
                member: parent.as_str().to_string(),
            });
            cmds.push(Cmd::SAdd {
                key: subkey(OPERATIONS, parent.as_str(), "children"),
                member: ophash.as_str().to_string(),
            });
        }
    }
    if root {
        cmds.push(Cmd::SAdd {
            key: subkey(OPERATIONS, ophash.as_str(), "parents"),
            member: ROOT.to_string(),
        });
        cmds.push(Cmd::SAdd {
            key: subkey(OPERATIONS, ROOT, "children"),
            member: ophash.as_str().to_string(),
        });
    }

    hub.pipeline(cmds)?;
    debug!("made op {}", ophash.short());
    Ok(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::funsie::FunsieHow;

    fn memory() -> (Hub, Storage) {
        let hub = Hub::memory();
        let store = Storage::hub(hub.clone());
        (hub, store)
    }

    fn simple_funsie(n_inp: usize) -> Funsie {
        let inp: BTreeMap<String, Encoding> = (0..n_inp)
            .map(|i| (format!("in{i}"), Encoding::Blob))
            .collect();
        let mut out = BTreeMap::new();
        out.insert("out".to_string(), Encoding::Blob);
        Funsie::new(FunsieHow::Native, "tests:simple", inp, out, BTreeMap::new(), false)
    }

    #[test]
    fn constant_artefacts_are_content_addressed() {
        let (hub, store) = memory();
        let a = constant_artefact(&hub, &store, &Value::from(b"bla bla")).unwrap();
        let b = constant_artefact(&hub, &store, &Value::from(b"bla bla")).unwrap();
        assert_eq!(a.hash, b.hash);
        assert_eq!(get_status(&hub, &a.hash).unwrap(), ArtefactStatus::Const);
        assert_eq!(
            get_data(&hub, &store, &a, None).unwrap().unwrap(),
            b"bla bla"
        );

        let c = constant_artefact(&hub, &store, &Value::from(b"different")).unwrap();
        assert_ne!(a.hash, c.hash);
    }

    #[test]
    fn json_and_blob_constants_differ_in_kind() {
        let (hub, store) = memory();
        let blob = constant_artefact(&hub, &store, &Value::from("3")).unwrap();
        let json = constant_artefact(&hub, &store, &Value::from(3i64)).unwrap();
        assert_eq!(blob.kind, Encoding::Blob);
        assert_eq!(json.kind, Encoding::Json);
        // Both serialize to the byte string "3" and therefore collide on
        // content; the stored record keeps the latest kind.
        assert_eq!(blob.hash, json.hash);
    }

    #[test]
    fn const_rejects_mutation() {
        let (hub, store) = memory();
        let a = constant_artefact(&hub, &store, &Value::from(b"fixed")).unwrap();
        let result = set_data(&hub, &store, &a.hash, b"changed", ArtefactStatus::Done);
        assert!(matches!(result, Err(EngineError::ConstArtefact(_))));
        // Re-storing the same constant is fine.
        constant_artefact(&hub, &store, &Value::from(b"fixed")).unwrap();
    }

    #[test]
    fn const_refuses_delete() {
        let (hub, store) = memory();
        let a = constant_artefact(&hub, &store, &Value::from(b"keep")).unwrap();
        delete_artefact(&hub, &store, &a.hash).unwrap();
        assert_eq!(get_status(&hub, &a.hash).unwrap(), ArtefactStatus::Const);
    }

    #[test]
    fn variable_artefact_hash_derives_from_parent_and_name() {
        let parent =
            ContentHash::from_hex("aaaa000000000000000000000000000000000000").unwrap();
        let mut cmds = Vec::new();
        let x = variable_artefact(&mut cmds, &parent, "out", Encoding::Blob);
        let mut cmds2 = Vec::new();
        let y = variable_artefact(&mut cmds2, &parent, "out", Encoding::Blob);
        assert_eq!(x.hash, y.hash);
        let z = variable_artefact(&mut cmds2, &parent, "other", Encoding::Blob);
        assert_ne!(x.hash, z.hash);
    }

    #[test]
    fn make_op_validates_inputs() {
        let (hub, store) = memory();
        let funsie = simple_funsie(1);
        let a = constant_artefact(&hub, &store, &Value::from(b"x")).unwrap();

        let empty = BTreeMap::new();
        assert!(matches!(
            make_op(&hub, &funsie, &empty, &Options::default()),
            Err(EngineError::UndefinedInput(_))
        ));

        let mut extra = BTreeMap::new();
        extra.insert("in0".to_string(), a.clone());
        extra.insert("bogus".to_string(), a);
        assert!(matches!(
            make_op(&hub, &funsie, &extra, &Options::default()),
            Err(EngineError::UnexpectedInput(_))
        ));
    }

    #[test]
    fn make_op_is_deterministic_and_persists_edges() {
        let (hub, store) = memory();
        let funsie = simple_funsie(1);
        let a = constant_artefact(&hub, &store, &Value::from(b"x")).unwrap();
        let mut inp = BTreeMap::new();
        inp.insert("in0".to_string(), a.clone());

        let op1 = make_op(&hub, &funsie, &inp, &Options::default()).unwrap();
        let op2 = make_op(&hub, &funsie, &inp, &Options::default()).unwrap();
        assert_eq!(op1.hash, op2.hash);
        assert_eq!(op1.out, op2.out);

        // Const-only inputs attach the op to the root sentinel.
        assert!(hub
            .smembers(&subkey(OPERATIONS, op1.hash.as_str(), "parents"))
            .unwrap()
            .contains(ROOT));
        assert!(hub
            .smembers(&subkey(OPERATIONS, ROOT, "children"))
            .unwrap()
            .contains(op1.hash.as_str()));
        // The input artefact indexes its consumer.
        assert!(hub
            .smembers(&subkey(ARTEFACTS, a.hash.as_str(), "dependents"))
            .unwrap()
            .contains(op1.hash.as_str()));

        // Outputs start with no data.
        let out = op1.out.get("out").unwrap();
        assert_eq!(get_status(&hub, out).unwrap(), ArtefactStatus::NoData);

        let loaded = Operation::grab(&hub, &op1.hash).unwrap();
        assert_eq!(loaded.funsie, funsie.hash);
        assert_eq!(loaded.inp, op1.inp);
    }

    #[test]
    fn chained_ops_record_parent_edges() {
        let (hub, store) = memory();
        let funsie = simple_funsie(1);
        let a = constant_artefact(&hub, &store, &Value::from(b"x")).unwrap();
        let mut inp = BTreeMap::new();
        inp.insert("in0".to_string(), a);
        let first = make_op(&hub, &funsie, &inp, &Options::default()).unwrap();

        let mid = Artefact::grab(&hub, first.out.get("out").unwrap()).unwrap();
        let mut inp2 = BTreeMap::new();
        inp2.insert("in0".to_string(), mid);
        let second = make_op(&hub, &funsie, &inp2, &Options::default()).unwrap();

        assert!(hub
            .smembers(&subkey(OPERATIONS, second.hash.as_str(), "parents"))
            .unwrap()
            .contains(first.hash.as_str()));
        assert!(hub
            .smembers(&subkey(OPERATIONS, first.hash.as_str(), "children"))
            .unwrap()
            .contains(second.hash.as_str()));
    }

    #[test]
    fn linked_artefacts_resolve_transitively() {
        let (hub, store) = memory();
        let target = constant_artefact(&hub, &store, &Value::from(b"payload")).unwrap();

        let parent =
            ContentHash::from_hex("aaaa000000000000000000000000000000000000").unwrap();
        let mut cmds = Vec::new();
        let alias = variable_artefact(&mut cmds, &parent, "out", Encoding::Blob);
        let hop = variable_artefact(&mut cmds, &parent, "hop", Encoding::Blob);
        hub.pipeline(cmds).unwrap();

        write_link(&hub, &hop.hash, &target.hash).unwrap();
        write_link(&hub, &alias.hash, &hop.hash).unwrap();

        assert_eq!(resolve_link(&hub, &alias.hash).unwrap(), target.hash);
        assert_eq!(
            get_data(&hub, &store, &alias, None).unwrap().unwrap(),
            b"payload"
        );
        // Writers never target a linked artefact.
        assert!(matches!(
            set_data(&hub, &store, &alias.hash, b"x", ArtefactStatus::Done),
            Err(EngineError::LinkedArtefact(_))
        ));
    }

    #[test]
    fn error_statuses_surface_as_lifted_errors() {
        let (hub, store) = memory();
        let parent =
            ContentHash::from_hex("aaaa000000000000000000000000000000000000").unwrap();
        let mut cmds = Vec::new();
        let art = variable_artefact(&mut cmds, &parent, "out", Encoding::Blob);
        hub.pipeline(cmds).unwrap();

        // No data yet.
        let err = get_data(&hub, &store, &art, Some(&parent))
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
        assert_eq!(err.source, Some(parent.clone()));

        // Errored.
        mark_error(
            &hub,
            &art.hash,
            &Error::new(ErrorKind::MissingOutput).with_source(parent.clone()),
        )
        .unwrap();
        let err = get_data(&hub, &store, &art, None).unwrap().unwrap_err();
        assert_eq!(err.kind, ErrorKind::MissingOutput);
        assert_eq!(err.source, Some(parent));
    }

    #[test]
    fn status_ready_predicate() {
        assert!(!ArtefactStatus::Deleted.is_ready());
        assert!(!ArtefactStatus::NotFound.is_ready());
        assert!(!ArtefactStatus::NoData.is_ready());
        assert!(ArtefactStatus::Done.is_ready());
        assert!(ArtefactStatus::Const.is_ready());
        assert!(ArtefactStatus::Error.is_ready());
        assert!(ArtefactStatus::Linked.is_ready());
    }
}
