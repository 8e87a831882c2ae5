//! DAG materialization and the distributed scheduler.
//!
//! A DAG instance is the closure of operations feeding one target, stored
//! as a set of op hashes plus a remaining-parents counter per op. Workers
//! cooperate through three pieces of hub state: the per-op owner lock
//! (exactly one executor), the per-DAG counters (happens-before), and the
//! job queues (dispatch). The counter decrement is atomic; only the worker
//! that observes zero enqueues the dependent, so no dependent is ever
//! dispatched twice for one DAG run.

use std::collections::BTreeSet;
use std::time::Duration;

use convenient_hub::{Cmd, Hub};
use tracing::{debug, info, warn};

use crate::constants::{
    key, subkey, DAG_INDEX, DAG_OPERATIONS, DAG_STATUS, DAG_SUBDAG_PENDING, DAG_TERMINATOR,
    OPERATIONS, ROOT,
};
use crate::errors::{EngineError, Result};
use crate::graph::{is_artefact, resolve_link, Artefact, Operation, Parent};
use crate::hashes::ContentHash;
use crate::jobs::Job;
use crate::run::{run_op, RunStatus};
use crate::session::Session;

/// Back-off before re-enqueueing a lock-contended task.
const CONTENTION_DELAY: Duration = Duration::from_millis(500);

/// Heartbeats older than this mark a worker as dead for lock stealing.
/// Workers beat from a dedicated thread, so this only has to cover
/// scheduling hiccups, not job durations.
const WORKER_STALE: Duration = Duration::from_secs(60);

fn hashes_of(members: BTreeSet<String>) -> Result<BTreeSet<ContentHash>> {
    members
        .into_iter()
        .filter(|m| m != ROOT)
        .map(|m| ContentHash::from_hex(&m))
        .collect()
}

/// All transitive ancestor operations of the given operations.
///
/// With `include_subdags`, edges from sub-DAG-generating ops to the
/// terminators of their generated graphs are followed too.
///
/// # Errors
///
/// Propagates hub failures.
pub fn ancestors(
    hub: &Hub,
    addresses: &[ContentHash],
    include_subdags: bool,
) -> Result<BTreeSet<ContentHash>> {
    let mut queue: Vec<ContentHash> = addresses.to_vec();
    let mut out = BTreeSet::new();
    while let Some(current) = queue.pop() {
        let mut parents =
            hashes_of(hub.smembers(&subkey(OPERATIONS, current.as_str(), "parents"))?)?;
        if include_subdags {
            parents.extend(hashes_of(
                hub.smembers(&subkey(OPERATIONS, current.as_str(), "parents.subdag"))?,
            )?);
        }
        for parent in parents {
            if out.insert(parent.clone()) {
                queue.push(parent);
            }
        }
    }
    Ok(out)
}

/// All transitive descendant operations of the given operations.
///
/// # Errors
///
/// Propagates hub failures.
pub fn descendants(hub: &Hub, addresses: &[ContentHash]) -> Result<BTreeSet<ContentHash>> {
    let mut queue: Vec<ContentHash> = addresses.to_vec();
    let mut out = BTreeSet::new();
    while let Some(current) = queue.pop() {
        let children =
            hashes_of(hub.smembers(&subkey(OPERATIONS, current.as_str(), "children"))?)?;
        for child in children {
            if out.insert(child.clone()) {
                queue.push(child);
            }
        }
    }
    Ok(out)
}

/// Resolve a hash to the nearest producing operation: the operation itself,
/// or the parent of the artefact. `None` for root artefacts.
///
/// # Errors
///
/// Returns `EngineError::UnknownHash` when the hash is neither an
/// operation nor an artefact.
pub fn nearest_operation(hub: &Hub, address: &ContentHash) -> Result<Option<Operation>> {
    match Operation::grab(hub, address) {
        Ok(op) => Ok(Some(op)),
        Err(EngineError::Missing { .. }) => {
            if !is_artefact(hub, address)? {
                return Err(EngineError::UnknownHash(address.as_str().to_string()));
            }
            let artefact = Artefact::grab(hub, address)?;
            match artefact.parent {
                Parent::Root => Ok(None),
                Parent::Op(parent) => Ok(Some(Operation::grab(hub, &parent)?)),
            }
        }
        Err(e) => Err(e),
    }
}

/// Dependents of `from` that belong to the DAG instance `dag_key`.
fn dag_dependents(hub: &Hub, dag_key: &str, from: &str) -> Result<BTreeSet<ContentHash>> {
    hashes_of(hub.sinter(
        &key(DAG_OPERATIONS, dag_key),
        &subkey(OPERATIONS, from, "children"),
    )?)
}

/// The key of the DAG instance computing `target`, under an optional
/// sub-DAG path prefix.
#[must_use]
pub fn dag_key_for(target: &ContentHash, subdag: Option<&str>) -> String {
    match subdag {
        Some(path) => format!("{path}/{target}"),
        None => target.as_str().to_string(),
    }
}

/// Materialize the DAG instance needed to produce `address`.
///
/// Writes the operation set, the remaining-parents counters, the explicit
/// terminator record and the global index entry. Counters from a previous
/// run of the same instance are cleared first.
///
/// # Errors
///
/// Propagates hub failures; `EngineError::UnknownHash` for targets that
/// are neither operations nor artefacts.
pub fn build_dag(hub: &Hub, address: &ContentHash, subdag: Option<&str>) -> Result<String> {
    let dag_key = dag_key_for(address, subdag);
    let Some(node) = nearest_operation(hub, address)? else {
        // A lone constant: nothing to compute.
        return Ok(dag_key);
    };

    let mut members = ancestors(hub, &[node.hash.clone()], true)?;
    members.insert(node.hash.clone());
    debug!("{} has {} ancestors", node.hash.short(), members.len() - 1);

    let status_key = key(DAG_STATUS, &dag_key);
    let mut cmds = vec![Cmd::Del {
        key: status_key.clone(),
    }];
    for op in &members {
        let n_parents = hub.scard(&subkey(OPERATIONS, op.as_str(), "parents"))?;
        cmds.push(Cmd::HSet {
            key: status_key.clone(),
            field: op.as_str().to_string(),
            value: n_parents.to_string().into_bytes(),
        });
        cmds.push(Cmd::SAdd {
            key: key(DAG_OPERATIONS, &dag_key),
            member: op.as_str().to_string(),
        });
    }
    cmds.push(Cmd::SAdd {
        key: DAG_INDEX.to_string(),
        member: dag_key.clone(),
    });
    cmds.push(Cmd::Set {
        key: key(DAG_TERMINATOR, &dag_key),
        value: node.hash.as_str().as_bytes().to_vec(),
    });
    hub.pipeline(cmds)?;
    Ok(dag_key)
}

/// Drop every stored DAG instance (not the operations they reference).
///
/// # Errors
///
/// Propagates hub failures.
pub fn delete_all_dags(hub: &Hub) -> Result<()> {
    for dag in hub.smembers(DAG_INDEX)? {
        hub.del(&key(DAG_OPERATIONS, &dag))?;
        hub.del(&key(DAG_STATUS, &dag))?;
        hub.del(&key(DAG_TERMINATOR, &dag))?;
        hub.del(&key(DAG_SUBDAG_PENDING, &dag))?;
    }
    hub.del(DAG_INDEX)?;
    Ok(())
}

/// Dispatch one ready operation: through its queue when distributed,
/// inline otherwise.
fn dispatch(session: &Session, dag_key: &str, op: &ContentHash) -> Result<()> {
    let options = crate::graph::op_options(&session.hub, op)?;
    info!("-> {}", op.short());
    if options.distributed {
        let payload = Job {
            dag: dag_key.to_string(),
            op: op.as_str().to_string(),
        }
        .pack()?;
        session.hub.queue_push(&options.queue, &payload)?;
    } else {
        let _ = task(session, dag_key, op, None)?;
    }
    Ok(())
}

/// Build the DAG for `target` and dispatch every root-ready operation.
///
/// # Errors
///
/// Propagates hub failures.
pub fn start_dag_execution(
    session: &Session,
    target: &ContentHash,
    subdag: Option<&str>,
) -> Result<()> {
    let dag_key = build_dag(&session.hub, target, subdag)?;
    for element in dag_dependents(&session.hub, &dag_key, ROOT)? {
        dispatch(session, &dag_key, &element)?;
    }
    Ok(())
}

/// Per-operation mutual exclusion.
///
/// Returns `true` when this worker may run the op. Stale locks (holder
/// gone from the registry, or registered but busy with a different op)
/// are stolen. Inline runs (`worker = None`) do not lock.
fn acquire_task(hub: &Hub, op: &ContentHash, worker: Option<&str>) -> Result<bool> {
    let Some(me) = worker else {
        return Ok(true);
    };
    let owner_key = subkey(OPERATIONS, op.as_str(), "owner");
    if hub.set_nx(&owner_key, me.as_bytes())? {
        return Ok(true);
    }
    let Some(raw) = hub.get(&owner_key)? else {
        // The holder dropped off between our two reads; try again later to
        // avoid racing the release.
        info!("issue acquiring lock, will try again later");
        return Ok(false);
    };
    let holder = String::from_utf8_lossy(&raw).into_owned();
    info!("job currently held by {holder}");
    if holder == me {
        return Ok(true);
    }
    if !hub.workers()?.contains(&holder) || hub.worker_is_stale(&holder, WORKER_STALE)? {
        warn!("other worker is gone, taking over");
        hub.set(&owner_key, me.as_bytes())?;
        return Ok(true);
    }
    match hub.worker_current_job(&holder)? {
        Some(job) if job == op.as_str() => {
            info!("will try again later");
            Ok(false)
        }
        _ => {
            warn!("other worker has moved on, taking over");
            hub.set(&owner_key, me.as_bytes())?;
            Ok(true)
        }
    }
}

struct OwnerGuard<'a> {
    hub: &'a Hub,
    key: String,
}

impl Drop for OwnerGuard<'_> {
    fn drop(&mut self) {
        // Unconditional release on every exit path, including panics.
        let _ = self.hub.del(&self.key);
    }
}

/// Advance the dependents of `current` within `dag_key`, dispatching any
/// whose remaining-parents counter reaches zero, and integrate finished
/// sub-DAGs back into their parent DAG.
fn enqueue_dependents(session: &Session, dag_key: &str, current: &ContentHash) -> Result<()> {
    let dependents = dag_dependents(&session.hub, dag_key, current.as_str())?;
    info!("has {} dependents", dependents.len());

    let status_key = key(DAG_STATUS, dag_key);
    for dependent in dependents {
        let remaining = session
            .hub
            .hincr_by(&status_key, dependent.as_str(), -1)?;
        if remaining == 0 {
            dispatch(session, dag_key, &dependent)?;
        }
    }

    // When this DAG is a sub-DAG and `current` is its terminator, one of
    // the originating op's generated graphs just finished.
    let terminator = session.hub.get(&key(DAG_TERMINATOR, dag_key))?;
    let is_terminator =
        terminator.as_deref() == Some(current.as_str().as_bytes());
    if is_terminator {
        // A sub-DAG key is <parent dag>/<origin op>/<target>.
        let parts: Vec<&str> = dag_key.rsplitn(3, '/').collect();
        if parts.len() == 3 {
            let origin = ContentHash::from_hex(parts[1])?;
            let parent_dag = parts[2];
            let remaining = session.hub.hincr_by(
                &key(DAG_SUBDAG_PENDING, parent_dag),
                origin.as_str(),
                -1,
            )?;
            if remaining == 0 {
                info!("done evaluating sub-DAGs of {}", origin.short());
                enqueue_dependents(session, parent_dag, &origin)?;
            }
        }
    }
    Ok(())
}

/// Worker-side evaluation of one step in a DAG.
///
/// Acquires the owner lock, dispatches the operation, expands sub-DAGs and
/// advances dependents. The lock is released on every exit path.
///
/// # Errors
///
/// Propagates hub/storage failures and `EngineError::EvaluateDisabled`.
pub fn task(
    session: &Session,
    dag_key: &str,
    current: &ContentHash,
    worker: Option<&str>,
) -> Result<RunStatus> {
    debug!("attempting {} on {:?}", current.short(), worker);

    if !acquire_task(&session.hub, current, worker)? {
        // Contended: retry later from the back of the queue.
        std::thread::sleep(CONTENTION_DELAY);
        let options = crate::graph::op_options(&session.hub, current)?;
        let payload = Job {
            dag: dag_key.to_string(),
            op: current.as_str().to_string(),
        }
        .pack()?;
        session.hub.queue_push(&options.queue, &payload)?;
        return Ok(RunStatus::Delayed);
    }
    let _guard = worker.map(|_| OwnerGuard {
        hub: &session.hub,
        key: subkey(OPERATIONS, current.as_str(), "owner"),
    });

    let op = Operation::grab(&session.hub, current)?;
    let status = run_op(session, &op, op.options.evaluate)?;

    if status == RunStatus::SubdagReady {
        // Resolve each output's link and drive the generated graphs;
        // outputs linking straight to constants need no execution.
        let mut pending = BTreeSet::new();
        for address in op.out.values() {
            let target = resolve_link(&session.hub, address)?;
            let artefact = Artefact::grab(&session.hub, &target)?;
            if let Parent::Op(producer) = artefact.parent {
                pending.insert(producer);
            }
        }
        if pending.is_empty() {
            enqueue_dependents(session, dag_key, current)?;
        } else {
            session.hub.hset(
                &key(DAG_SUBDAG_PENDING, dag_key),
                current.as_str(),
                pending.len().to_string().as_bytes(),
            )?;
            let path = format!("{dag_key}/{current}");
            for producer in pending {
                info!("starting sub-DAG -> {}", producer.short());
                start_dag_execution(session, &producer, Some(&path))?;
            }
        }
    }

    if status.advances() {
        enqueue_dependents(session, dag_key, current)?;
    }
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::funsie::Funsie;
    use crate::graph::{constant_artefact, make_op};
    use crate::options::Options;
    use crate::serdes::{Encoding, Value};
    use std::collections::BTreeMap;

    fn passthrough_funsie(name: &str, n_inp: usize) -> Funsie {
        let inp: BTreeMap<String, Encoding> = (0..n_inp)
            .map(|i| (format!("in{i}"), Encoding::Blob))
            .collect();
        let mut out = BTreeMap::new();
        out.insert("out".to_string(), Encoding::Blob);
        crate::native::native_funsie(name, inp, out, true)
    }

    /// a -> op1 -> op2; separate op3 off the same constant.
    fn chain(session: &Session) -> (Operation, Operation, Operation) {
        let funsie = passthrough_funsie("tests:dag-passthrough", 1);
        let a = constant_artefact(&session.hub, &session.store, &Value::from(b"seed")).unwrap();
        let mut inp = BTreeMap::new();
        inp.insert("in0".to_string(), a.clone());
        let op1 = make_op(&session.hub, &funsie, &inp, &Options::default()).unwrap();

        let mid = Artefact::grab(&session.hub, op1.out.get("out").unwrap()).unwrap();
        let mut inp2 = BTreeMap::new();
        inp2.insert("in0".to_string(), mid);
        let op2 = make_op(&session.hub, &funsie, &inp2, &Options::default()).unwrap();

        let other = passthrough_funsie("tests:dag-other", 1);
        let mut inp3 = BTreeMap::new();
        inp3.insert("in0".to_string(), a);
        let op3 = make_op(&session.hub, &other, &inp3, &Options::default()).unwrap();

        (op1, op2, op3)
    }

    #[test]
    fn ancestors_and_descendants() {
        let session = Session::in_memory();
        let (op1, op2, op3) = chain(&session);

        let ancs = ancestors(&session.hub, &[op2.hash.clone()], false).unwrap();
        assert!(ancs.contains(&op1.hash));
        assert!(!ancs.contains(&op3.hash));

        let descs = descendants(&session.hub, &[op1.hash.clone()]).unwrap();
        assert!(descs.contains(&op2.hash));
        assert!(!descs.contains(&op3.hash));
    }

    #[test]
    fn nearest_operation_resolution() {
        let session = Session::in_memory();
        let (op1, op2, _) = chain(&session);

        // An op resolves to itself.
        let found = nearest_operation(&session.hub, &op2.hash).unwrap().unwrap();
        assert_eq!(found.hash, op2.hash);

        // An artefact resolves to its parent.
        let out = op1.out.get("out").unwrap();
        let found = nearest_operation(&session.hub, out).unwrap().unwrap();
        assert_eq!(found.hash, op1.hash);

        // A constant resolves to nothing.
        let c = constant_artefact(&session.hub, &session.store, &Value::from(b"seed")).unwrap();
        assert!(nearest_operation(&session.hub, &c.hash).unwrap().is_none());

        // Garbage is rejected.
        let junk =
            ContentHash::from_hex("ffff000000000000000000000000000000000000").unwrap();
        assert!(matches!(
            nearest_operation(&session.hub, &junk),
            Err(EngineError::UnknownHash(_))
        ));
    }

    #[test]
    fn build_dag_writes_counters_and_terminator() {
        let session = Session::in_memory();
        let (op1, op2, op3) = chain(&session);

        let target = op2.out.get("out").unwrap();
        let dag_key = build_dag(&session.hub, target, None).unwrap();

        let members = session.hub.smembers(&key(DAG_OPERATIONS, &dag_key)).unwrap();
        assert!(members.contains(op1.hash.as_str()));
        assert!(members.contains(op2.hash.as_str()));
        assert!(!members.contains(op3.hash.as_str()));

        let counters = session.hub.hgetall(&key(DAG_STATUS, &dag_key)).unwrap();
        // op1 hangs off the root sentinel; op2 waits on exactly op1.
        assert_eq!(counters[op1.hash.as_str()], b"1".to_vec());
        assert_eq!(counters[op2.hash.as_str()], b"1".to_vec());

        assert_eq!(
            session.hub.get(&key(DAG_TERMINATOR, &dag_key)).unwrap(),
            Some(op2.hash.as_str().as_bytes().to_vec())
        );
        assert!(session.hub.smembers(DAG_INDEX).unwrap().contains(&dag_key));
    }

    #[test]
    fn acquire_steals_stale_locks() {
        let session = Session::in_memory();
        let (op1, _, _) = chain(&session);
        let owner_key = subkey(OPERATIONS, op1.hash.as_str(), "owner");

        // Fresh lock: we win.
        assert!(acquire_task(&session.hub, &op1.hash, Some("w1")).unwrap());
        // Same worker re-enters.
        assert!(acquire_task(&session.hub, &op1.hash, Some("w1")).unwrap());

        // A registered worker actively on this op keeps the lock.
        let info = convenient_hub::WorkerInfo {
            id: "w1".to_string(),
            queues: vec!["default".to_string()],
            pid: 1,
        };
        session.hub.worker_register(&info).unwrap();
        session.hub.worker_set_job("w1", op1.hash.as_str()).unwrap();
        assert!(!acquire_task(&session.hub, &op1.hash, Some("w2")).unwrap());

        // A registered worker that moved on loses it.
        session.hub.worker_set_job("w1", "somewhere-else").unwrap();
        assert!(acquire_task(&session.hub, &op1.hash, Some("w2")).unwrap());
        assert_eq!(
            session.hub.get(&owner_key).unwrap(),
            Some(b"w2".to_vec())
        );

        // A holder missing from the registry is stolen from.
        session.hub.set(&owner_key, b"ghost").unwrap();
        assert!(acquire_task(&session.hub, &op1.hash, Some("w2")).unwrap());
    }

    #[test]
    fn inline_execution_runs_to_completion() {
        use crate::registry::register_native;
        let session = Session::in_memory();
        register_native("tests:dag-passthrough", |inp| {
            let Ok(v) = &inp["in0"] else {
                return Err("input errored".to_string());
            };
            let mut out = BTreeMap::new();
            out.insert("out".to_string(), v.clone());
            Ok(out)
        });

        let funsie = passthrough_funsie("tests:dag-passthrough", 1);
        let a = constant_artefact(&session.hub, &session.store, &Value::from(b"ping")).unwrap();
        let mut inp = BTreeMap::new();
        inp.insert("in0".to_string(), a);
        let inline = Options {
            distributed: false,
            ..Options::default()
        };
        let op1 = make_op(&session.hub, &funsie, &inp, &inline).unwrap();
        let mid = Artefact::grab(&session.hub, op1.out.get("out").unwrap()).unwrap();
        let mut inp2 = BTreeMap::new();
        inp2.insert("in0".to_string(), mid.clone());
        let op2 = make_op(&session.hub, &funsie, &inp2, &inline).unwrap();

        let target = op2.out.get("out").unwrap().clone();
        start_dag_execution(&session, &target, None).unwrap();

        let final_art = Artefact::grab(&session.hub, &target).unwrap();
        let data = crate::graph::get_data(&session.hub, &session.store, &final_art, None)
            .unwrap()
            .unwrap();
        assert_eq!(data, b"ping");
    }
}
