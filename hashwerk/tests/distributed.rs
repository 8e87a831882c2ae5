//! Distributed-execution tests: real queues, worker threads, locks.
//!
//! Workers here are burst-mode threads sharing one in-process hub, which
//! is exactly the coordination surface real multi-process workers use.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use hashwerk::{
    self as hw, execute, morph, put, run_worker, take, wait_for, Session, Value,
};

fn spawn_workers(session: &Session, n: usize) -> Vec<thread::JoinHandle<()>> {
    (0..n)
        .map(|_| {
            let session = session.clone();
            thread::spawn(move || {
                run_worker(&session, vec!["default".to_string()], true).expect("worker runs");
            })
        })
        .collect()
}

#[test]
fn chain_executes_across_workers_in_order() {
    static ORDER: AtomicUsize = AtomicUsize::new(0);
    static FIRST_AT: AtomicUsize = AtomicUsize::new(usize::MAX);
    static SECOND_AT: AtomicUsize = AtomicUsize::new(usize::MAX);

    let session = Session::in_memory();
    let a = put(&session, b"payload").unwrap();
    let b = morph(
        &session,
        "dist-first",
        |v| {
            FIRST_AT.store(ORDER.fetch_add(1, Ordering::SeqCst), Ordering::SeqCst);
            Ok(v)
        },
        &a,
        None,
    )
    .unwrap();
    let c = morph(
        &session,
        "dist-second",
        |v| {
            SECOND_AT.store(ORDER.fetch_add(1, Ordering::SeqCst), Ordering::SeqCst);
            Ok(v)
        },
        &b,
        None,
    )
    .unwrap();

    execute(&session, &c).unwrap();
    let workers = spawn_workers(&session, 3);
    wait_for(&session, &c, Some(Duration::from_secs(10))).unwrap();
    for w in workers {
        w.join().unwrap();
    }

    assert_eq!(take(&session, &c).unwrap(), b"payload");
    // No dependent ran before its parent.
    assert!(FIRST_AT.load(Ordering::SeqCst) < SECOND_AT.load(Ordering::SeqCst));
}

#[test]
fn one_executor_per_operation_even_with_duplicate_jobs() {
    static CONCURRENT: AtomicUsize = AtomicUsize::new(0);
    static PEAK: AtomicUsize = AtomicUsize::new(0);
    static RUNS: AtomicUsize = AtomicUsize::new(0);

    let session = Session::in_memory();
    let a = put(&session, b"once").unwrap();
    let b = morph(
        &session,
        "dist-exclusive",
        |v| {
            let now = CONCURRENT.fetch_add(1, Ordering::SeqCst) + 1;
            PEAK.fetch_max(now, Ordering::SeqCst);
            RUNS.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(100));
            CONCURRENT.fetch_sub(1, Ordering::SeqCst);
            Ok(v)
        },
        &a,
        None,
    )
    .unwrap();

    // Enqueue the same target several times: the owner lock must keep the
    // operation single-executor, and memoization must keep it single-run.
    execute(&session, &b).unwrap();
    execute(&session, &b).unwrap();
    execute(&session, &b).unwrap();

    let workers = spawn_workers(&session, 4);
    wait_for(&session, &b, Some(Duration::from_secs(10))).unwrap();
    for w in workers {
        w.join().unwrap();
    }

    assert_eq!(take(&session, &b).unwrap(), b"once");
    assert_eq!(PEAK.load(Ordering::SeqCst), 1);
    assert_eq!(RUNS.load(Ordering::SeqCst), 1);
}

#[test]
fn stale_lock_of_dead_worker_is_stolen() {
    let session = Session::in_memory();
    let a = put(&session, b"locked").unwrap();
    let b = morph(&session, "dist-stale", |v| Ok(v), &a, None).unwrap();

    // Simulate a worker that died mid-task: lock held, not registered.
    let parent = match &b.parent {
        hw::Parent::Op(h) => h.clone(),
        hw::Parent::Root => panic!("morph output has a parent"),
    };
    session
        .hub
        .set(
            &format!("operations:{}:owner", parent.as_str()),
            b"dead-worker-666",
        )
        .unwrap();

    execute(&session, &b).unwrap();
    let workers = spawn_workers(&session, 1);
    wait_for(&session, &b, Some(Duration::from_secs(10))).unwrap();
    for w in workers {
        w.join().unwrap();
    }
    assert_eq!(take(&session, &b).unwrap(), b"locked");

    // The thief released the lock when it finished.
    assert!(!session
        .hub
        .exists(&format!("operations:{}:owner", parent.as_str()))
        .unwrap());
}

#[test]
fn burst_workers_drain_diamond_graphs() {
    let session = Session::in_memory();
    let a = put(&session, 10i64).unwrap();

    let double = morph(
        &session,
        "dist-double",
        |v| match v {
            Value::Json(j) => Ok(Value::from(2 * j.as_i64().unwrap_or(0))),
            Value::Bytes(_) => Err("expected json".to_string()),
        },
        &a,
        None,
    )
    .unwrap();
    let triple = morph(
        &session,
        "dist-triple",
        |v| match v {
            Value::Json(j) => Ok(Value::from(3 * j.as_i64().unwrap_or(0))),
            Value::Bytes(_) => Err("expected json".to_string()),
        },
        &a,
        None,
    )
    .unwrap();
    let sum = hw::reduce(
        &session,
        "dist-sum",
        |values| {
            let mut total = 0;
            for v in &values {
                match v {
                    Value::Json(j) => total += j.as_i64().unwrap_or(0),
                    Value::Bytes(_) => return Err("expected json".to_string()),
                }
            }
            Ok(Value::from(total))
        },
        vec![double.into(), triple.into()],
        None,
    )
    .unwrap();

    execute(&session, &sum).unwrap();
    let workers = spawn_workers(&session, 2);
    wait_for(&session, &sum, Some(Duration::from_secs(10))).unwrap();
    for w in workers {
        w.join().unwrap();
    }

    assert_eq!(
        hw::take_value(&session, &sum).unwrap(),
        Value::Json(serde_json::json!(50))
    );
    // All workers deregistered cleanly.
    assert!(session.hub.workers().unwrap().is_empty());
}
