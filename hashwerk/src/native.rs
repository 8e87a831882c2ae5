//! Native-function funsies.
//!
//! A native funsie runs a host-language function registered in the
//! process-wide registry. The callable receives decoded input values (with
//! errors passed through for tolerant funsies) and returns named output
//! values; it runs on a helper thread so a wall-clock deadline can be
//! enforced. A callable that outlives its deadline is abandoned, not
//! killed.

use std::collections::BTreeMap;
use std::sync::mpsc;
use std::thread;
use std::time::Instant;

use tracing::{debug, info};

use crate::errors::Lifted;
use crate::funsie::{Funsie, FunsieHow};
use crate::registry::lookup_native;
use crate::run::{OutValue, RunFailure, RunnerResult};
use crate::serdes::{encode, Encoding, Value};

/// Describe a native-function funsie.
///
/// `name` is the registry key; it is the semantic identity of the funsie
/// and the only thing hashed about the code.
#[must_use]
pub fn native_funsie(
    name: impl Into<String>,
    inp: BTreeMap<String, Encoding>,
    out: BTreeMap<String, Encoding>,
    strict: bool,
) -> Funsie {
    Funsie::new(FunsieHow::Native, name, inp, out, BTreeMap::new(), !strict)
}

/// Execute a native funsie against decoded inputs.
pub(crate) fn run_native_funsie(
    funsie: &Funsie,
    inputs: &BTreeMap<String, Lifted<Value>>,
    deadline: Option<Instant>,
) -> RunnerResult {
    let Some(fun) = lookup_native(&funsie.what) else {
        return Err(RunFailure::Raised(format!(
            "no function registered under name {}",
            funsie.what
        )));
    };
    info!("$> {}(...)", funsie.what);

    let inputs = inputs.clone();
    let (tx, rx) = mpsc::channel();
    let started = Instant::now();
    // The callable runs on its own thread so the deadline can be enforced
    // from here. A callable that outlives the deadline keeps running
    // detached; threads cannot be killed.
    thread::spawn(move || {
        let _ = tx.send(fun(&inputs));
    });

    let outcome = match deadline {
        Some(deadline) => rx
            .recv_timeout(deadline.saturating_duration_since(Instant::now()))
            .map_err(|e| match e {
                mpsc::RecvTimeoutError::Timeout => RunFailure::TimedOut(format!(
                    "function {} exceeded its deadline",
                    funsie.what
                )),
                mpsc::RecvTimeoutError::Disconnected => {
                    RunFailure::Raised(format!("function {} panicked", funsie.what))
                }
            })?,
        None => rx.recv().map_err(|_| {
            RunFailure::Raised(format!("function {} panicked", funsie.what))
        })?,
    };
    debug!("done 1/1\t\tduration: {:.2}s", started.elapsed().as_secs_f64());

    let mut returned = outcome.map_err(RunFailure::Raised)?;

    let mut out = BTreeMap::new();
    for (name, enc) in &funsie.out {
        let slot = match returned.remove(name) {
            None => OutValue::Missing,
            Some(value) => match encode(*enc, &value) {
                Ok(bytes) => OutValue::Data(bytes),
                Err(err) => OutValue::Errored(err),
            },
        };
        out.insert(name.clone(), slot);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::register_native;
    use std::time::Duration;

    fn blob_sig(inputs: &[&str], outputs: &[&str]) -> (BTreeMap<String, Encoding>, BTreeMap<String, Encoding>) {
        (
            inputs
                .iter()
                .map(|k| ((*k).to_string(), Encoding::Blob))
                .collect(),
            outputs
                .iter()
                .map(|k| ((*k).to_string(), Encoding::Blob))
                .collect(),
        )
    }

    #[test]
    fn runs_registered_function() {
        register_native("tests:upper", |inp| {
            let Ok(Value::Bytes(data)) = &inp["x"] else {
                return Err("bad input".to_string());
            };
            let mut out = BTreeMap::new();
            out.insert(
                "out".to_string(),
                Value::Bytes(data.to_ascii_uppercase()),
            );
            Ok(out)
        });
        let (inp, out) = blob_sig(&["x"], &["out"]);
        let funsie = native_funsie("tests:upper", inp, out, true);

        let mut inputs = BTreeMap::new();
        inputs.insert("x".to_string(), Ok(Value::from(b"bla bla")));
        let result = run_native_funsie(&funsie, &inputs, None).unwrap();
        assert_eq!(result["out"], OutValue::Data(b"BLA BLA".to_vec()));
    }

    #[test]
    fn missing_registration_raises() {
        let (inp, out) = blob_sig(&[], &["out"]);
        let funsie = native_funsie("tests:never-registered", inp, out, true);
        assert!(matches!(
            run_native_funsie(&funsie, &BTreeMap::new(), None),
            Err(RunFailure::Raised(_))
        ));
    }

    #[test]
    fn missing_output_key_is_reported() {
        register_native("tests:forgetful", |_| Ok(BTreeMap::new()));
        let (inp, out) = blob_sig(&[], &["out"]);
        let funsie = native_funsie("tests:forgetful", inp, out, true);
        let result = run_native_funsie(&funsie, &BTreeMap::new(), None).unwrap();
        assert_eq!(result["out"], OutValue::Missing);
    }

    #[test]
    fn wrong_value_kind_is_an_errored_output() {
        register_native("tests:bytes-as-json", |_| {
            let mut out = BTreeMap::new();
            out.insert("out".to_string(), Value::Bytes(vec![1, 2]));
            Ok(out)
        });
        let inp = BTreeMap::new();
        let mut out = BTreeMap::new();
        out.insert("out".to_string(), Encoding::Json);
        let funsie = native_funsie("tests:bytes-as-json", inp, out, true);
        let result = run_native_funsie(&funsie, &BTreeMap::new(), None).unwrap();
        assert!(matches!(result["out"], OutValue::Errored(_)));
    }

    #[test]
    fn deadline_is_enforced() {
        register_native("tests:sleepy", |_| {
            std::thread::sleep(Duration::from_secs(3));
            Ok(BTreeMap::new())
        });
        let (inp, out) = blob_sig(&[], &["out"]);
        let funsie = native_funsie("tests:sleepy", inp, out, true);
        let started = Instant::now();
        let result = run_native_funsie(
            &funsie,
            &BTreeMap::new(),
            Some(Instant::now() + Duration::from_millis(100)),
        );
        assert!(matches!(result, Err(RunFailure::TimedOut(_))));
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
