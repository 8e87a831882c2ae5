//! The process-wide function registry.
//!
//! Funsies do not transport code: the `what` of a native or sub-DAG funsie
//! is a stable name looked up in this table at execution time. Drivers and
//! workers must register the same functions under the same names. Note the
//! flip side: registering different code under an unchanged name changes
//! behaviour without changing any hash, so memoized results go stale until
//! the ops are reset.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock, RwLock};

use crate::errors::{Lifted, Result};
use crate::graph::Artefact;
use crate::serdes::Value;
use crate::session::Session;

/// What a native callable returns: named output values, or a failure
/// message that becomes an `ExceptionRaised` error.
pub type NativeOutput = std::result::Result<BTreeMap<String, Value>, String>;

/// A registered native callable.
pub type NativeFn = Arc<dyn Fn(&BTreeMap<String, Lifted<Value>>) -> NativeOutput + Send + Sync>;

/// A registered sub-DAG generator: builds graph against the session and
/// returns the artefacts standing in for its declared outputs.
pub type SubdagFn = Arc<
    dyn Fn(&Session, &BTreeMap<String, Lifted<Value>>) -> Result<BTreeMap<String, Artefact>>
        + Send
        + Sync,
>;

#[derive(Default)]
struct Registry {
    native: HashMap<String, NativeFn>,
    subdag: HashMap<String, SubdagFn>,
}

fn registry() -> &'static RwLock<Registry> {
    static REGISTRY: OnceLock<RwLock<Registry>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut reg = Registry::default();
        for (name, fun) in crate::template::builtin_natives() {
            reg.native.insert(name, fun);
        }
        RwLock::new(reg)
    })
}

/// Register a native callable under a stable name. Re-registering a name
/// replaces the previous entry.
pub fn register_native<F>(name: impl Into<String>, fun: F)
where
    F: Fn(&BTreeMap<String, Lifted<Value>>) -> NativeOutput + Send + Sync + 'static,
{
    let mut reg = registry().write().expect("registry lock poisoned");
    reg.native.insert(name.into(), Arc::new(fun));
}

/// Register a sub-DAG generator under a stable name.
pub fn register_subdag<F>(name: impl Into<String>, fun: F)
where
    F: Fn(&Session, &BTreeMap<String, Lifted<Value>>) -> Result<BTreeMap<String, Artefact>>
        + Send
        + Sync
        + 'static,
{
    let mut reg = registry().write().expect("registry lock poisoned");
    reg.subdag.insert(name.into(), Arc::new(fun));
}

/// Look up a native callable.
#[must_use]
pub fn lookup_native(name: &str) -> Option<NativeFn> {
    registry()
        .read()
        .expect("registry lock poisoned")
        .native
        .get(name)
        .cloned()
}

/// Look up a sub-DAG generator.
#[must_use]
pub fn lookup_subdag(name: &str) -> Option<SubdagFn> {
    registry()
        .read()
        .expect("registry lock poisoned")
        .subdag
        .get(name)
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_lookup() {
        register_native("tests:echo", |inp| {
            let mut out = BTreeMap::new();
            for (k, v) in inp {
                if let Ok(v) = v {
                    out.insert(k.clone(), v.clone());
                }
            }
            Ok(out)
        });
        let fun = lookup_native("tests:echo").expect("registered");
        let mut inp = BTreeMap::new();
        inp.insert("a".to_string(), Ok(Value::from(b"x")));
        let out = fun(&inp).unwrap();
        assert_eq!(out["a"], Value::from(b"x"));

        assert!(lookup_native("tests:unregistered").is_none());
    }
}
