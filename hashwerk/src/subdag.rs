//! Sub-DAG funsies.
//!
//! A sub-DAG funsie names a registered generator that, given its decoded
//! inputs, builds more graph and returns the artefacts standing in for its
//! declared outputs. The runner writes those outputs as linked artefacts;
//! actually executing the generated graph is the scheduler's job.

use std::collections::BTreeMap;

use tracing::{info, warn};

use crate::errors::Lifted;
use crate::funsie::{Funsie, FunsieHow};
use crate::graph::Artefact;
use crate::registry::lookup_subdag;
use crate::run::RunFailure;
use crate::serdes::{Encoding, Value};
use crate::session::Session;

/// Describe a sub-DAG generator funsie.
#[must_use]
pub fn subdag_funsie(
    name: impl Into<String>,
    inp: BTreeMap<String, Encoding>,
    out: BTreeMap<String, Encoding>,
    strict: bool,
) -> Funsie {
    Funsie::new(FunsieHow::Subdag, name, inp, out, BTreeMap::new(), !strict)
}

/// Run a sub-DAG generator. Returns the artefact each declared output
/// should link to, or `None` for outputs the generator failed to provide.
pub(crate) fn run_subdag_funsie(
    session: &Session,
    funsie: &Funsie,
    inputs: &BTreeMap<String, Lifted<Value>>,
) -> std::result::Result<BTreeMap<String, Option<Artefact>>, RunFailure> {
    let Some(fun) = lookup_subdag(&funsie.what) else {
        return Err(RunFailure::Raised(format!(
            "no sub-DAG generator registered under name {}",
            funsie.what
        )));
    };
    info!("$> {} sub-DAG generator", funsie.what);

    let generated = fun(session, inputs).map_err(|e| RunFailure::Raised(e.to_string()))?;

    let mut out = BTreeMap::new();
    for name in funsie.out.keys() {
        match generated.get(name) {
            Some(artefact) => {
                out.insert(name.clone(), Some(artefact.clone()));
            }
            None => {
                warn!("missing expected output {name}");
                out.insert(name.clone(), None);
            }
        }
    }
    Ok(out)
}
