//! Running a single operation.
//!
//! `run_op` is the funsie-agnostic half of execution: it decides whether
//! anything needs to run at all (memoization), loads and decodes inputs,
//! short-circuits input errors, dispatches to the funsie-specific runner
//! and persists whatever comes back — values or errors.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::errors::{EngineError, Error, ErrorKind, Lifted, Result};
use crate::funsie::{Funsie, FunsieHow};
use crate::graph::{
    get_data, get_status, mark_error, set_data, write_link, Artefact, ArtefactStatus,
    Operation, Parent,
};
use crate::hashes::ContentHash;
use crate::native::run_native_funsie;
use crate::session::Session;
use crate::shell::run_shell_funsie;
use crate::subdag::run_subdag_funsie;
use convenient_hub::Cmd;

use crate::constants::{subkey, OPERATIONS};

/// What happened when a task dispatched an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Some input is not ready; nothing was written.
    UnmetDependencies,
    /// Another worker holds the lock; the task was re-enqueued.
    Delayed,
    /// The runner executed (or failed, writing errors to every output).
    Executed,
    /// All outputs already computed; nothing ran.
    UsingCached,
    /// A non-tolerated input error was propagated to every output.
    InputError,
    /// A sub-DAG was generated; outputs are linked, not computed.
    SubdagReady,
}

impl RunStatus {
    /// Whether dependents of this operation may be dispatched now.
    ///
    /// Sub-DAG generation explicitly does not advance: dependents wait for
    /// the sub-DAG terminator.
    #[must_use]
    pub fn advances(self) -> bool {
        matches!(
            self,
            RunStatus::Executed | RunStatus::UsingCached | RunStatus::InputError
        )
    }
}

/// A value produced for one declared output.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum OutValue {
    /// Encoded payload, ready to store.
    Data(Vec<u8>),
    /// The runner did not produce this output.
    Missing,
    /// The runner produced an error for this output.
    Errored(Error),
}

/// Why a runner failed as a whole.
#[derive(Debug, Clone)]
pub(crate) enum RunFailure {
    /// Wall-clock deadline expired.
    TimedOut(String),
    /// The worker was told to die by an external signal.
    Killed(String),
    /// The callable (or its plumbing) failed.
    Raised(String),
}

pub(crate) type RunnerResult = std::result::Result<BTreeMap<String, OutValue>, RunFailure>;

/// Whether every output of the operation is already computed.
///
/// # Errors
///
/// Propagates hub failures.
pub fn is_op_cached(session: &Session, op: &Operation) -> Result<bool> {
    for address in op.out.values() {
        if !get_status(&session.hub, address)?.is_ready() {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Whether every input of the operation is ready to read.
///
/// # Errors
///
/// Propagates hub failures.
pub fn dependencies_met(session: &Session, op: &Operation) -> Result<bool> {
    for address in op.inp.values() {
        if !get_status(&session.hub, address)?.is_ready() {
            return Ok(false);
        }
    }
    Ok(true)
}

fn mark_all_outputs(session: &Session, op: &Operation, err: &Error) -> Result<()> {
    for address in op.out.values() {
        mark_error(&session.hub, address, err)?;
    }
    Ok(())
}

fn with_source(mut err: Error, op: &ContentHash) -> Error {
    if err.source.is_none() {
        err.source = Some(op.clone());
    }
    err
}

/// Execute one operation against the session.
///
/// # Errors
///
/// Returns `EngineError::EvaluateDisabled` for ops built with
/// `evaluate = false`, and propagates hub/storage failures. Failures of
/// the user computation are not engine errors; they land in the output
/// artefacts.
pub fn run_op(session: &Session, op: &Operation, evaluate: bool) -> Result<RunStatus> {
    info!("=== {} ===", op.hash);

    if !evaluate {
        return Err(EngineError::EvaluateDisabled(op.hash.as_str().to_string()));
    }

    if is_op_cached(session, op)? {
        info!("DONE: using cached data");
        return Ok(RunStatus::UsingCached);
    }

    if !dependencies_met(session, op)? {
        info!("DONE: waiting on dependencies");
        return Ok(RunStatus::UnmetDependencies);
    }

    let funsie = Funsie::grab(&session.hub, &op.funsie)?;

    // Load and decode inputs.
    let mut raw: BTreeMap<String, Lifted<Vec<u8>>> = BTreeMap::new();
    for (name, address) in &op.inp {
        let artefact = Artefact::grab(&session.hub, address)?;
        raw.insert(
            name.clone(),
            get_data(&session.hub, &session.store, &artefact, Some(&op.hash))?,
        );
    }
    let decoded = funsie.decode_inputs(&raw, Some(&op.hash));

    if !funsie.error_tolerant {
        for (name, value) in &decoded {
            if let Err(err) = value {
                mark_all_outputs(session, op, err)?;
                error!("DONE: error on input {name} (fragile)");
                return Ok(RunStatus::InputError);
            }
        }
    }

    let deadline = if op.options.timeout >= 0 {
        Some(Instant::now() + Duration::from_secs(op.options.timeout.unsigned_abs()))
    } else {
        None
    };

    info!("running...");
    let outcome = match funsie.how {
        FunsieHow::Native => run_native_funsie(&funsie, &decoded, deadline),
        FunsieHow::Shell => run_shell_funsie(&funsie, &decoded, deadline),
        FunsieHow::Subdag => {
            return match run_subdag_funsie(session, &funsie, &decoded) {
                Ok(generated) => {
                    for (name, target) in generated {
                        let alias = &op.out[&name];
                        match target {
                            Some(artefact) => {
                                write_link(&session.hub, alias, &artefact.hash)?;
                                // Index the producing op so DAG rebuilds can
                                // traverse into the generated graph.
                                if let Parent::Op(producer) = &artefact.parent {
                                    session.hub.pipeline(vec![Cmd::SAdd {
                                        key: subkey(
                                            OPERATIONS,
                                            op.hash.as_str(),
                                            "parents.subdag",
                                        ),
                                        member: producer.as_str().to_string(),
                                    }])?;
                                }
                            }
                            None => mark_error(
                                &session.hub,
                                alias,
                                &Error::new(ErrorKind::MissingOutput)
                                    .with_source(op.hash.clone())
                                    .with_details("output not returned by generator"),
                            )?,
                        }
                    }
                    info!("DONE: sub-DAG generated");
                    Ok(RunStatus::SubdagReady)
                }
                Err(failure) => {
                    persist_failure(session, op, &failure)?;
                    Ok(RunStatus::Executed)
                }
            };
        }
    };

    match outcome {
        Err(failure) => {
            persist_failure(session, op, &failure)?;
            Ok(RunStatus::Executed)
        }
        Ok(outputs) => {
            for (name, value) in outputs {
                let address = &op.out[&name];
                match value {
                    OutValue::Data(bytes) => {
                        set_data(
                            &session.hub,
                            &session.store,
                            address,
                            &bytes,
                            ArtefactStatus::Done,
                        )?;
                    }
                    OutValue::Missing => {
                        warn!("no output data for {name}");
                        mark_error(
                            &session.hub,
                            address,
                            &Error::new(ErrorKind::MissingOutput)
                                .with_source(op.hash.clone())
                                .with_details("output not returned by runner"),
                        )?;
                    }
                    OutValue::Errored(err) => {
                        mark_error(&session.hub, address, &with_source(err, &op.hash))?;
                    }
                }
            }
            info!("DONE: successful eval");
            Ok(RunStatus::Executed)
        }
    }
}

fn persist_failure(session: &Session, op: &Operation, failure: &RunFailure) -> Result<()> {
    let err = match failure {
        RunFailure::TimedOut(details) => {
            error!("DONE: runner timed out");
            Error::new(ErrorKind::JobTimedOut)
                .with_source(op.hash.clone())
                .with_details(details.clone())
        }
        RunFailure::Killed(details) => {
            error!("DONE: runner killed by signal");
            Error::new(ErrorKind::KilledBySignal)
                .with_source(op.hash.clone())
                .with_details(details.clone())
        }
        RunFailure::Raised(details) => {
            error!("DONE: runner raised");
            Error::new(ErrorKind::ExceptionRaised)
                .with_source(op.hash.clone())
                .with_details(details.clone())
        }
    };
    mark_all_outputs(session, op, &err)
}
