//! The user-facing builder API.
//!
//! These are the functions workflows are written with: `put` constants,
//! wire up `shell` commands and native functions (`mapping`, `morph`,
//! `reduce`, `template`), then `execute`, `wait_for` and `take` results.
//! Everything takes the session handle explicitly.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::constants::ROOT;
use crate::dag::{descendants, start_dag_execution};
use crate::errors::{unwrap_lifted, EngineError, Lifted, Result};
use crate::graph::{
    constant_artefact, delete_artefact, get_data, get_status, make_op, resolve_link, Artefact,
    Operation, Parent,
};
use crate::hashes::ContentHash;
use crate::native::native_funsie;
use crate::options::Options;
use crate::registry::register_native;
use crate::run::is_op_cached;
use crate::serdes::{decode, Encoding, Value};
use crate::session::Session;
use crate::shell::{shell_funsie, ShellOutput};
use crate::template::{ENV_SLOT, RENDER_RAW, RENDER_STRIPPED, TEMPLATE_SLOT};

const WAIT_POLL: Duration = Duration::from_millis(300);

// ---------------------------------------------------------------------------
// Inputs and targets

/// Something usable as an operation input: an existing artefact or a
/// literal value stored on the fly.
#[derive(Debug, Clone)]
pub enum Input {
    /// Use this artefact.
    Artefact(Artefact),
    /// Store this value as a constant first.
    Literal(Value),
}

impl From<Artefact> for Input {
    fn from(a: Artefact) -> Self {
        Input::Artefact(a)
    }
}

impl From<&Artefact> for Input {
    fn from(a: &Artefact) -> Self {
        Input::Artefact(a.clone())
    }
}

impl From<Value> for Input {
    fn from(v: Value) -> Self {
        Input::Literal(v)
    }
}

impl From<&str> for Input {
    fn from(v: &str) -> Self {
        Input::Literal(v.into())
    }
}

impl From<&[u8]> for Input {
    fn from(v: &[u8]) -> Self {
        Input::Literal(v.into())
    }
}

impl<const N: usize> From<&[u8; N]> for Input {
    fn from(v: &[u8; N]) -> Self {
        Input::Literal(v.into())
    }
}

impl From<Vec<u8>> for Input {
    fn from(v: Vec<u8>) -> Self {
        Input::Literal(v.into())
    }
}

impl From<i64> for Input {
    fn from(v: i64) -> Self {
        Input::Literal(v.into())
    }
}

impl From<serde_json::Value> for Input {
    fn from(v: serde_json::Value) -> Self {
        Input::Literal(v.into())
    }
}

fn resolve_input(session: &Session, input: Input) -> Result<Artefact> {
    match input {
        Input::Artefact(a) => Ok(a),
        Input::Literal(v) => constant_artefact(&session.hub, &session.store, &v),
    }
}

/// Something the engine can execute or wait on.
pub trait Target {
    /// Hash to build the DAG from.
    fn target_hash(&self) -> &ContentHash;
    /// The operation to watch, when the target is one.
    fn target_operation(&self) -> Option<&Operation> {
        None
    }
}

impl Target for Artefact {
    fn target_hash(&self) -> &ContentHash {
        &self.hash
    }
}

impl Target for Operation {
    fn target_hash(&self) -> &ContentHash {
        &self.hash
    }
    fn target_operation(&self) -> Option<&Operation> {
        Some(self)
    }
}

impl Target for ShellOutput {
    fn target_hash(&self) -> &ContentHash {
        &self.hash
    }
    fn target_operation(&self) -> Option<&Operation> {
        Some(&self.op)
    }
}

// ---------------------------------------------------------------------------
// Constants and data access

/// Store a constant artefact. Bytes and strings become blobs, anything
/// else becomes JSON.
///
/// # Errors
///
/// Propagates hub/storage failures.
pub fn put(session: &Session, value: impl Into<Value>) -> Result<Artefact> {
    constant_artefact(&session.hub, &session.store, &value.into())
}

/// Read an artefact's bytes, raising on stored errors.
///
/// # Errors
///
/// Returns `EngineError::Unwrap` when the artefact holds an error.
pub fn take(session: &Session, artefact: &Artefact) -> Result<Vec<u8>> {
    unwrap_lifted(take_result(session, artefact)?)
}

/// Read an artefact's bytes or its stored error.
///
/// # Errors
///
/// Propagates hub/storage failures only; data errors are inside the
/// `Lifted`.
pub fn take_result(session: &Session, artefact: &Artefact) -> Result<Lifted<Vec<u8>>> {
    let data = get_data(&session.hub, &session.store, artefact, None)?;
    if data.is_err() {
        warn!("data error at hash {}", artefact.hash.short());
    }
    Ok(data)
}

/// Read and decode an artefact according to its declared kind.
///
/// # Errors
///
/// Returns `EngineError::Unwrap` on stored errors or codec failures.
pub fn take_value(session: &Session, artefact: &Artefact) -> Result<Value> {
    let bytes = take(session, artefact)?;
    unwrap_lifted(decode(artefact.kind, &bytes, None))
}

/// `take` and write the bytes to a file.
///
/// # Errors
///
/// Returns `EngineError::Unwrap` on stored errors and propagates I/O
/// failures.
pub fn takeout(session: &Session, artefact: &Artefact, path: impl AsRef<Path>) -> Result<()> {
    let data = take(session, artefact)?;
    std::fs::write(path, data).map_err(|e| EngineError::Store(e.into()))
}

// ---------------------------------------------------------------------------
// Execution

/// Start DAG execution toward a target.
///
/// # Errors
///
/// Propagates hub failures.
pub fn execute(session: &Session, target: &impl Target) -> Result<()> {
    start_dag_execution(session, target.target_hash(), None)
}

/// Block until a target is computed, polling its status.
///
/// Artefact targets are satisfied once their (link-resolved) status is
/// ready; operation targets once every output is.
///
/// # Errors
///
/// Returns `EngineError::WaitTimeout` when `timeout` elapses first.
pub fn wait_for(
    session: &Session,
    target: &impl Target,
    timeout: Option<Duration>,
) -> Result<()> {
    let started = Instant::now();
    let op = target.target_operation().cloned();
    loop {
        let ready = match &op {
            Some(op) => is_op_cached(session, op)?,
            None => {
                let resolved = resolve_link(&session.hub, target.target_hash())?;
                get_status(&session.hub, &resolved)?.is_ready()
            }
        };
        if ready {
            return Ok(());
        }
        if let Some(timeout) = timeout {
            if started.elapsed() > timeout {
                return Err(EngineError::WaitTimeout {
                    target: target.target_hash().short().to_string(),
                    waited: started.elapsed().as_secs_f64(),
                });
            }
        }
        std::thread::sleep(WAIT_POLL);
    }
}

/// Invalidate the outputs of an operation and, by default, of every
/// operation downstream of it.
///
/// # Errors
///
/// Returns `EngineError::ResetConst` when pointed at a constant.
pub fn reset(session: &Session, target: &impl Target, recursive: bool) -> Result<()> {
    let op = match target.target_operation() {
        Some(op) => op.clone(),
        None => {
            let artefact = Artefact::grab(&session.hub, target.target_hash())?;
            match artefact.parent {
                Parent::Root => return Err(EngineError::ResetConst),
                Parent::Op(parent) => Operation::grab(&session.hub, &parent)?,
            }
        }
    };
    reset_op(session, &op)?;
    if recursive {
        for descendant in descendants(&session.hub, &[op.hash.clone()])? {
            let op = Operation::grab(&session.hub, &descendant)?;
            reset_op(session, &op)?;
        }
    }
    Ok(())
}

fn reset_op(session: &Session, op: &Operation) -> Result<()> {
    for address in op.out.values() {
        delete_artefact(&session.hub, &session.store, address)?;
    }
    Ok(())
}

fn finish_op(session: &Session, op: &Operation) -> Result<()> {
    if op.options.reset {
        reset_op(session, op)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Shell

/// Builder for a shell operation.
///
/// ```no_run
/// # use hashwerk::{Session, Shell};
/// # fn example(session: &Session) -> hashwerk::Result<()> {
/// let merged = Shell::new()
///     .cmd("cat f1 f2")
///     .input("f1", b"first")
///     .input("f2", b"second")
///     .call(session)?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct Shell {
    cmds: Vec<String>,
    inputs: Vec<(String, Input)>,
    outputs: Vec<String>,
    env: Option<BTreeMap<String, String>>,
    strict: bool,
    options: Option<Options>,
}

impl Shell {
    /// Start an empty shell operation.
    #[must_use]
    pub fn new() -> Self {
        Self {
            strict: true,
            ..Self::default()
        }
    }

    /// Append a command line.
    #[must_use]
    pub fn cmd(mut self, line: impl Into<String>) -> Self {
        self.cmds.push(line.into());
        self
    }

    /// Add an input file.
    #[must_use]
    pub fn input(mut self, name: impl Into<String>, value: impl Into<Input>) -> Self {
        self.inputs.push((name.into(), value.into()));
        self
    }

    /// Declare an output file to read back.
    #[must_use]
    pub fn output(mut self, name: impl Into<String>) -> Self {
        self.outputs.push(name.into());
        self
    }

    /// Set an environment variable for the commands (merged onto the
    /// worker environment, not hashed).
    #[must_use]
    pub fn env_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env
            .get_or_insert_with(BTreeMap::new)
            .insert(name.into(), value.into());
        self
    }

    /// Pass input errors through instead of short-circuiting.
    #[must_use]
    pub fn tolerant(mut self) -> Self {
        self.strict = false;
        self
    }

    /// Override the session's default options.
    #[must_use]
    pub fn with_options(mut self, options: Options) -> Self {
        self.options = Some(options);
        self
    }

    /// Build the funsie and operation against a session.
    ///
    /// # Errors
    ///
    /// Propagates hub/storage failures.
    pub fn call(self, session: &Session) -> Result<ShellOutput> {
        let options = self.options.unwrap_or_else(|| session.options());
        let mut inputs = BTreeMap::new();
        let mut input_names = Vec::new();
        for (name, input) in self.inputs {
            input_names.push(name.clone());
            inputs.insert(name, resolve_input(session, input)?);
        }
        let funsie = shell_funsie(
            &self.cmds,
            &input_names,
            &self.outputs,
            self.env.as_ref(),
            self.strict,
        )?;
        let op = make_op(&session.hub, &funsie, &inputs, &options)?;
        finish_op(session, &op)?;
        ShellOutput::new(&session.hub, op)
    }
}

// ---------------------------------------------------------------------------
// Native functions

/// What a `mapping` callable returns.
pub type MapOutput = std::result::Result<Vec<Value>, String>;

fn positional_adapter<F>(
    registered: &str,
    arg_names: Vec<String>,
    out_names: Vec<String>,
    fun: F,
) where
    F: Fn(Vec<Lifted<Value>>) -> MapOutput + Send + Sync + 'static,
{
    let name = registered.to_string();
    register_native(registered, move |inputs| {
        let args: Vec<Lifted<Value>> = arg_names
            .iter()
            .map(|k| {
                inputs
                    .get(k)
                    .cloned()
                    .unwrap_or_else(|| Err(crate::errors::Error::new(
                        crate::errors::ErrorKind::MissingInput,
                    )))
            })
            .collect();
        let returned = fun(args)?;
        if returned.len() != out_names.len() {
            return Err(format!(
                "{name} returned {} values, {} declared",
                returned.len(),
                out_names.len()
            ));
        }
        Ok(out_names.iter().cloned().zip(returned).collect())
    });
}

/// Add a many-to-many native function to the workflow.
///
/// `name` is the stable identity of the function: workers must register
/// the same computation under the same name (which this call does for the
/// local process), and changing the code without changing the name will
/// not recompute anything.
///
/// # Errors
///
/// Propagates hub/storage failures.
pub fn mapping<F>(
    session: &Session,
    name: &str,
    fun: F,
    inputs: Vec<Input>,
    out_kinds: &[Encoding],
    strict: bool,
    options: Option<Options>,
) -> Result<Vec<Artefact>>
where
    F: Fn(Vec<Lifted<Value>>) -> MapOutput + Send + Sync + 'static,
{
    let options = options.unwrap_or_else(|| session.options());
    let registered = format!("mapping_{}:{name}", inputs.len());

    let mut artefacts = BTreeMap::new();
    let mut arg_names = Vec::new();
    for (k, input) in inputs.into_iter().enumerate() {
        let arg = format!("in{k}");
        arg_names.push(arg.clone());
        artefacts.insert(arg, resolve_input(session, input)?);
    }

    let out_names: Vec<String> = if out_kinds.len() == 1 {
        vec!["out".to_string()]
    } else {
        (0..out_kinds.len()).map(|k| format!("out{k}")).collect()
    };

    positional_adapter(&registered, arg_names.clone(), out_names.clone(), fun);

    let inp_kinds: BTreeMap<String, Encoding> = arg_names
        .iter()
        .map(|arg| (arg.clone(), artefacts[arg].kind))
        .collect();
    let out_map: BTreeMap<String, Encoding> = out_names
        .iter()
        .cloned()
        .zip(out_kinds.iter().copied())
        .collect();

    let funsie = native_funsie(registered, inp_kinds, out_map, strict);
    let op = make_op(&session.hub, &funsie, &artefacts, &options)?;
    finish_op(session, &op)?;

    out_names
        .iter()
        .map(|name| Artefact::grab(&session.hub, &op.out[name]))
        .collect()
}

/// Add a one-to-one native function `y = f(x)`. The output kind is
/// inherited from the input artefact.
///
/// # Errors
///
/// Propagates hub/storage failures.
pub fn morph<F>(
    session: &Session,
    name: &str,
    fun: F,
    input: impl Into<Input>,
    options: Option<Options>,
) -> Result<Artefact>
where
    F: Fn(Value) -> std::result::Result<Value, String> + Send + Sync + 'static,
{
    let artefact = resolve_input(session, input.into())?;
    let kind = artefact.kind;
    let wrapped = move |mut args: Vec<Lifted<Value>>| -> MapOutput {
        let value = args
            .pop()
            .ok_or_else(|| "missing argument".to_string())?
            .map_err(|e| format!("errored input: {:?}", e.kind))?;
        Ok(vec![fun(value)?])
    };
    let results = mapping(
        session,
        &format!("morph:{name}"),
        wrapped,
        vec![Input::Artefact(artefact)],
        &[kind],
        true,
        options,
    )?;
    Ok(results.into_iter().next().expect("one declared output"))
}

/// Add a many-to-one native function `y = f(x0, x1, …)`. All input kinds
/// must agree and set the output kind.
///
/// # Errors
///
/// Returns `EngineError::KindInference` when the input kinds disagree.
pub fn reduce<F>(
    session: &Session,
    name: &str,
    fun: F,
    inputs: Vec<Input>,
    options: Option<Options>,
) -> Result<Artefact>
where
    F: Fn(Vec<Value>) -> std::result::Result<Value, String> + Send + Sync + 'static,
{
    let n = inputs.len();
    let artefacts: Vec<Artefact> = inputs
        .into_iter()
        .map(|input| resolve_input(session, input))
        .collect::<Result<_>>()?;
    let mut kinds = artefacts.iter().map(|a| a.kind);
    let Some(kind) = kinds.next() else {
        return Err(EngineError::KindInference(
            "reduce over no inputs".to_string(),
        ));
    };
    if !kinds.all(|k| k == kind) {
        return Err(EngineError::KindInference(format!(
            "inputs of reduce:{name} disagree on encoding; pass explicit kinds via mapping()"
        )));
    }

    let wrapped = move |args: Vec<Lifted<Value>>| -> MapOutput {
        let values = args
            .into_iter()
            .map(|v| v.map_err(|e| format!("errored input: {:?}", e.kind)))
            .collect::<std::result::Result<Vec<Value>, String>>()?;
        Ok(vec![fun(values)?])
    };
    let results = mapping(
        session,
        &format!("reduce_{n}:{name}"),
        wrapped,
        artefacts.into_iter().map(Input::Artefact).collect(),
        &[kind],
        true,
        options,
    )?;
    Ok(results.into_iter().next().expect("one declared output"))
}

// ---------------------------------------------------------------------------
// Templates

/// Render a mustache-style template over named substitutions.
///
/// String substitutions are stripped of surrounding whitespace unless
/// `strip` is false; `env` maps template names to environment variables
/// read on the worker at render time. Returns the rendered blob artefact.
///
/// # Errors
///
/// Rejects substitutions named like the reserved slots and propagates
/// hub/storage failures.
pub fn template(
    session: &Session,
    tmpl: impl Into<Input>,
    data: Vec<(String, Input)>,
    env: Option<BTreeMap<String, String>>,
    strip: bool,
    options: Option<Options>,
) -> Result<Artefact> {
    let options = options.unwrap_or_else(|| session.options());

    let mut artefacts = BTreeMap::new();
    for (name, input) in data {
        if name == TEMPLATE_SLOT || name == ENV_SLOT {
            return Err(EngineError::Template(format!(
                "substitution name {name} is reserved"
            )));
        }
        artefacts.insert(name, resolve_input(session, input)?);
    }
    artefacts.insert(
        TEMPLATE_SLOT.to_string(),
        resolve_input(session, tmpl.into())?,
    );
    let env_value = match env {
        Some(map) => serde_json::to_value(map)?,
        None => serde_json::Value::Null,
    };
    artefacts.insert(
        ENV_SLOT.to_string(),
        put(session, Value::Json(env_value))?,
    );

    let inp_kinds: BTreeMap<String, Encoding> = artefacts
        .iter()
        .map(|(k, a)| (k.clone(), a.kind))
        .collect();
    let mut out = BTreeMap::new();
    out.insert("out".to_string(), Encoding::Blob);

    let what = if strip { RENDER_STRIPPED } else { RENDER_RAW };
    let funsie = native_funsie(what, inp_kinds, out, true);
    let op = make_op(&session.hub, &funsie, &artefacts, &options)?;
    finish_op(session, &op)?;
    Artefact::grab(&session.hub, &op.out["out"])
}

// ---------------------------------------------------------------------------
// Roots

/// Whether an operation hangs directly off the root sentinel.
///
/// # Errors
///
/// Propagates hub failures.
pub fn is_root_op(session: &Session, op: &Operation) -> Result<bool> {
    Ok(session
        .hub
        .smembers(&crate::constants::subkey(
            crate::constants::OPERATIONS,
            op.hash.as_str(),
            "parents",
        ))?
        .contains(ROOT))
}
