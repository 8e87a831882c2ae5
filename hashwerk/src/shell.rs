//! Shell funsies.
//!
//! A shell funsie materializes its input artefacts as files in a fresh
//! scratch directory, runs its command lines in sequence through `sh -c`,
//! captures per-command stdout/stderr/exit status as extra outputs, and
//! reads declared output files back. The funsie's environment variables
//! are merged onto the worker environment, never replacing it, and are not
//! part of the operation's identity.

use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use convenient_hub::Hub;
use tracing::{info, warn};

use crate::errors::{EngineError, Lifted, Result};
use crate::funsie::{Funsie, FunsieHow};
use crate::graph::{Artefact, Operation};
use crate::hashes::ContentHash;
use crate::run::{OutValue, RunFailure, RunnerResult};
use crate::serdes::{Encoding, Value};
use crate::worker::shutdown_requested;

/// Namespace prefix for captured command streams.
pub const SPECIAL: &str = "__special__";
/// Captured stdout of command `i` is named `__special__/stdout<i>`.
pub const STDOUT: &str = "__special__/stdout";
/// Captured stderr of command `i`.
pub const STDERR: &str = "__special__/stderr";
/// Captured exit status of command `i`.
pub const RETURNCODE: &str = "__special__/returncode";

const CHILD_POLL: Duration = Duration::from_millis(25);

/// Describe a shell funsie over the given command lines.
///
/// Declared inputs and outputs are files, always blobs. Each command line
/// additionally contributes stdout/stderr/returncode outputs.
///
/// # Errors
///
/// Propagates serialization failures of the command/env side data.
pub fn shell_funsie(
    cmds: &[String],
    input_files: &[String],
    output_files: &[String],
    env: Option<&BTreeMap<String, String>>,
    strict: bool,
) -> Result<Funsie> {
    let inp: BTreeMap<String, Encoding> = input_files
        .iter()
        .map(|f| (f.clone(), Encoding::Blob))
        .collect();
    let mut out: BTreeMap<String, Encoding> = output_files
        .iter()
        .map(|f| (f.clone(), Encoding::Blob))
        .collect();
    for k in 0..cmds.len() {
        out.insert(format!("{STDOUT}{k}"), Encoding::Blob);
        out.insert(format!("{STDERR}{k}"), Encoding::Blob);
        out.insert(format!("{RETURNCODE}{k}"), Encoding::Blob);
    }

    let mut extra = BTreeMap::new();
    extra.insert("cmds".to_string(), serde_json::to_vec(cmds)?);
    extra.insert("env".to_string(), serde_json::to_vec(&env)?);

    Ok(Funsie::new(
        FunsieHow::Shell,
        cmds.join(";"),
        inp,
        out,
        extra,
        !strict,
    ))
}

fn drain(stream: Option<impl Read + Send + 'static>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut stream) = stream {
            let _ = stream.read_to_end(&mut buf);
        }
        buf
    })
}

/// Wait for a child, honoring the deadline and the worker shutdown flag.
fn supervise(child: &mut Child, deadline: Option<Instant>) -> std::result::Result<i32, RunFailure> {
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                #[cfg(unix)]
                {
                    use std::os::unix::process::ExitStatusExt;
                    return Ok(status
                        .code()
                        .unwrap_or_else(|| -status.signal().unwrap_or(0)));
                }
                #[cfg(not(unix))]
                return Ok(status.code().unwrap_or(-1));
            }
            Ok(None) => {}
            Err(e) => return Err(RunFailure::Raised(e.to_string())),
        }
        if shutdown_requested() {
            let _ = child.kill();
            let _ = child.wait();
            return Err(RunFailure::Killed(
                "worker received a termination signal".to_string(),
            ));
        }
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Err(RunFailure::TimedOut(
                    "shell command exceeded its deadline".to_string(),
                ));
            }
        }
        thread::sleep(CHILD_POLL);
    }
}

/// Execute a shell funsie against decoded inputs.
pub(crate) fn run_shell_funsie(
    funsie: &Funsie,
    inputs: &BTreeMap<String, Lifted<Value>>,
    deadline: Option<Instant>,
) -> RunnerResult {
    let raise = |e: &dyn std::fmt::Display| RunFailure::Raised(e.to_string());

    let cmds: Vec<String> = serde_json::from_slice(
        funsie
            .extra
            .get("cmds")
            .ok_or_else(|| RunFailure::Raised("funsie has no packed commands".to_string()))?,
    )
    .map_err(|e| raise(&e))?;
    let env: Option<BTreeMap<String, String>> = funsie
        .extra
        .get("env")
        .map(|raw| serde_json::from_slice(raw))
        .transpose()
        .map_err(|e| raise(&e))?
        .flatten();

    let scratch = tempfile::tempdir().map_err(|e| raise(&e))?;

    // Materialize input files; errored inputs are skipped (they only occur
    // under error tolerance).
    for (name, value) in inputs {
        match value {
            Ok(Value::Bytes(data)) => {
                let path = scratch.path().join(name);
                if let Some(dir) = path.parent() {
                    fs::create_dir_all(dir).map_err(|e| raise(&e))?;
                }
                fs::write(&path, data).map_err(|e| raise(&e))?;
            }
            Ok(Value::Json(json)) => {
                let path = scratch.path().join(name);
                if let Some(dir) = path.parent() {
                    fs::create_dir_all(dir).map_err(|e| raise(&e))?;
                }
                let data = serde_json::to_vec(json).map_err(|e| raise(&e))?;
                fs::write(&path, data).map_err(|e| raise(&e))?;
            }
            Err(_) => {}
        }
    }

    let mut out = BTreeMap::new();
    let total = cmds.len();
    for (k, cmd) in cmds.iter().enumerate() {
        info!("{}/{} $> {}", k + 1, total, cmd);
        let started = Instant::now();

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(cmd)
            .current_dir(scratch.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(env) = &env {
            // Merged on top of the worker environment, never replacing it.
            command.envs(env);
        }

        let mut child = command.spawn().map_err(|e| raise(&e))?;
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());
        let code = supervise(&mut child, deadline)?;

        info!(
            "done {}/{}\t\tduration: {:.2}s",
            k + 1,
            total,
            started.elapsed().as_secs_f64()
        );
        if code != 0 {
            warn!("nonzero returncode={code}");
        }

        out.insert(
            format!("{STDOUT}{k}"),
            OutValue::Data(stdout.join().unwrap_or_default()),
        );
        out.insert(
            format!("{STDERR}{k}"),
            OutValue::Data(stderr.join().unwrap_or_default()),
        );
        out.insert(
            format!("{RETURNCODE}{k}"),
            OutValue::Data(code.to_string().into_bytes()),
        );
    }

    // Read declared output files back.
    for name in funsie.out.keys() {
        if name.contains(SPECIAL) {
            continue;
        }
        match fs::read(scratch.path().join(name)) {
            Ok(data) => {
                out.insert(name.clone(), OutValue::Data(data));
            }
            Err(_) => {
                warn!("missing expected output {name}");
                out.insert(name.clone(), OutValue::Missing);
            }
        }
    }
    Ok(out)
}

/// A convenience wrapper around a shell operation.
///
/// Gives named access to declared output files and to the captured
/// stdout/stderr/returncode artefacts of each command.
#[derive(Debug, Clone)]
pub struct ShellOutput {
    /// The underlying operation.
    pub op: Operation,
    /// Operation hash.
    pub hash: ContentHash,
    /// Declared output files.
    pub out: BTreeMap<String, Artefact>,
    /// Input files.
    pub inp: BTreeMap<String, Artefact>,
    /// Captured stdout per command.
    pub stdouts: Vec<Artefact>,
    /// Captured stderr per command.
    pub stderrs: Vec<Artefact>,
    /// Captured exit status per command.
    pub returncodes: Vec<Artefact>,
}

impl ShellOutput {
    /// Wrap an existing shell operation.
    ///
    /// # Errors
    ///
    /// Propagates hub failures while resolving artefacts.
    pub fn new(hub: &Hub, op: Operation) -> Result<Self> {
        let mut out = BTreeMap::new();
        let mut n = 0;
        for (key, value) in &op.out {
            if key.contains(SPECIAL) {
                if key.starts_with(RETURNCODE) {
                    n += 1;
                }
            } else {
                out.insert(key.clone(), Artefact::grab(hub, value)?);
            }
        }
        let mut inp = BTreeMap::new();
        for (key, value) in &op.inp {
            inp.insert(key.clone(), Artefact::grab(hub, value)?);
        }
        let mut stdouts = Vec::new();
        let mut stderrs = Vec::new();
        let mut returncodes = Vec::new();
        for i in 0..n {
            stdouts.push(Artefact::grab(hub, &op.out[&format!("{STDOUT}{i}")])?);
            stderrs.push(Artefact::grab(hub, &op.out[&format!("{STDERR}{i}")])?);
            returncodes.push(Artefact::grab(hub, &op.out[&format!("{RETURNCODE}{i}")])?);
        }
        let hash = op.hash.clone();
        Ok(Self {
            op,
            hash,
            out,
            inp,
            stdouts,
            stderrs,
            returncodes,
        })
    }

    fn single(&self, items: &[Artefact]) -> Result<Artefact> {
        if self.stdouts.len() > 1 {
            return Err(EngineError::MultiCommand(self.stdouts.len()));
        }
        items
            .first()
            .cloned()
            .ok_or_else(|| EngineError::Corrupt {
                kind: "shell output",
                address: self.hash.as_str().to_string(),
            })
    }

    /// Stdout of the single command.
    ///
    /// # Errors
    ///
    /// Fails when the operation ran more than one command.
    pub fn stdout(&self) -> Result<Artefact> {
        self.single(&self.stdouts)
    }

    /// Stderr of the single command.
    ///
    /// # Errors
    ///
    /// Fails when the operation ran more than one command.
    pub fn stderr(&self) -> Result<Artefact> {
        self.single(&self.stderrs)
    }

    /// Exit status of the single command.
    ///
    /// # Errors
    ///
    /// Fails when the operation ran more than one command.
    pub fn returncode(&self) -> Result<Artefact> {
        self.single(&self.returncodes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lifted_bytes(pairs: &[(&str, &[u8])]) -> BTreeMap<String, Lifted<Value>> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), Ok(Value::Bytes(v.to_vec()))))
            .collect()
    }

    #[test]
    fn captures_streams_and_output_files() {
        let funsie = shell_funsie(
            &["cat f1 f2 > merged".to_string(), "echo done".to_string()],
            &["f1".to_string(), "f2".to_string()],
            &["merged".to_string()],
            None,
            true,
        )
        .unwrap();
        let inputs = lifted_bytes(&[("f1", b"BLA BLA"), ("f2", b"bla bla")]);
        let out = run_shell_funsie(&funsie, &inputs, None).unwrap();

        assert_eq!(
            out["merged"],
            OutValue::Data(b"BLA BLAbla bla".to_vec())
        );
        assert_eq!(
            out[&format!("{STDOUT}1")],
            OutValue::Data(b"done\n".to_vec())
        );
        assert_eq!(
            out[&format!("{RETURNCODE}0")],
            OutValue::Data(b"0".to_vec())
        );
    }

    #[test]
    fn missing_output_file_is_reported_per_output() {
        let funsie = shell_funsie(
            &["cp file1 file3".to_string()],
            &["file1".to_string()],
            &["file2".to_string()],
            None,
            true,
        )
        .unwrap();
        let inputs = lifted_bytes(&[("file1", b"bla")]);
        let out = run_shell_funsie(&funsie, &inputs, None).unwrap();
        assert_eq!(out["file2"], OutValue::Missing);
        // The command itself succeeded.
        assert_eq!(
            out[&format!("{RETURNCODE}0")],
            OutValue::Data(b"0".to_vec())
        );
    }

    #[test]
    fn nonzero_exit_is_not_an_error() {
        let funsie = shell_funsie(
            &["exit 7".to_string()],
            &[],
            &[],
            None,
            true,
        )
        .unwrap();
        let out = run_shell_funsie(&funsie, &BTreeMap::new(), None).unwrap();
        assert_eq!(
            out[&format!("{RETURNCODE}0")],
            OutValue::Data(b"7".to_vec())
        );
    }

    #[test]
    fn env_is_merged_not_replaced() {
        let mut env = BTreeMap::new();
        env.insert("HASHWERK_TEST_VAR".to_string(), "injected".to_string());
        let funsie = shell_funsie(
            &["printf \"$HASHWERK_TEST_VAR:$PATH\" > probe".to_string()],
            &[],
            &["probe".to_string()],
            Some(&env),
            true,
        )
        .unwrap();
        let out = run_shell_funsie(&funsie, &BTreeMap::new(), None).unwrap();
        let OutValue::Data(probe) = &out["probe"] else {
            panic!("probe output missing");
        };
        let probe = String::from_utf8_lossy(probe);
        assert!(probe.starts_with("injected:"));
        // The inherited PATH is still there.
        assert!(probe.len() > "injected:".len());
    }

    #[test]
    fn deadline_kills_the_child() {
        let funsie = shell_funsie(
            &["sleep 5".to_string()],
            &[],
            &[],
            None,
            true,
        )
        .unwrap();
        let started = Instant::now();
        let result = run_shell_funsie(
            &funsie,
            &BTreeMap::new(),
            Some(Instant::now() + Duration::from_millis(200)),
        );
        assert!(matches!(result, Err(RunFailure::TimedOut(_))));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn input_paths_with_directories_are_created() {
        let funsie = shell_funsie(
            &["cat sub/dir/inner > flat".to_string()],
            &["sub/dir/inner".to_string()],
            &["flat".to_string()],
            None,
            true,
        )
        .unwrap();
        let inputs = lifted_bytes(&[("sub/dir/inner", b"nested")]);
        let out = run_shell_funsie(&funsie, &inputs, None).unwrap();
        assert_eq!(out["flat"], OutValue::Data(b"nested".to_vec()));
    }

    #[test]
    fn funsie_hash_ignores_env() {
        let mut env = BTreeMap::new();
        env.insert("A".to_string(), "1".to_string());
        let with_env = shell_funsie(
            &["true".to_string()],
            &[],
            &[],
            Some(&env),
            true,
        )
        .unwrap();
        let without = shell_funsie(&["true".to_string()], &[], &[], None, true).unwrap();
        assert_eq!(with_env.hash, without.hash);
    }
}
