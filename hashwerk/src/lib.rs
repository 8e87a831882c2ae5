//! hashwerk — a distributed, content-addressed workflow engine.
//!
//! Workflows are DAGs of *operations* (shell commands, registered native
//! functions, sub-DAG generators) whose inputs and outputs are immutable
//! *artefacts* identified by content hash. A shared key-value hub holds
//! all graph structure and execution state; any number of workers attached
//! to the hub execute operations cooperatively. Re-submitting an identical
//! workflow is transparently memoized: operations whose outputs already
//! exist are skipped.
//!
//! # Example
//!
//! ```
//! use hashwerk::{self as hw, Session};
//!
//! fn upper(v: hw::Value) -> Result<hw::Value, String> {
//!     match v {
//!         hw::Value::Bytes(b) => Ok(hw::Value::Bytes(b.to_ascii_uppercase())),
//!         other => Err(format!("expected bytes, got {other:?}")),
//!     }
//! }
//!
//! # fn main() -> hw::Result<()> {
//! let session = Session::in_memory().with_defaults(hw::Options {
//!     distributed: false,
//!     ..hw::Options::default()
//! });
//!
//! let a = hw::put(&session, "bla bla")?;
//! let b = hw::morph(&session, "upper", upper, &a, None)?;
//! let c = hw::Shell::new()
//!     .cmd("cat f1 f2")
//!     .input("f1", &b)
//!     .input("f2", &a)
//!     .call(&session)?;
//!
//! let target = c.stdout()?;
//! hw::execute(&session, &target)?;
//! hw::wait_for(&session, &target, None)?;
//! assert_eq!(hw::take(&session, &target)?, b"BLA BLAbla bla");
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod constants;
pub mod dag;
pub mod errors;
pub mod funsie;
pub mod getter;
pub mod graph;
pub mod hashes;
pub mod jobs;
pub mod native;
pub mod options;
pub mod parametric;
pub mod registry;
pub mod run;
pub mod serdes;
pub mod session;
pub mod shell;
pub mod subdag;
pub mod template;
pub mod viz;
pub mod worker;

pub use api::{
    execute, is_root_op, mapping, morph, put, reduce, reset, take, take_result, take_value,
    takeout, template, wait_for, Input, MapOutput, Shell, Target,
};
pub use errors::{unwrap_lifted, EngineError, Error, ErrorKind, Lifted, Result};
pub use funsie::{Funsie, FunsieHow};
pub use getter::{get, Object};
pub use graph::{Artefact, ArtefactStatus, Operation, Parent};
pub use hashes::ContentHash;
pub use native::native_funsie;
pub use options::Options;
pub use parametric::{make_parametric, recall, Parametric};
pub use registry::{register_native, register_subdag};
pub use run::RunStatus;
pub use serdes::{Encoding, Value};
pub use session::{Server, Session};
pub use shell::ShellOutput;
pub use subdag::subdag_funsie;
pub use worker::{run_worker, worker_id};
