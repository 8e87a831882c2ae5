//! The two error layers of the engine.
//!
//! [`Error`] values are *data*: they are stored under artefact keys and
//! flow through the graph like any other payload, so a failing operation
//! poisons exactly its downstream cone and nothing else.
//!
//! [`EngineError`] is the ordinary Rust error type for API misuse and
//! infrastructure failures (hub down, malformed records, unknown hashes).

use std::collections::BTreeMap;

use convenient_hub::{Hub, HubError};
use convenient_store::StoreError;

use crate::constants::{subkey, ARTEFACTS};
use crate::hashes::ContentHash;

/// Kinds of data errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// No data associated with the artefact.
    NotFound,
    /// Status and stored data disagree.
    Mismatch,
    /// A declared output was not produced.
    MissingOutput,
    /// A declared input was not provided.
    MissingInput,
    /// The callable failed.
    ExceptionRaised,
    /// An error status without a stored error record.
    NoErrorData,
    /// The operation exceeded its wall-clock timeout.
    JobTimedOut,
    /// The worker was killed by an external signal mid-task.
    KilledBySignal,
    /// Payload did not parse as JSON.
    JsonDecodingError,
    /// Value could not be serialized as JSON.
    JsonEncodingError,
    /// Declared encoding is not supported.
    UnknownEncodingError,
    /// Value does not match the declared encoding.
    WrongType,
}

impl ErrorKind {
    /// Stable name used in hub records.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "NotFound",
            ErrorKind::Mismatch => "Mismatch",
            ErrorKind::MissingOutput => "MissingOutput",
            ErrorKind::MissingInput => "MissingInput",
            ErrorKind::ExceptionRaised => "ExceptionRaised",
            ErrorKind::NoErrorData => "NoErrorData",
            ErrorKind::JobTimedOut => "JobTimedOut",
            ErrorKind::KilledBySignal => "KilledBySignal",
            ErrorKind::JsonDecodingError => "JSONDecodingError",
            ErrorKind::JsonEncodingError => "JSONEncodingError",
            ErrorKind::UnknownEncodingError => "UnknownEncodingError",
            ErrorKind::WrongType => "WrongType",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "NotFound" => ErrorKind::NotFound,
            "Mismatch" => ErrorKind::Mismatch,
            "MissingOutput" => ErrorKind::MissingOutput,
            "MissingInput" => ErrorKind::MissingInput,
            "ExceptionRaised" => ErrorKind::ExceptionRaised,
            "NoErrorData" => ErrorKind::NoErrorData,
            "JobTimedOut" => ErrorKind::JobTimedOut,
            "KilledBySignal" => ErrorKind::KilledBySignal,
            "JSONDecodingError" => ErrorKind::JsonDecodingError,
            "JSONEncodingError" => ErrorKind::JsonEncodingError,
            "UnknownEncodingError" => ErrorKind::UnknownEncodingError,
            "WrongType" => ErrorKind::WrongType,
            _ => return None,
        })
    }
}

/// An error value held by an artefact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    /// What went wrong.
    pub kind: ErrorKind,
    /// Operation that introduced the error, when known.
    pub source: Option<ContentHash>,
    /// Free-text diagnostics.
    pub details: Option<String>,
}

impl Error {
    /// A bare error of the given kind.
    #[must_use]
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            source: None,
            details: None,
        }
    }

    /// Attach the operation that introduced the error.
    #[must_use]
    pub fn with_source(mut self, source: ContentHash) -> Self {
        self.source = Some(source);
        self
    }

    /// Attach free-text diagnostics.
    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Store this error under an artefact key.
    ///
    /// # Errors
    ///
    /// Propagates hub failures.
    pub fn put(&self, hub: &Hub, artefact: &ContentHash) -> Result<()> {
        let mut fields = vec![(
            "kind".to_string(),
            self.kind.as_str().as_bytes().to_vec(),
        )];
        if let Some(source) = &self.source {
            fields.push(("source".to_string(), source.as_str().as_bytes().to_vec()));
        }
        if let Some(details) = &self.details {
            fields.push(("details".to_string(), details.as_bytes().to_vec()));
        }
        hub.hset_map(&subkey(ARTEFACTS, artefact.as_str(), "error"), &fields)?;
        Ok(())
    }

    /// Load the error stored under an artefact key.
    ///
    /// An error status with no stored record yields `NoErrorData`.
    ///
    /// # Errors
    ///
    /// Propagates hub failures.
    pub fn grab(hub: &Hub, artefact: &ContentHash) -> Result<Self> {
        let data: BTreeMap<String, Vec<u8>> =
            hub.hgetall(&subkey(ARTEFACTS, artefact.as_str(), "error"))?;
        let Some(kind_raw) = data.get("kind") else {
            return Ok(Error::new(ErrorKind::NoErrorData));
        };
        let kind = ErrorKind::from_name(&String::from_utf8_lossy(kind_raw))
            .unwrap_or(ErrorKind::NoErrorData);
        let source = data
            .get("source")
            .map(|raw| ContentHash::from_hex(&String::from_utf8_lossy(raw)))
            .transpose()?;
        let details = data
            .get("details")
            .map(|raw| String::from_utf8_lossy(raw).into_owned());
        Ok(Error {
            kind,
            source,
            details,
        })
    }
}

/// Either a value or a data error, as it flows through the graph.
pub type Lifted<T> = std::result::Result<T, Error>;

/// Engine-level failures: API misuse and infrastructure problems.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Hub request failed.
    #[error("hub error: {0}")]
    Hub(#[from] HubError),

    /// Storage request failed.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// JSON (de)serialization of an engine record failed.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Not a well-formed hash.
    #[error("not a valid hash: {0}")]
    BadHash(String),

    /// Nothing stored under this hash for the expected entity type.
    #[error("no {kind} stored at {address}")]
    Missing {
        /// Entity type that was looked up.
        kind: &'static str,
        /// Hash that was looked up.
        address: String,
    },

    /// A stored record is missing required fields.
    #[error("corrupt {kind} record at {address}")]
    Corrupt {
        /// Entity type of the record.
        kind: &'static str,
        /// Hash of the record.
        address: String,
    },

    /// Input name not declared by the funsie.
    #[error("extra input {0} not declared by the funsie")]
    UnexpectedInput(String),

    /// Declared input not supplied.
    #[error("input {0} required by the funsie is missing")]
    UndefinedInput(String),

    /// Writes to const artefacts are rejected.
    #[error("attempted to set data on const artefact {0}")]
    ConstArtefact(String),

    /// Writes to linked artefacts are rejected.
    #[error("attempted to set data on linked artefact {0}")]
    LinkedArtefact(String),

    /// Consts refuse reset.
    #[error("attempted to reset a const artefact")]
    ResetConst,

    /// `take` on an errored artefact in strict mode.
    #[error("data is errored: kind={} source={:?} details={:?}", .0.kind.as_str(), .0.source, .0.details)]
    Unwrap(Error),

    /// `wait_for` ran out of time.
    #[error("waited on {target} for {waited:.1}s")]
    WaitTimeout {
        /// Short hash of the target.
        target: String,
        /// Seconds spent waiting.
        waited: f64,
    },

    /// Output encodings could not be inferred.
    #[error("cannot infer output encoding: {0}")]
    KindInference(String),

    /// No callable registered under this name.
    #[error("no function registered under name {0}")]
    NotRegistered(String),

    /// A short hash matched several objects.
    #[error("hash {0} is ambiguous ({1} matches); provide more characters")]
    AmbiguousHash(String, usize),

    /// A hash matched nothing.
    #[error("hash {0} does not correspond to anything")]
    UnknownHash(String),

    /// Dispatch of an operation with `evaluate = false`.
    #[error("operation {0} has evaluation disabled")]
    EvaluateDisabled(String),

    /// Parametric declared output with no producing operation.
    #[error("parametric output {0} has no dependencies")]
    ParametricRoot(String),

    /// Template rendering failed.
    #[error("template error: {0}")]
    Template(String),

    /// Single-command accessor used on a multi-command shell operation.
    #[error("shell operation ran {0} commands; use the per-command accessors")]
    MultiCommand(usize),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Unwrap a lifted value, converting a data error into `EngineError::Unwrap`.
///
/// # Errors
///
/// Returns `EngineError::Unwrap` when the value is an error.
pub fn unwrap_lifted<T>(value: Lifted<T>) -> Result<T> {
    value.map_err(EngineError::Unwrap)
}
