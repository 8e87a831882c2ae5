//! Runtime options for operations.
//!
//! Options never participate in hashing: changing them does not cause
//! re-execution. They are packed as JSON strings under
//! `operations:<hash>:options` (JSON rather than a binary format, for
//! forward compatibility).

use serde::{Deserialize, Serialize};

use crate::errors::Result;

/// One day, in seconds.
pub const ONE_DAY: i64 = 86_400;
/// One minute, in seconds.
pub const ONE_MINUTE: i64 = 60;
/// Sentinel for "no timeout".
pub const INFINITE: i64 = -1;

fn default_timeout() -> i64 {
    INFINITE
}

fn default_queue() -> String {
    "default".to_string()
}

fn default_true() -> bool {
    true
}

fn default_ttl() -> i64 {
    ONE_DAY
}

fn default_result_ttl() -> i64 {
    ONE_MINUTE
}

/// Runtime knobs for one operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Options {
    /// Max execution time in seconds, or -1 for no limit.
    #[serde(default = "default_timeout")]
    pub timeout: i64,

    /// Queue this operation is dispatched on.
    #[serde(default = "default_queue")]
    pub queue: String,

    /// When false, tasks run inline in the enqueueing process instead of
    /// going through the job queue. Used for worker-less runs and tests.
    #[serde(default = "default_true")]
    pub distributed: bool,

    /// When true, output data is invalidated as soon as the operation is
    /// (re)constructed, forcing re-execution on the next run.
    #[serde(default)]
    pub reset: bool,

    /// When false, dispatching this operation fails instead of running it.
    #[serde(default = "default_true")]
    pub evaluate: bool,

    /// Time-to-live of the job on its queue, in seconds.
    #[serde(default = "default_ttl")]
    pub ttl: i64,

    /// Time-to-live of job results in the queue runtime, in seconds.
    #[serde(default = "default_result_ttl")]
    pub result_ttl: i64,

    /// Time-to-live of job failure records in the queue runtime.
    #[serde(default = "default_ttl")]
    pub failure_ttl: i64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            timeout: INFINITE,
            queue: default_queue(),
            distributed: true,
            reset: false,
            evaluate: true,
            ttl: ONE_DAY,
            result_ttl: ONE_MINUTE,
            failure_ttl: ONE_DAY,
        }
    }
}

impl Options {
    /// Pack into the stored string form.
    ///
    /// # Errors
    ///
    /// Propagates serialization failures.
    pub fn pack(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Unpack from the stored string form.
    ///
    /// # Errors
    ///
    /// Propagates deserialization failures.
    pub fn unpack(data: &str) -> Result<Self> {
        Ok(serde_json::from_str(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_roundtrip() {
        let opt = Options {
            timeout: 30,
            queue: "gpu".to_string(),
            ..Options::default()
        };
        let packed = opt.pack().unwrap();
        assert_eq!(Options::unpack(&packed).unwrap(), opt);
    }

    #[test]
    fn unpack_fills_missing_fields() {
        let opt = Options::unpack("{\"queue\": \"io\"}").unwrap();
        assert_eq!(opt.queue, "io");
        assert_eq!(opt.timeout, INFINITE);
        assert!(opt.evaluate);
        assert!(opt.distributed);
    }
}
