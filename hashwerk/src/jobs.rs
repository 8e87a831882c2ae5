//! Job payloads exchanged through the hub queues.

use serde::{Deserialize, Serialize};

use crate::errors::Result;

/// One unit of scheduled work: run `op` within DAG instance `dag`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// DAG instance key.
    pub dag: String,
    /// Operation hash.
    pub op: String,
}

impl Job {
    /// Serialize for the queue.
    ///
    /// # Errors
    ///
    /// Propagates serialization failures.
    pub fn pack(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize from a queue payload.
    ///
    /// # Errors
    ///
    /// Propagates deserialization failures.
    pub fn unpack(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_roundtrip() {
        let job = Job {
            dag: "abc/def".to_string(),
            op: "0123".to_string(),
        };
        assert_eq!(Job::unpack(&job.pack().unwrap()).unwrap(), job);
    }
}
