//! Server configuration and session handles.
//!
//! A [`Session`] carries the hub connection, the storage engine and the
//! default options, and is passed explicitly through the builder API.
//! [`Server`] is the URL-level configuration from which sessions are
//! opened; it reads `HUB_URL` and `DATA_URL` from the environment when not
//! given explicitly.

use std::env;

use convenient_hub::Hub;
use convenient_store::Storage;
use tracing::info;

use crate::constants::{subkey, OPERATIONS};
use crate::errors::Result;
use crate::options::Options;

/// Environment variable naming the hub (jobs + graph state) URL.
pub const HUB_URL_VAR: &str = "HUB_URL";
/// Environment variable naming the storage backend URL.
pub const DATA_URL_VAR: &str = "DATA_URL";

const DEFAULT_HUB_URL: &str = "redis://localhost:6379";
const DEFAULT_DATA_URL: &str = "hub://";

/// URL-level configuration of a hashwerk deployment.
#[derive(Debug, Clone)]
pub struct Server {
    /// Hub connection URL (`redis://…` or `memory://`).
    pub hub_url: String,
    /// Storage backend URL (`hub://` or `file:///path`).
    pub data_url: String,
}

impl Server {
    /// Build a configuration from explicit URLs, falling back to the
    /// `HUB_URL` / `DATA_URL` environment variables and then to a local
    /// Redis with hub-resident storage.
    #[must_use]
    pub fn new(hub_url: Option<String>, data_url: Option<String>) -> Self {
        let hub_url = hub_url
            .or_else(|| env::var(HUB_URL_VAR).ok())
            .unwrap_or_else(|| DEFAULT_HUB_URL.to_string());
        let data_url = data_url
            .or_else(|| env::var(DATA_URL_VAR).ok())
            .unwrap_or_else(|| DEFAULT_DATA_URL.to_string());
        Self { hub_url, data_url }
    }

    /// Open a session against this configuration.
    ///
    /// # Errors
    ///
    /// Propagates connection and URL failures.
    pub fn open(&self) -> Result<Session> {
        let hub = Hub::from_url(&self.hub_url)?;
        let store = Storage::from_url(&self.data_url, &hub)?;
        info!(
            "connected to {}",
            self.hub_url.split('@').last().unwrap_or(&self.hub_url)
        );
        Ok(Session {
            hub,
            store,
            defaults: Options::default(),
        })
    }
}

/// A live connection to a hashwerk deployment.
#[derive(Debug, Clone)]
pub struct Session {
    /// The hub holding graph state and queues.
    pub hub: Hub,
    /// The artefact storage engine.
    pub store: Storage,
    /// Default options applied to new operations.
    pub defaults: Options,
}

impl Session {
    /// A fully in-process session: memory hub with hub-resident storage.
    #[must_use]
    pub fn in_memory() -> Self {
        let hub = Hub::memory();
        let store = Storage::hub(hub.clone());
        Self {
            hub,
            store,
            defaults: Options::default(),
        }
    }

    /// Replace the default options for operations built on this session.
    #[must_use]
    pub fn with_defaults(mut self, defaults: Options) -> Self {
        self.defaults = defaults;
        self
    }

    /// Layer overrides on top of the session defaults.
    #[must_use]
    pub fn options(&self) -> Options {
        self.defaults.clone()
    }

    /// Drop all job queues and clear all owner locks. Artefact data is
    /// left untouched.
    ///
    /// # Errors
    ///
    /// Propagates hub failures.
    pub fn cleanup(&self) -> Result<()> {
        for queue in self.hub.queue_names()? {
            self.hub.queue_drop(&queue)?;
        }
        let owners = self.hub.keys(&subkey(OPERATIONS, "*", "owner"))?;
        if !owners.is_empty() {
            info!("clearing {} unfinished ops", owners.len());
            for key in owners {
                self.hub.del(&key)?;
            }
        }
        Ok(())
    }

    /// Ask every registered worker to stop. With `force`, also clear the
    /// owner locks their running jobs may still hold.
    ///
    /// # Errors
    ///
    /// Propagates hub failures.
    pub fn shutdown_workers(&self, force: bool) -> Result<()> {
        let workers = self.hub.workers()?;
        info!("shutting down {} workers", workers.len());
        for id in workers {
            if force {
                if let Some(op) = self.hub.worker_current_job(&id)? {
                    self.hub.del(&subkey(OPERATIONS, &op, "owner"))?;
                }
            }
            self.hub.worker_request_shutdown(&id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleanup_drops_queues_and_locks() {
        let session = Session::in_memory();
        session.hub.queue_push("default", b"job").unwrap();
        session
            .hub
            .set(&subkey(OPERATIONS, "abc", "owner"), b"w1")
            .unwrap();

        session.cleanup().unwrap();
        assert_eq!(session.hub.queue_len("default").unwrap(), 0);
        assert!(!session
            .hub
            .exists(&subkey(OPERATIONS, "abc", "owner"))
            .unwrap());
    }

    #[test]
    fn shutdown_marks_workers() {
        let session = Session::in_memory();
        let info = convenient_hub::WorkerInfo {
            id: "w1".to_string(),
            queues: vec!["default".to_string()],
            pid: 1,
        };
        session.hub.worker_register(&info).unwrap();
        session.shutdown_workers(false).unwrap();
        assert!(session.hub.worker_shutdown_requested("w1").unwrap());
    }
}
