//! Error types for the node agent.

use std::fmt;

use thiserror::Error;

/// Result type alias for agent operations.
pub type AgentResult<T> = Result<T, AgentError>;

/// Errors that can occur while provisioning or reconciling node state.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("volume already exists: {0}")]
    VolumeExists(String),

    #[error("volume not found: {0}")]
    VolumeNotFound(String),

    #[error("network namespace not found: {0}")]
    NamespaceNotFound(String),

    #[error("node not found in store: {0}")]
    NodeNotFound(String),

    #[error("command `{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unexpected output from `{command}`: {detail}")]
    UnexpectedOutput { command: String, detail: String },

    #[error("provisioning volume {id} failed at step `{step}`: {source}")]
    Provision {
        id: String,
        step: &'static str,
        #[source]
        source: Box<AgentError>,
    },

    #[error(transparent)]
    Store(#[from] corral_store::StoreError),

    #[error(transparent)]
    Runtime(#[from] corral_runtime::RuntimeError),
}

impl AgentError {
    pub(crate) fn io(path: impl fmt::Display, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_string(),
            source,
        }
    }
}

/// Outcome of a best-effort teardown.
///
/// Every step is always attempted; step failures are collected here
/// instead of being swallowed, so callers can decide whether to retry
/// or surface them.
#[derive(Debug, Default)]
pub struct TeardownReport {
    failures: Vec<(&'static str, AgentError)>,
}

impl TeardownReport {
    /// True when every teardown step succeeded.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Record a failed step.
    pub fn record(&mut self, step: &'static str, error: AgentError) {
        self.failures.push((step, error));
    }

    /// The failed steps and their errors.
    pub fn failures(&self) -> &[(&'static str, AgentError)] {
        &self.failures
    }
}

impl fmt::Display for TeardownReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_clean() {
            return write!(f, "clean");
        }
        let steps: Vec<String> = self
            .failures
            .iter()
            .map(|(step, err)| format!("{step}: {err}"))
            .collect();
        write!(f, "{} step(s) failed [{}]", self.failures.len(), steps.join("; "))
    }
}
