use thiserror::Error;

use pvcd_coordinator::CoordinationError;

/// Error taxonomy for controller reconciliation (spec §7). Distinguishes
/// what a controller should do on failure: retry, write `fail` to the
/// domain, surface synchronously to a caller, or die.
#[derive(Error, Debug)]
pub enum ReconcileError {
    /// Coordination-store error expected to clear up; retry with backoff.
    #[error("transient coordination-store error: {0}")]
    Transient(#[source] anyhow::Error),

    /// The local virtualization driver failed. Recorded in
    /// `/domains/<u>/failedreason`; the domain transitions to `fail`.
    #[error("driver error: {0}")]
    Driver(#[source] anyhow::Error),

    /// An external process exited non-zero. Caller decides whether this
    /// means `fail` or a retry.
    #[error("process {program} exited with status {exit_code}: {stderr}")]
    Process {
        program: String,
        exit_code: i32,
        stderr: String,
    },

    /// Bad input from a client; never written to the store.
    #[error("validation error: {0}")]
    Validation(String),

    /// The request doesn't match cluster reality (e.g. target node absent).
    /// Surfaced to the caller; no state mutation.
    #[error("cluster state error: {0}")]
    ClusterState(String),

    /// The coordination-store session was lost. Fatal: the node process
    /// must exit so it can be restarted clean.
    #[error("coordination-store session lost")]
    SessionLost,
}

impl From<CoordinationError> for ReconcileError {
    fn from(err: CoordinationError) -> Self {
        match err {
            CoordinationError::SessionLost => ReconcileError::SessionLost,
            CoordinationError::Transient(_) => ReconcileError::Transient(err.into()),
            CoordinationError::NoNode | CoordinationError::NodeExists | CoordinationError::BadVersion => {
                ReconcileError::ClusterState(err.to_string())
            }
            CoordinationError::Other(_) => ReconcileError::Transient(err.into()),
        }
    }
}
