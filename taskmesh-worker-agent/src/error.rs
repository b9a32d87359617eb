//! The worker-side error taxonomy (§7, SPEC_FULL §10.3): typed variants the
//! intake loop and runner match on directly when deciding ack/nack, rather
//! than stringly-typed errors.

use taskmesh_common::SafeDisplay;

/// Failures from talking to the control plane over HTTP. The `Transient`
/// variant is what §7 calls "transient control-plane (HTTP 5xx, timeout)":
/// callers retry on the next tick without mutating any local state.
#[derive(Debug, thiserror::Error)]
pub enum ControlPlaneError {
    #[error("control plane request timed out or the connection was refused: {0}")]
    Transient(String),
    #[error("control plane rejected the request: {0}")]
    Rejected(String),
    #[error("control plane response was not valid JSON: {0}")]
    MalformedResponse(String),
}

impl ControlPlaneError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ControlPlaneError::Transient(_))
    }
}

impl SafeDisplay for ControlPlaneError {
    fn to_safe_string(&self) -> String {
        match self {
            ControlPlaneError::Transient(_) => "control plane unreachable".to_string(),
            ControlPlaneError::Rejected(_) => "control plane rejected request".to_string(),
            ControlPlaneError::MalformedResponse(_) => "control plane returned malformed response".to_string(),
        }
    }
}

impl From<reqwest::Error> for ControlPlaneError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            ControlPlaneError::Transient(err.to_string())
        } else if let Some(status) = err.status() {
            if status.is_server_error() {
                ControlPlaneError::Transient(err.to_string())
            } else {
                ControlPlaneError::Rejected(err.to_string())
            }
        } else {
            ControlPlaneError::Transient(err.to_string())
        }
    }
}

/// The disposition the intake loop or runner settles on for a single
/// broker delivery, named after §7's taxonomy so call sites read as a
/// direct translation of the spec rather than ad hoc booleans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Processed to a terminal state (completed or failed) — ack.
    Done,
    /// Refused due to a transient local condition (at capacity, control
    /// plane unreachable) — nack(requeue=true).
    TransientRefusal,
    /// The message is known-dead: parent/self confirmed stopped, or a
    /// poison message — nack(requeue=false).
    Dead,
}
