//! Error taxonomy surfaced to callers of the `Experiment` facade.
//!
//! `TransientError` from the design is deliberately absent here: it never
//! escapes the wait loop (see [`crate::engine::RetryOutcome`]).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PrecipError {
    /// Missing credentials, unparseable endpoint, or similar caller mistake.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The cloud backend refused a request (auth, quota, missing image, ...).
    #[error("backend error: {0}")]
    Backend(#[source] anyhow::Error),

    /// An instance reached `max_starts` without becoming `Ready`.
    #[error("instance {instance_id} timed out after {num_starts} start attempt(s)")]
    BootTimeout { instance_id: String, num_starts: u32 },

    /// `vm-bootstrap.sh` exited non-zero. Not retried; usually an image problem.
    #[error("bootstrap failed on instance {instance_id} with exit code {exit_code}: {stderr}")]
    BootstrapFailed { instance_id: String, exit_code: u32, stderr: String },

    /// A fan-out `run` with `check_exit = true` saw a non-zero exit code.
    #[error("remote command failed on instance {instance_id} with exit code {exit_code}")]
    RemoteCommandFailed { instance_id: String, exit_code: u32, stdout: String, stderr: String },

    /// Caller addressed an instance that isn't `Ready` (tag filter or explicit id).
    #[error("instance {instance_id} is not ready (state: {state})")]
    InstanceNotReady { instance_id: String, state: String },

    /// SSH connect/auth/channel failure surfaced directly (not a retry candidate).
    #[error("ssh error: {0}")]
    Ssh(#[source] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, PrecipError>;
