//! # Engine error taxonomy
//!
//! Four fatal classes plus one thing that is deliberately *not* an error:
//!
//! - [`EngineError::Validation`] — bad inputs or illegal state; fatal to
//!   the run, the controller recovers.
//! - [`EngineError::Resource`] — an allocation failed; reported with the
//!   failing size, same recovery as validation.
//! - [`EngineError::Protocol`] — malformed or unexpected bridge traffic;
//!   fatal to the bridge, the worker process gets torn down.
//! - [`EngineError::Worker`] — the worker process died or stopped
//!   responding mid-request; synthesised by the client.
//! - [`Cancelled`] — the in-band stop signal. It unwinds the pipeline
//!   silently and never surfaces through `Controller::error()`.

use aniso_pix::PixError;

/// Fatal engine error. See the module docs for the taxonomy.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum EngineError {
    /// Invalid inputs or an illegal state transition.
    Validation(String),
    /// An allocation failed; carries the requested byte count.
    Resource { what: String, bytes: usize },
    /// Malformed frame, unexpected response, short read, or a timeout
    /// past retry on the bridge.
    Protocol(String),
    /// The worker process crashed or went silent during a request.
    Worker(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(msg) => write!(f, "{}", msg),
            Self::Resource { what, bytes } => {
                write!(f, "allocation of {} bytes failed for {}", bytes, what)
            }
            Self::Protocol(msg) => write!(f, "protocol error: {}", msg),
            Self::Worker(msg) => write!(f, "worker process error: {}", msg),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<PixError> for EngineError {
    fn from(e: PixError) -> Self {
        match e {
            PixError::Alloc { bytes } => {
                Self::Resource { what: "pixel buffer".to_string(), bytes }
            }
            other => Self::Validation(other.to_string()),
        }
    }
}

/// The cancellation signal. Propagated through `Result` from the barrier
/// outward; every caller passes it along without touching the error
/// state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

/// What ends a pipeline stage early: a stop request, or a real fault that
/// the first worker to observe it records for `error()`.
#[derive(Debug)]
pub(crate) enum StageAbort {
    Cancelled,
    Failed(EngineError),
}

impl From<Cancelled> for StageAbort {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

impl From<EngineError> for StageAbort {
    fn from(e: EngineError) -> Self {
        Self::Failed(e)
    }
}

impl From<PixError> for StageAbort {
    fn from(e: PixError) -> Self {
        Self::Failed(e.into())
    }
}
