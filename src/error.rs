use thiserror::Error;

use crate::regmap::RegisterDescriptor;
use crate::session::SessionState;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure reported by an engine backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct EngineError(pub String);

impl EngineError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// One hook that could not be removed during cleanup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookRemoveFailure {
    pub descriptor: RegisterDescriptor,
    pub reason: EngineError,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Shared region {0} not found")]
    NotFound(String),
    #[error("Access denied to shared region {name}: {source}")]
    AccessDenied {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid shared region name {0:?}")]
    InvalidRegionName(String),
    #[error("Shared region {name} is {size} bytes, need at least {needed}")]
    RegionTooSmall { name: String, size: u64, needed: u64 },
    #[error("Shared region {0} is closed")]
    RegionClosed(String),
    #[error("Shared region {0} was already unlinked")]
    AlreadyUnlinked(String),
    #[error("Shared region {0} is still attached by another process")]
    RegionBusy(String),
    #[error("Address {address:#x} is configured more than once")]
    DuplicateAddress { address: u64 },
    #[error("Invalid register range {begin:#x}-{end:#x}")]
    InvalidRange { begin: u64, end: u64 },
    #[error("Invalid session state: cannot {operation} while {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },
    #[error("Hook install failed for {descriptor} ({rolled_back} hooks rolled back): {reason}")]
    HookInstallFailed {
        descriptor: RegisterDescriptor,
        rolled_back: usize,
        reason: EngineError,
    },
    #[error("{} hook(s) could not be removed", .0.len())]
    HookRemoveFailed(Vec<HookRemoveFailure>),
    #[error("Emulation failed: {0}")]
    EngineFailure(String),
    #[error("Emulation exceeded its run limit ({0})")]
    RunLimitExceeded(String),
    #[error("{error}; cleanup afterwards also failed: {cleanup}")]
    CleanupAfterFailure {
        error: Box<Error>,
        #[source]
        cleanup: Box<Error>,
    },
    #[error("Cleanup failed: {}", .0.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "))]
    CleanupFailed(Vec<Error>),
    #[error("Unexpected error: {0}")]
    Unexpected(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build an `Unexpected` error, logging it with its context first.
    pub fn unexpected(context: &str, detail: impl std::fmt::Display) -> Self {
        let msg = format!("{context}: {detail}");
        log::error!("{}", msg);
        Error::Unexpected(msg)
    }

    /// Collapse a list of cleanup errors into a single result.
    pub(crate) fn aggregate(mut errors: Vec<Error>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::CleanupFailed(errors)),
        }
    }
}
