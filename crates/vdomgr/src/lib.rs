//! Management-plane core for deduplicating, compressing device-mapper
//! volumes.
//!
//! The library owns the lifecycle, configuration and crash recovery of the
//! volumes; the block data path lives in the kernel target and is driven
//! exclusively through external tools (`dmsetup`, `vdoformat`, ...). The
//! three sources of truth (the YAML registry, the running device-mapper
//! state and the on-disk volume metadata) are kept consistent by the
//! operation-state machine in [`volume`].

use std::path::PathBuf;

pub mod config;
pub mod defaults;
pub mod kmod;
pub mod lock;
pub mod ops;
pub mod runner;
pub mod size;
pub mod system;
pub mod transaction;
pub mod types;
pub mod volume;

pub use config::Configuration;
pub use runner::{CommandError, RunContext};
pub use size::SizeString;
pub use transaction::Transaction;
pub use types::{IndexMemory, LogLevel, OperationState, WritePolicy};

/// Process exit statuses, one per error category.
///
/// The values start at 3 to stay clear of the common statuses (1 for a
/// generic failure, 2 for an argument-parsing failure).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Generic,
    Argument,
    Error,
    Developer,
    State,
    System,
    User,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Generic => 1,
            ExitStatus::Argument => 2,
            ExitStatus::Error => 3,
            ExitStatus::Developer => 4,
            ExitStatus::State => 5,
            ExitStatus::System => 6,
            ExitStatus::User => 7,
        }
    }
}

/// Errors produced by the volume manager.
#[derive(Debug, thiserror::Error)]
pub enum VdoError {
    /// Bad user input detected past argument parsing: conflicting names,
    /// rejected option combinations, insufficient privilege.
    #[error("{0}")]
    User(String),

    /// An entity (volume, kernel device, configuration) is in a state that
    /// forbids the requested operation.
    #[error("{0}")]
    State(String),

    /// An external tool, the OS or the hardware failed.
    #[error("{0}")]
    System(String),

    /// An impossible internal state; indicates a programming error.
    #[error("{0}")]
    Developer(String),

    #[error("invalid size string \"{0}\"")]
    InvalidSize(String),

    #[error("{0}")]
    BadConfigurationFile(String),

    #[error("VDO volume {0} already exists")]
    AlreadyExists(String),

    /// A previous operation on the volume left a begin-state marker that
    /// cannot be recovered automatically. `steps` enumerates the cleanup
    /// commands a `remove --force` would run.
    #[error(
        "VDO volume {name} previous operation ({operation}) is incomplete; \
         recover by performing 'remove --force'"
    )]
    PreviousOperationFailure {
        name: String,
        operation: String,
        steps: Vec<String>,
    },

    #[error("could not lock {} in {seconds} seconds", path.display())]
    LockTimeout { path: PathBuf, seconds: u64 },

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Yaml(String),
}

impl VdoError {
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            VdoError::User(_)
            | VdoError::InvalidSize(_)
            | VdoError::AlreadyExists(_) => ExitStatus::User,
            VdoError::State(_)
            | VdoError::BadConfigurationFile(_)
            | VdoError::PreviousOperationFailure { .. }
            | VdoError::LockTimeout { .. } => ExitStatus::State,
            VdoError::System(_)
            | VdoError::Command(_)
            | VdoError::Io(_)
            | VdoError::Yaml(_) => ExitStatus::System,
            VdoError::Developer(_) => ExitStatus::Developer,
        }
    }
}

pub type Result<T> = std::result::Result<T, VdoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_taxonomy() {
        assert_eq!(ExitStatus::Generic.code(), 1);
        assert_eq!(ExitStatus::Argument.code(), 2);
        assert_eq!(ExitStatus::Error.code(), 3);
        assert_eq!(ExitStatus::Developer.code(), 4);
        assert_eq!(ExitStatus::State.code(), 5);
        assert_eq!(ExitStatus::System.code(), 6);
        assert_eq!(ExitStatus::User.code(), 7);
    }

    #[test]
    fn error_classification() {
        assert_eq!(
            VdoError::AlreadyExists("v1".into()).exit_status(),
            ExitStatus::User
        );
        assert_eq!(
            VdoError::PreviousOperationFailure {
                name: "v1".into(),
                operation: "create".into(),
                steps: vec![],
            }
            .exit_status(),
            ExitStatus::State
        );
        assert_eq!(
            VdoError::Developer("missing handler".into()).exit_status(),
            ExitStatus::Developer
        );
    }
}
