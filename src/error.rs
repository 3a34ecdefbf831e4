use crate::core::CoreError;
use thiserror::Error;

/// Outcome of a salvage/rebuild/orphan-recovery pass. `Modified` is a
/// success: the data is usable again, but repair rewrote it and the caller
/// must record that before letting the node rejoin a replica set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairOutcome {
    Clean,
    Modified,
}

impl RepairOutcome {
    pub fn modified(self) -> bool {
        matches!(self, RepairOutcome::Modified)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Io,
    InvalidConfig,
    InvalidPath,
    NotFound,
    MetadataCorruption,
    WriteConflict,
    ShutdownInProgress,
    UnrecoverableRollback,
    RotationFinished,
    KeyDb,
    Backup,
    Core,
    Unsupported,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Io => "io",
            ErrorCode::InvalidConfig => "invalid_config",
            ErrorCode::InvalidPath => "invalid_path",
            ErrorCode::NotFound => "not_found",
            ErrorCode::MetadataCorruption => "metadata_corruption",
            ErrorCode::WriteConflict => "write_conflict",
            ErrorCode::ShutdownInProgress => "shutdown_in_progress",
            ErrorCode::UnrecoverableRollback => "unrecoverable_rollback",
            ErrorCode::RotationFinished => "rotation_finished",
            ErrorCode::KeyDb => "key_db",
            ErrorCode::Backup => "backup",
            ErrorCode::Core => "core",
            ErrorCode::Unsupported => "unsupported",
        }
    }
}

#[derive(Debug, Error)]
pub enum CapstanError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
    #[error("invalid path: {message}")]
    InvalidPath { message: String },
    #[error("{what} not found")]
    NotFound { what: String },
    #[error("storage metadata corruption: {reason}")]
    MetadataCorruption { reason: String },
    #[error("write conflict")]
    WriteConflict,
    #[error("shutdown in progress")]
    ShutdownInProgress,
    #[error("unrecoverable rollback: {reason}")]
    UnrecoverableRollback { reason: String },
    #[error("master key rotation finished successfully")]
    RotationFinished,
    #[error("key db error: {message}")]
    KeyDb { message: String },
    #[error("backup error: {message}")]
    Backup { message: String },
    #[error("storage core error: {0}")]
    Core(#[from] CoreError),
    #[error("operation not supported: {message}")]
    Unsupported { message: String },
}

impl CapstanError {
    pub fn code(&self) -> ErrorCode {
        match self {
            CapstanError::Io(_) => ErrorCode::Io,
            CapstanError::InvalidConfig { .. } => ErrorCode::InvalidConfig,
            CapstanError::InvalidPath { .. } => ErrorCode::InvalidPath,
            CapstanError::NotFound { .. } => ErrorCode::NotFound,
            CapstanError::MetadataCorruption { .. } => ErrorCode::MetadataCorruption,
            CapstanError::WriteConflict => ErrorCode::WriteConflict,
            CapstanError::ShutdownInProgress => ErrorCode::ShutdownInProgress,
            CapstanError::UnrecoverableRollback { .. } => ErrorCode::UnrecoverableRollback,
            CapstanError::RotationFinished => ErrorCode::RotationFinished,
            CapstanError::KeyDb { .. } => ErrorCode::KeyDb,
            CapstanError::Backup { .. } => ErrorCode::Backup,
            CapstanError::Core(_) => ErrorCode::Core,
            CapstanError::Unsupported { .. } => ErrorCode::Unsupported,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::{CapstanError, ErrorCode};

    #[test]
    fn error_code_strings_are_stable() {
        assert_eq!(ErrorCode::RotationFinished.as_str(), "rotation_finished");
        assert_eq!(
            ErrorCode::UnrecoverableRollback.as_str(),
            "unrecoverable_rollback"
        );
        assert_eq!(
            ErrorCode::MetadataCorruption.as_str(),
            "metadata_corruption"
        );
    }

    #[test]
    fn error_code_matches_variant() {
        let err = CapstanError::InvalidPath {
            message: "missing backup source".into(),
        };
        assert_eq!(err.code(), ErrorCode::InvalidPath);
        assert_eq!(err.code_str(), "invalid_path");
    }
}
