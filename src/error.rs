//! Error types for storage backends and the recorder boundary.
//!
//! `StorageError` carries enough classification for the recorder to decide
//! between retrying, dropping a single event, and pausing logging.
//! `RecorderError` is what the UI collaborator sees; it serializes as
//! `{ "kind": "...", "message": "..." }`.

use serde::ser::SerializeStruct;
use std::path::PathBuf;

/// Failure reported by a storage backend.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Short-lived failure (lock contention, network blip); worth retrying.
    #[error("transient storage failure: {0}")]
    Transient(String),

    /// The backend cannot accept writes until the user intervenes
    /// (disk full, authentication failure, unreachable file).
    #[error("storage unavailable: {0}")]
    Persistent(String),

    /// An existing store was found but its content cannot be used.
    #[error("incompatible store at {}: {reason}", path.display())]
    Incompatible { path: PathBuf, reason: String },

    /// The operation is not part of this backend's capabilities.
    #[error("{operation} is not supported by the {backend} backend")]
    Unsupported {
        operation: &'static str,
        backend: &'static str,
    },

    /// Per-event database failure that does not affect later writes.
    #[error("database error: {0}")]
    Database(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub fn kind(&self) -> &'static str {
        match self {
            StorageError::Transient(_) => "Transient",
            StorageError::Persistent(_) => "Persistent",
            StorageError::Incompatible { .. } => "Incompatible",
            StorageError::Unsupported { .. } => "Unsupported",
            StorageError::Database(_) => "Database",
            StorageError::Io(_) => "Io",
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Transient(_))
    }

    /// Whether logging must pause until the user intervenes.
    pub fn is_persistent(&self) -> bool {
        matches!(
            self,
            StorageError::Persistent(_) | StorageError::Incompatible { .. }
        )
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => {
                StorageError::Transient(err.to_string())
            }
            Some(
                ErrorCode::DiskFull
                | ErrorCode::ReadOnly
                | ErrorCode::CannotOpen
                | ErrorCode::SystemIoFailure
                | ErrorCode::DatabaseCorrupt
                | ErrorCode::NotADatabase
                | ErrorCode::PermissionDenied,
            ) => StorageError::Persistent(err.to_string()),
            _ => StorageError::Database(err.to_string()),
        }
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => {
                StorageError::Transient(err.to_string())
            }
            sqlx::Error::Tls(_) | sqlx::Error::Configuration(_) | sqlx::Error::PoolClosed => {
                StorageError::Persistent(err.to_string())
            }
            sqlx::Error::Database(db_err) => {
                // SQLSTATE class 28: invalid authorization specification
                let auth_failure = db_err
                    .code()
                    .map(|code| code.starts_with("28"))
                    .unwrap_or(false);
                if auth_failure {
                    StorageError::Persistent(err.to_string())
                } else {
                    StorageError::Database(err.to_string())
                }
            }
            _ => StorageError::Database(err.to_string()),
        }
    }
}

/// Error returned to the UI collaborator by recorder operations.
#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    /// The call is not allowed in the recorder's current state.
    #[error("{0}")]
    PreconditionViolation(String),

    /// Missing or invalid settings.
    #[error("{0}")]
    Configuration(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl RecorderError {
    pub fn kind(&self) -> &'static str {
        match self {
            RecorderError::PreconditionViolation(_) => "PreconditionViolation",
            RecorderError::Configuration(_) => "Configuration",
            RecorderError::Storage(err) => err.kind(),
        }
    }
}

impl serde::Serialize for RecorderError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut s = serializer.serialize_struct("RecorderError", 2)?;
        s.serialize_field("kind", self.kind())?;
        s.serialize_field("message", &self.to_string())?;
        s.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::ffi;

    fn sqlite_failure(code: std::os::raw::c_int) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(ffi::Error::new(code), None)
    }

    #[test]
    fn sqlite_busy_is_transient() {
        let err: StorageError = sqlite_failure(ffi::SQLITE_BUSY).into();
        assert!(err.is_transient());
        assert!(!err.is_persistent());
    }

    #[test]
    fn sqlite_disk_full_is_persistent() {
        let err: StorageError = sqlite_failure(ffi::SQLITE_FULL).into();
        assert!(err.is_persistent());
        assert_eq!(err.kind(), "Persistent");
    }

    #[test]
    fn sqlite_constraint_is_per_event() {
        let err: StorageError = sqlite_failure(ffi::SQLITE_CONSTRAINT).into();
        assert_eq!(err.kind(), "Database");
        assert!(!err.is_persistent());
        assert!(!err.is_transient());
    }

    #[test]
    fn sqlx_pool_timeout_is_transient() {
        let err: StorageError = sqlx::Error::PoolTimedOut.into();
        assert!(err.is_transient());
        let err: StorageError = sqlx::Error::PoolClosed.into();
        assert!(err.is_persistent());
    }

    #[test]
    fn incompatible_store_pauses_logging() {
        let err = StorageError::Incompatible {
            path: PathBuf::from("/tmp/other.db"),
            reason: "schema version 7".into(),
        };
        assert!(err.is_persistent());
        assert!(err.to_string().contains("/tmp/other.db"));
    }

    #[test]
    fn recorder_error_serializes_as_kind_and_message() {
        let err = RecorderError::PreconditionViolation("logging must be paused".into());
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "PreconditionViolation");
        assert_eq!(json["message"], "logging must be paused");

        let err: RecorderError = StorageError::Unsupported {
            operation: "relocate",
            backend: "remote",
        }
        .into();
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "Unsupported");
        assert_eq!(json["message"], "relocate is not supported by the remote backend");
    }
}
