//! Trait surface for the underlying page-storage library.
//!
//! The control plane never links the storage core directly; it drives it
//! through these traits. Error returns are sum-typed so callers can match on
//! the code instead of unwinding: recognized codes are handled locally,
//! anything else is escalated through [`invariant_core_ok`].

pub mod memcore;

use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreCode {
    /// EBUSY: the object is in active use. Drops queue and retry later.
    Busy,
    /// ENOENT: no such object or file.
    NoEntry,
    /// EINVAL: the request itself is malformed.
    Invalid,
    /// Metadata corruption the core can attempt to salvage.
    TrySalvage,
    /// Cursor exhausted or queried timestamp not present.
    NotFound,
    WriteConflict,
    ShutdownInProgress,
    CacheFull,
    Other(i32),
}

#[derive(Debug, Clone, Error)]
#[error("{reason} ({code:?})")]
pub struct CoreError {
    pub code: CoreCode,
    pub reason: String,
}

impl CoreError {
    pub fn new(code: CoreCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub fn busy(reason: impl Into<String>) -> Self {
        Self::new(CoreCode::Busy, reason)
    }

    pub fn no_entry(reason: impl Into<String>) -> Self {
        Self::new(CoreCode::NoEntry, reason)
    }

    pub fn not_found(reason: impl Into<String>) -> Self {
        Self::new(CoreCode::NotFound, reason)
    }

    pub fn shutdown(reason: impl Into<String>) -> Self {
        Self::new(CoreCode::ShutdownInProgress, reason)
    }

    pub fn is_busy(&self) -> bool {
        self.code == CoreCode::Busy
    }

    pub fn is_no_entry(&self) -> bool {
        self.code == CoreCode::NoEntry
    }

    pub fn is_not_found(&self) -> bool {
        self.code == CoreCode::NotFound
    }

    pub fn is_write_conflict(&self) -> bool {
        self.code == CoreCode::WriteConflict
    }

    pub fn is_shutdown(&self) -> bool {
        self.code == CoreCode::ShutdownInProgress
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

/// Crashes the process on an unrecognized storage-core failure. Mirrors the
/// propagation policy: recoverable codes are matched where they occur, and
/// everything that reaches this helper is an invariant violation.
pub fn invariant_core_ok<T>(result: CoreResult<T>) -> T {
    match result {
        Ok(v) => v,
        Err(e) => panic!("storage core invariant failure: {e}"),
    }
}

/// Opens storage-core instances at a filesystem path.
pub trait CoreDriver: Send + Sync {
    fn open(&self, path: &Path, config: &str) -> CoreResult<Arc<dyn CoreConnection>>;
}

/// An open storage-core instance. Internally thread-safe; sessions taken
/// from it must each stay on one caller at a time.
pub trait CoreConnection: Send + Sync {
    fn open_session(&self) -> CoreResult<Box<dyn CoreSession>>;
    fn close(&self, config: &str) -> CoreResult<()>;
    fn reconfigure(&self, config: &str) -> CoreResult<()>;
    fn set_timestamp(&self, config: &str) -> CoreResult<()>;
    /// `which` is a query string such as `get=recovery` or
    /// `get=oldest_reader`; the result is a hex-encoded timestamp.
    fn query_timestamp(&self, which: &str) -> CoreResult<String>;
    fn rollback_to_stable(&self) -> CoreResult<()>;
}

impl std::fmt::Debug for dyn CoreConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn CoreConnection").finish_non_exhaustive()
    }
}

pub trait CoreSession: Send {
    fn open_cursor(&mut self, uri: &str) -> CoreResult<Box<dyn CoreCursor>>;
    fn create(&mut self, uri: &str, config: &str) -> CoreResult<()>;
    fn drop_table(&mut self, uri: &str, config: &str) -> CoreResult<()>;
    fn verify(&mut self, uri: &str) -> CoreResult<()>;
    fn salvage(&mut self, uri: &str) -> CoreResult<()>;
    fn alter(&mut self, uri: &str, config: &str) -> CoreResult<()>;
    fn checkpoint(&mut self, config: &str) -> CoreResult<()>;
    fn log_flush(&mut self, config: &str) -> CoreResult<()>;
    /// Raw creation metadata for a table, as stored under `metadata:create`.
    fn table_metadata(&mut self, uri: &str) -> CoreResult<String>;
}

/// Unidirectional, non-restartable cursor. Closed when dropped.
pub trait CoreCursor: Send {
    /// Advances to the next record. `Ok(false)` means the cursor is
    /// exhausted.
    fn next(&mut self) -> CoreResult<bool>;
    fn key(&self) -> CoreResult<String>;
    fn value(&self) -> CoreResult<Vec<u8>>;
    /// Exact-match positioning; `Ok(false)` when the key is absent.
    fn search(&mut self, key: &str) -> CoreResult<bool>;
    fn insert(&mut self, key: &str, value: &[u8]) -> CoreResult<()>;
    fn remove(&mut self, key: &str) -> CoreResult<()>;
}

/// Lazy draining iterator over a cursor's `(key, value)` pairs. The cursor
/// is closed when the iterator is dropped.
pub struct CursorIter {
    cursor: Box<dyn CoreCursor>,
    done: bool,
}

impl CursorIter {
    pub fn new(cursor: Box<dyn CoreCursor>) -> Self {
        Self {
            cursor,
            done: false,
        }
    }
}

impl Iterator for CursorIter {
    type Item = CoreResult<(String, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.cursor.next() {
            Ok(true) => {}
            Ok(false) => {
                self.done = true;
                return None;
            }
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        }
        let entry = self
            .cursor
            .key()
            .and_then(|k| self.cursor.value().map(|v| (k, v)));
        if entry.is_err() {
            self.done = true;
        }
        Some(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::{CoreCode, CoreError};

    #[test]
    fn code_predicates() {
        assert!(CoreError::busy("x").is_busy());
        assert!(CoreError::no_entry("x").is_no_entry());
        assert!(CoreError::shutdown("x").is_shutdown());
        assert!(!CoreError::new(CoreCode::Other(-31800), "x").is_busy());
    }

    #[test]
    #[should_panic(expected = "storage core invariant failure")]
    fn invariant_panics_on_unrecognized_error() {
        super::invariant_core_ok::<()>(Err(CoreError::new(CoreCode::Other(-31802), "boom")));
    }
}
