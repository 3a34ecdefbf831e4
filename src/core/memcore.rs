//! File-backed reference implementation of the storage-core traits.
//!
//! Keeps table contents in memory, persists them to per-table `.wt` files at
//! checkpoint/close, and records instance metadata in `_core.meta`. It is a
//! functional stand-in for a native core library: good enough to run the
//! whole control plane, drive integration tests, and inject the error codes
//! the engine must handle (busy drops, failed verifies, salvage bootstrap).

use crate::core::{
    CoreCode, CoreConnection, CoreCursor, CoreDriver, CoreError, CoreResult, CoreSession,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

pub const META_FILE: &str = "_core.meta";
pub const LOG_FILE: &str = "core.log";
const CURRENT_COMPAT: &str = "1.2";

/// Error-injection knobs shared by every instance a driver opens.
#[derive(Default)]
pub struct FaultPlan {
    drop_busy: Mutex<HashMap<String, u32>>,
    verify_errors: Mutex<HashMap<String, CoreCode>>,
    salvage_errors: Mutex<HashMap<String, CoreCode>>,
    open_error: Mutex<Option<CoreCode>>,
    checkpoint_errors: Mutex<Vec<CoreCode>>,
    oldest_reader: Mutex<Option<u64>>,
    fail_rollback: AtomicBool,
}

impl FaultPlan {
    /// The next `n` drops of `uri` return busy.
    pub fn set_drop_busy(&self, uri: &str, n: u32) {
        self.drop_busy.lock().insert(uri.to_string(), n);
    }

    pub fn set_verify_error(&self, uri: &str, code: CoreCode) {
        self.verify_errors.lock().insert(uri.to_string(), code);
    }

    pub fn clear_verify_error(&self, uri: &str) {
        self.verify_errors.lock().remove(uri);
    }

    pub fn set_salvage_error(&self, uri: &str, code: CoreCode) {
        self.salvage_errors.lock().insert(uri.to_string(), code);
    }

    /// Every open fails with `code` until an open with `salvage=true`
    /// clears it.
    pub fn set_open_error(&self, code: CoreCode) {
        *self.open_error.lock() = Some(code);
    }

    pub fn push_checkpoint_error(&self, code: CoreCode) {
        self.checkpoint_errors.lock().push(code);
    }

    pub fn set_oldest_reader(&self, ts: Option<u64>) {
        *self.oldest_reader.lock() = ts;
    }

    pub fn fail_next_rollback(&self) {
        self.fail_rollback.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MetaFile {
    compat: String,
    log_enabled: bool,
    checkpoint_ts: u64,
    tables: BTreeMap<String, String>,
}

struct TableData {
    config: String,
    rows: BTreeMap<String, Vec<u8>>,
}

struct CoreState {
    compat: String,
    log_enabled: bool,
    read_only: bool,
    recovery_ts: u64,
    stable_ts: u64,
    oldest_ts: u64,
    tables: HashMap<String, TableData>,
    closed: bool,
    /// Every `set_timestamp` config string, in arrival order.
    timestamp_pushes: Vec<String>,
    alter_log: Vec<(String, String)>,
}

struct CoreInner {
    path: PathBuf,
    state: Mutex<CoreState>,
    faults: Arc<FaultPlan>,
    rollback_calls: AtomicUsize,
}

#[derive(Clone)]
pub struct MemCore {
    inner: Arc<CoreInner>,
}

pub struct MemCoreDriver {
    faults: Arc<FaultPlan>,
    connections: Mutex<Vec<MemCore>>,
}

impl Default for MemCoreDriver {
    fn default() -> Self {
        Self {
            faults: Arc::new(FaultPlan::default()),
            connections: Mutex::new(Vec::new()),
        }
    }
}

impl MemCoreDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn faults(&self) -> Arc<FaultPlan> {
        self.faults.clone()
    }

    /// Instances opened so far, oldest first. Lets tests inspect timestamp
    /// push ordering and rollback counts.
    pub fn connections(&self) -> Vec<MemCore> {
        self.connections.lock().clone()
    }
}

fn parse_minor_version(v: &str) -> Option<(u32, u32)> {
    let mut parts = v.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

fn config_value<'a>(config: &'a str, key: &str) -> Option<&'a str> {
    // Last occurrence wins, matching config-string override semantics.
    let needle = format!("{key}=");
    let at = config.rfind(&needle)?;
    let rest = &config[at + needle.len()..];
    let end = rest
        .find(|c: char| c == ',' || c == ')')
        .unwrap_or(rest.len());
    Some(&rest[..end])
}

fn parse_require_min(config: &str) -> Option<(u32, u32)> {
    let v = config_value(config, "require_min")?;
    parse_minor_version(v.trim_matches('"'))
}

fn log_enabled_in(config: &str) -> bool {
    let needle = "log=(enabled=";
    match config.rfind(needle) {
        Some(at) => config[at + needle.len()..].starts_with("true"),
        None => false,
    }
}

fn io_err(e: impl std::fmt::Display) -> CoreError {
    CoreError::new(CoreCode::Other(-1), e.to_string())
}

impl CoreDriver for MemCoreDriver {
    fn open(&self, path: &Path, config: &str) -> CoreResult<Arc<dyn CoreConnection>> {
        let salvage = config.contains("salvage=true");
        {
            let mut open_error = self.faults.open_error.lock();
            if let Some(code) = *open_error {
                if salvage {
                    *open_error = None;
                } else {
                    return Err(CoreError::new(code, "injected open failure"));
                }
            }
        }

        let meta_path = path.join(META_FILE);
        let require_min = parse_require_min(config);
        let log_enabled = log_enabled_in(config);
        let read_only = config.contains("readonly=true");

        let meta = if meta_path.exists() {
            let bytes = std::fs::read(&meta_path).map_err(io_err)?;
            let meta: MetaFile = serde_json::from_slice(&bytes).map_err(|e| {
                CoreError::new(
                    CoreCode::TrySalvage,
                    format!("corrupt instance metadata: {e}"),
                )
            })?;
            if let Some(min) = require_min {
                let have = parse_minor_version(&meta.compat).unwrap_or((0, 0));
                if have < min {
                    return Err(CoreError::new(
                        CoreCode::Invalid,
                        format!(
                            "on-disk compatibility {} is below required {}.{}",
                            meta.compat, min.0, min.1
                        ),
                    ));
                }
            }
            meta
        } else {
            if !config.contains("create") {
                return Err(CoreError::no_entry("no storage-core instance at path"));
            }
            let compat = require_min
                .map(|(maj, min)| format!("{maj}.{min}"))
                .unwrap_or_else(|| CURRENT_COMPAT.to_string());
            MetaFile {
                compat,
                log_enabled,
                checkpoint_ts: 0,
                tables: BTreeMap::new(),
            }
        };

        let mut tables = HashMap::new();
        for (uri, table_config) in &meta.tables {
            let rows = match table_file_path(path, uri) {
                Some(file) if file.exists() => {
                    let bytes = std::fs::read(&file).map_err(io_err)?;
                    serde_json::from_slice(&bytes).unwrap_or_default()
                }
                _ => BTreeMap::new(),
            };
            tables.insert(
                uri.clone(),
                TableData {
                    config: table_config.clone(),
                    rows,
                },
            );
        }

        if log_enabled {
            let journal = path.join("journal");
            std::fs::create_dir_all(&journal).map_err(io_err)?;
            let _ = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(journal.join(LOG_FILE));
        }

        let core = MemCore {
            inner: Arc::new(CoreInner {
                path: path.to_path_buf(),
                state: Mutex::new(CoreState {
                    compat: meta.compat,
                    log_enabled,
                    read_only,
                    recovery_ts: meta.checkpoint_ts,
                    stable_ts: 0,
                    oldest_ts: 0,
                    tables,
                    closed: false,
                    timestamp_pushes: Vec::new(),
                    alter_log: Vec::new(),
                }),
                faults: self.faults.clone(),
                rollback_calls: AtomicUsize::new(0),
            }),
        };
        core.inner.persist_locked(&core.inner.state.lock(), None)?;
        self.connections.lock().push(core.clone());
        Ok(Arc::new(core))
    }
}

fn table_file_path(root: &Path, uri: &str) -> Option<PathBuf> {
    let ident = uri.strip_prefix("table:")?;
    Some(root.join(format!("{ident}.wt")))
}

impl CoreInner {
    fn persist_locked(&self, state: &CoreState, checkpoint_ts: Option<u64>) -> CoreResult<()> {
        let meta = MetaFile {
            compat: state.compat.clone(),
            log_enabled: state.log_enabled,
            checkpoint_ts: checkpoint_ts.unwrap_or(state.recovery_ts),
            tables: state
                .tables
                .iter()
                .map(|(uri, t)| (uri.clone(), t.config.clone()))
                .collect(),
        };
        let bytes = serde_json::to_vec_pretty(&meta).map_err(io_err)?;
        std::fs::write(self.path.join(META_FILE), bytes).map_err(io_err)?;
        for (uri, table) in &state.tables {
            if let Some(file) = table_file_path(&self.path, uri) {
                if let Some(parent) = file.parent() {
                    std::fs::create_dir_all(parent).map_err(io_err)?;
                }
                let bytes = serde_json::to_vec(&table.rows).map_err(io_err)?;
                std::fs::write(&file, bytes).map_err(io_err)?;
            }
        }
        Ok(())
    }

    fn check_open(state: &CoreState) -> CoreResult<()> {
        if state.closed {
            return Err(CoreError::shutdown("connection is closed"));
        }
        Ok(())
    }
}

impl MemCore {
    pub fn timestamp_pushes(&self) -> Vec<String> {
        self.inner.state.lock().timestamp_pushes.clone()
    }

    pub fn alter_log(&self) -> Vec<(String, String)> {
        self.inner.state.lock().alter_log.clone()
    }

    pub fn rollback_calls(&self) -> usize {
        self.inner.rollback_calls.load(Ordering::SeqCst)
    }

    pub fn stable_ts(&self) -> u64 {
        self.inner.state.lock().stable_ts
    }

    pub fn oldest_ts(&self) -> u64 {
        self.inner.state.lock().oldest_ts
    }

    pub fn compat(&self) -> String {
        self.inner.state.lock().compat.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    pub fn table_names(&self) -> Vec<String> {
        let state = self.inner.state.lock();
        let mut names: Vec<String> = state.tables.keys().cloned().collect();
        names.sort();
        names
    }
}

impl CoreConnection for MemCore {
    fn open_session(&self) -> CoreResult<Box<dyn CoreSession>> {
        let state = self.inner.state.lock();
        CoreInner::check_open(&state)?;
        drop(state);
        Ok(Box::new(MemSession {
            inner: self.inner.clone(),
        }))
    }

    fn close(&self, config: &str) -> CoreResult<()> {
        let mut state = self.inner.state.lock();
        CoreInner::check_open(&state)?;
        let use_timestamp = !config.contains("use_timestamp=false");
        let checkpoint_ts = if use_timestamp { state.stable_ts } else { 0 };
        self.inner.persist_locked(&state, Some(checkpoint_ts))?;
        state.closed = true;
        Ok(())
    }

    fn reconfigure(&self, config: &str) -> CoreResult<()> {
        let mut state = self.inner.state.lock();
        CoreInner::check_open(&state)?;
        if let Some(release) = config_value(config, "release") {
            state.compat = release.trim_matches('"').to_string();
        }
        self.inner.persist_locked(&state, None)
    }

    fn set_timestamp(&self, config: &str) -> CoreResult<()> {
        let mut state = self.inner.state.lock();
        CoreInner::check_open(&state)?;
        state.timestamp_pushes.push(config.to_string());
        let force = config.contains("force=true");
        if let Some(v) = config_value(config, "stable_timestamp") {
            let ts = u64::from_str_radix(v, 16)
                .map_err(|_| CoreError::new(CoreCode::Invalid, "bad stable timestamp"))?;
            state.stable_ts = if force { ts } else { state.stable_ts.max(ts) };
        }
        if let Some(v) = config_value(config, "oldest_timestamp") {
            let ts = u64::from_str_radix(v, 16)
                .map_err(|_| CoreError::new(CoreCode::Invalid, "bad oldest timestamp"))?;
            state.oldest_ts = if force { ts } else { state.oldest_ts.max(ts) };
        }
        Ok(())
    }

    fn query_timestamp(&self, which: &str) -> CoreResult<String> {
        let state = self.inner.state.lock();
        CoreInner::check_open(&state)?;
        match which {
            "get=recovery" => Ok(format!("{:x}", state.recovery_ts)),
            "get=oldest_reader" => match *self.inner.faults.oldest_reader.lock() {
                Some(ts) => Ok(format!("{ts:x}")),
                None => Err(CoreError::not_found("no open read transactions")),
            },
            other => Err(CoreError::new(
                CoreCode::Invalid,
                format!("unknown timestamp query: {other}"),
            )),
        }
    }

    fn rollback_to_stable(&self) -> CoreResult<()> {
        if self.inner.faults.fail_rollback.swap(false, Ordering::SeqCst) {
            return Err(CoreError::new(
                CoreCode::Other(-31803),
                "injected rollback failure",
            ));
        }
        let state = self.inner.state.lock();
        CoreInner::check_open(&state)?;
        self.inner.rollback_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct MemSession {
    inner: Arc<CoreInner>,
}

impl CoreSession for MemSession {
    fn open_cursor(&mut self, uri: &str) -> CoreResult<Box<dyn CoreCursor>> {
        let state = self.inner.state.lock();
        CoreInner::check_open(&state)?;
        let kind = if uri == "metadata:create" {
            let mut entries: Vec<(String, Vec<u8>)> = state
                .tables
                .iter()
                .map(|(uri, t)| (uri.clone(), t.config.clone().into_bytes()))
                .collect();
            entries.sort();
            CursorKind::Snapshot(entries)
        } else if uri == "backup:" {
            let mut files = vec![META_FILE.to_string()];
            for uri in state.tables.keys() {
                if let Some(ident) = uri.strip_prefix("table:") {
                    files.push(format!("{ident}.wt"));
                }
            }
            if state.log_enabled {
                // Log files are reported by bare name; they live under the
                // journal directory on disk.
                files.push(LOG_FILE.to_string());
            }
            files.sort();
            CursorKind::Snapshot(files.into_iter().map(|f| (f, Vec::new())).collect())
        } else if uri.starts_with("table:") {
            if !state.tables.contains_key(uri) {
                return Err(CoreError::no_entry(format!("no such table: {uri}")));
            }
            let entries: Vec<(String, Vec<u8>)> = state.tables[uri]
                .rows
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            CursorKind::Table {
                uri: uri.to_string(),
                entries,
            }
        } else {
            return Err(CoreError::new(
                CoreCode::Invalid,
                format!("unsupported cursor uri: {uri}"),
            ));
        };
        Ok(Box::new(MemCursor {
            inner: self.inner.clone(),
            kind,
            pos: None,
        }))
    }

    fn create(&mut self, uri: &str, config: &str) -> CoreResult<()> {
        let mut state = self.inner.state.lock();
        CoreInner::check_open(&state)?;
        if state.read_only {
            return Err(CoreError::new(CoreCode::Invalid, "connection is read-only"));
        }
        state.tables.entry(uri.to_string()).or_insert(TableData {
            config: config.to_string(),
            rows: BTreeMap::new(),
        });
        self.inner.persist_locked(&state, None)
    }

    fn drop_table(&mut self, uri: &str, _config: &str) -> CoreResult<()> {
        {
            let mut busy = self.inner.faults.drop_busy.lock();
            if let Some(left) = busy.get_mut(uri) {
                if *left > 0 {
                    *left -= 1;
                    return Err(CoreError::busy(format!("table in use: {uri}")));
                }
                busy.remove(uri);
            }
        }
        let mut state = self.inner.state.lock();
        CoreInner::check_open(&state)?;
        if state.tables.remove(uri).is_none() {
            return Err(CoreError::no_entry(format!("no such table: {uri}")));
        }
        if let Some(file) = table_file_path(&self.inner.path, uri) {
            let _ = std::fs::remove_file(file);
        }
        self.inner.persist_locked(&state, None)
    }

    fn verify(&mut self, uri: &str) -> CoreResult<()> {
        if let Some(code) = self.inner.faults.verify_errors.lock().get(uri) {
            return Err(CoreError::new(*code, format!("verify failed for {uri}")));
        }
        let state = self.inner.state.lock();
        CoreInner::check_open(&state)?;
        if !state.tables.contains_key(uri) {
            return Err(CoreError::no_entry(format!("no such table: {uri}")));
        }
        match table_file_path(&self.inner.path, uri) {
            Some(file) if file.exists() => Ok(()),
            _ => Err(CoreError::no_entry(format!("data file missing for {uri}"))),
        }
    }

    fn salvage(&mut self, uri: &str) -> CoreResult<()> {
        if let Some(code) = self.inner.faults.salvage_errors.lock().get(uri) {
            return Err(CoreError::new(*code, format!("salvage failed for {uri}")));
        }
        let state = self.inner.state.lock();
        CoreInner::check_open(&state)?;
        if !state.tables.contains_key(uri) {
            return Err(CoreError::no_entry(format!("no such table: {uri}")));
        }
        self.inner.faults.verify_errors.lock().remove(uri);
        Ok(())
    }

    fn alter(&mut self, uri: &str, config: &str) -> CoreResult<()> {
        let mut state = self.inner.state.lock();
        CoreInner::check_open(&state)?;
        if !state.tables.contains_key(uri) {
            return Err(CoreError::no_entry(format!("no such table: {uri}")));
        }
        state.alter_log.push((uri.to_string(), config.to_string()));
        Ok(())
    }

    fn checkpoint(&mut self, config: &str) -> CoreResult<()> {
        {
            let mut errors = self.inner.faults.checkpoint_errors.lock();
            if !errors.is_empty() {
                let code = errors.remove(0);
                return Err(CoreError::new(code, "injected checkpoint failure"));
            }
        }
        let state = self.inner.state.lock();
        CoreInner::check_open(&state)?;
        let use_timestamp = !config.contains("use_timestamp=false");
        let checkpoint_ts = if use_timestamp { state.stable_ts } else { 0 };
        self.inner.persist_locked(&state, Some(checkpoint_ts))
    }

    fn log_flush(&mut self, _config: &str) -> CoreResult<()> {
        let state = self.inner.state.lock();
        CoreInner::check_open(&state)?;
        if !state.log_enabled {
            return Err(CoreError::new(CoreCode::Invalid, "logging is not enabled"));
        }
        Ok(())
    }

    fn table_metadata(&mut self, uri: &str) -> CoreResult<String> {
        let state = self.inner.state.lock();
        CoreInner::check_open(&state)?;
        state
            .tables
            .get(uri)
            .map(|t| t.config.clone())
            .ok_or_else(|| CoreError::no_entry(format!("no such table: {uri}")))
    }
}

enum CursorKind {
    Snapshot(Vec<(String, Vec<u8>)>),
    Table {
        uri: String,
        entries: Vec<(String, Vec<u8>)>,
    },
}

struct MemCursor {
    inner: Arc<CoreInner>,
    kind: CursorKind,
    pos: Option<usize>,
}

impl MemCursor {
    fn entries(&self) -> &Vec<(String, Vec<u8>)> {
        match &self.kind {
            CursorKind::Snapshot(entries) => entries,
            CursorKind::Table { entries, .. } => entries,
        }
    }

    fn current(&self) -> CoreResult<&(String, Vec<u8>)> {
        let pos = self
            .pos
            .ok_or_else(|| CoreError::new(CoreCode::Invalid, "cursor is not positioned"))?;
        self.entries()
            .get(pos)
            .ok_or_else(|| CoreError::not_found("cursor past the end"))
    }
}

impl CoreCursor for MemCursor {
    fn next(&mut self) -> CoreResult<bool> {
        let next = match self.pos {
            None => 0,
            Some(p) => p + 1,
        };
        if next >= self.entries().len() {
            self.pos = Some(self.entries().len());
            return Ok(false);
        }
        self.pos = Some(next);
        Ok(true)
    }

    fn key(&self) -> CoreResult<String> {
        Ok(self.current()?.0.clone())
    }

    fn value(&self) -> CoreResult<Vec<u8>> {
        Ok(self.current()?.1.clone())
    }

    fn search(&mut self, key: &str) -> CoreResult<bool> {
        match self.entries().iter().position(|(k, _)| k == key) {
            Some(pos) => {
                self.pos = Some(pos);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn insert(&mut self, key: &str, value: &[u8]) -> CoreResult<()> {
        let CursorKind::Table { uri, entries } = &mut self.kind else {
            return Err(CoreError::new(
                CoreCode::Invalid,
                "cursor does not support writes",
            ));
        };
        let mut state = self.inner.state.lock();
        CoreInner::check_open(&state)?;
        let Some(table) = state.tables.get_mut(uri.as_str()) else {
            return Err(CoreError::no_entry(format!("no such table: {uri}")));
        };
        table.rows.insert(key.to_string(), value.to_vec());
        match entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value.to_vec(),
            None => entries.push((key.to_string(), value.to_vec())),
        }
        Ok(())
    }

    fn remove(&mut self, key: &str) -> CoreResult<()> {
        let CursorKind::Table { uri, entries } = &mut self.kind else {
            return Err(CoreError::new(
                CoreCode::Invalid,
                "cursor does not support writes",
            ));
        };
        let mut state = self.inner.state.lock();
        CoreInner::check_open(&state)?;
        let Some(table) = state.tables.get_mut(uri.as_str()) else {
            return Err(CoreError::no_entry(format!("no such table: {uri}")));
        };
        if table.rows.remove(key).is_none() {
            return Err(CoreError::not_found(format!("no such key: {key}")));
        }
        entries.retain(|(k, _)| k != key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{MemCoreDriver, LOG_FILE, META_FILE};
    use crate::core::{CoreCode, CoreConnection, CoreCursor, CoreDriver, CoreSession, CursorIter};
    use tempfile::tempdir;

    #[test]
    fn create_open_roundtrip_preserves_tables() {
        let dir = tempdir().expect("tempdir");
        let driver = MemCoreDriver::new();
        let conn = driver
            .open(dir.path(), "create,compatibility=(require_min=\"1.2.0\")")
            .expect("open");
        {
            let mut session = conn.open_session().expect("session");
            session.create("table:foo", "key_format=S").expect("create");
            let mut cursor = session.open_cursor("table:foo").expect("cursor");
            cursor.insert("a", b"1").expect("insert");
            drop(cursor);
            session
                .checkpoint("use_timestamp=false")
                .expect("checkpoint");
        }
        conn.close("").expect("close");

        let driver2 = MemCoreDriver::new();
        let _conn2 = driver2
            .open(dir.path(), "compatibility=(require_min=\"1.2.0\")")
            .expect("reopen");
        let core2 = driver2.connections()[0].clone();
        assert_eq!(core2.table_names(), vec!["table:foo".to_string()]);
    }

    #[test]
    fn require_min_rejects_newer_than_disk() {
        let dir = tempdir().expect("tempdir");
        let driver = MemCoreDriver::new();
        let conn = driver
            .open(dir.path(), "create,compatibility=(require_min=\"1.0.0\")")
            .expect("open");
        conn.close("").expect("close");

        let driver2 = MemCoreDriver::new();
        let err = driver2
            .open(dir.path(), "compatibility=(require_min=\"1.2.0\")")
            .expect_err("must reject");
        assert_eq!(err.code, CoreCode::Invalid);
        let _ok = driver2
            .open(dir.path(), "compatibility=(require_min=\"1.0.0\")")
            .expect("old version opens");
    }

    #[test]
    fn injected_open_error_clears_on_salvage() {
        let dir = tempdir().expect("tempdir");
        let driver = MemCoreDriver::new();
        driver.faults().set_open_error(CoreCode::TrySalvage);
        let err = driver.open(dir.path(), "create").expect_err("fails");
        assert_eq!(err.code, CoreCode::TrySalvage);
        let _conn = driver
            .open(dir.path(), "create,salvage=true")
            .expect("salvage opens");
    }

    #[test]
    fn backup_cursor_lists_meta_and_tables() {
        let dir = tempdir().expect("tempdir");
        let driver = MemCoreDriver::new();
        let conn = driver
            .open(dir.path(), "create,log=(enabled=true,path=journal)")
            .expect("open");
        let mut session = conn.open_session().expect("session");
        session.create("table:bar", "cfg").expect("create");
        let cursor = session.open_cursor("backup:").expect("backup cursor");
        let names: Vec<String> = CursorIter::new(cursor).map(|r| r.expect("entry").0).collect();
        assert!(names.contains(&META_FILE.to_string()));
        assert!(names.contains(&"bar.wt".to_string()));
        assert!(names.contains(&LOG_FILE.to_string()));
    }

    #[test]
    fn drop_busy_injection_counts_down() {
        let dir = tempdir().expect("tempdir");
        let driver = MemCoreDriver::new();
        let conn = driver.open(dir.path(), "create").expect("open");
        let mut session = conn.open_session().expect("session");
        session.create("table:busy", "cfg").expect("create");
        driver.faults().set_drop_busy("table:busy", 2);
        assert!(session.drop_table("table:busy", "force").is_err());
        assert!(session.drop_table("table:busy", "force").is_err());
        session.drop_table("table:busy", "force").expect("third try");
    }

    #[test]
    fn close_with_timestamp_persists_recovery_point() {
        let dir = tempdir().expect("tempdir");
        let driver = MemCoreDriver::new();
        let conn = driver.open(dir.path(), "create").expect("open");
        conn.set_timestamp("stable_timestamp=100").expect("stable");
        conn.close("use_timestamp=true").expect("close");

        let driver2 = MemCoreDriver::new();
        let conn2 = driver2.open(dir.path(), "").expect("reopen");
        assert_eq!(
            conn2.query_timestamp("get=recovery").expect("recovery"),
            "100"
        );
    }
}
