//! Ident lifecycle: create, drop (with deferred retry on busy), salvage,
//! rebuild and orphan recovery.
//!
//! An ident is the stable name of a user table and maps 1:1 to the storage
//! core URI `table:<ident>`. Idents may contain `/`, which the engine
//! mirrors as subdirectories under the data path.

use crate::clock::ClockSource;
use crate::core::{invariant_core_ok, CoreConnection, CoreCursor, CoreSession, CursorIter};
use crate::error::{CapstanError, RepairOutcome};
use crate::fsutil::{fsync_parent_dir, fsync_rename};
use crate::session_cache::SessionCache;
use crate::sizes::SIZE_STORER_IDENT;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const DROP_RETRY_CONFIG: &str = "force,checkpoint_wait=false";

/// Collection-level options threaded into record-store creation.
#[derive(Debug, Clone, Default)]
pub struct RecordStoreOptions {
    pub capped: bool,
    pub capped_size: Option<i64>,
    pub capped_max_docs: Option<i64>,
    /// Engine-specific config string supplied by the collection catalog.
    pub custom_config: String,
}

/// Key-prefix grouping for tables that share a physical table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KvPrefix(Option<i64>);

impl KvPrefix {
    pub const NOT_PREFIXED: KvPrefix = KvPrefix(None);

    pub fn prefixed(value: i64) -> KvPrefix {
        KvPrefix(Some(value))
    }

    pub fn is_prefixed(self) -> bool {
        self.0.is_some()
    }
}

/// Thin handle over an existing record-store table. Data access lives in
/// the record-store layer; the control plane only threads flags through.
#[derive(Debug, Clone)]
pub struct RecordStore {
    pub ns: String,
    pub uri: String,
    pub capped: bool,
    pub capped_max_size: i64,
    pub capped_max_docs: i64,
    pub ephemeral: bool,
    pub read_only: bool,
}

#[derive(Debug, Clone, Default)]
pub struct IndexConfig {
    pub name: String,
    pub unique: bool,
    /// App metadata rendered into create/alter config strings.
    pub app_metadata: String,
}

#[derive(Debug, Clone)]
pub struct SortedIndex {
    pub uri: String,
    pub unique: bool,
    pub read_only: bool,
}

pub struct IdentManager {
    conn: Arc<dyn CoreConnection>,
    session_cache: Arc<SessionCache>,
    clock: Arc<dyn ClockSource>,
    path: PathBuf,
    engine_name: String,
    rs_options: String,
    index_options: String,
    drop_queue: Arc<Mutex<VecDeque<String>>>,
    previous_checked_millis: AtomicU64,
    in_repair_mode: bool,
    ephemeral: bool,
    read_only: bool,
}

impl IdentManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        conn: Arc<dyn CoreConnection>,
        session_cache: Arc<SessionCache>,
        clock: Arc<dyn ClockSource>,
        path: PathBuf,
        engine_name: String,
        rs_options: String,
        index_options: String,
        in_repair_mode: bool,
        ephemeral: bool,
        read_only: bool,
    ) -> Self {
        let now = clock.now_millis();
        Self {
            conn,
            session_cache,
            clock,
            path,
            engine_name,
            rs_options,
            index_options,
            drop_queue: Arc::new(Mutex::new(VecDeque::new())),
            previous_checked_millis: AtomicU64::new(now),
            in_repair_mode,
            ephemeral,
            read_only,
        }
    }

    pub fn uri(&self, ident: &str) -> String {
        format!("table:{ident}")
    }

    /// Shared handle to the drop queue, for the session cache's
    /// queued-drop cursor filter.
    pub fn drop_queue_handle(&self) -> Arc<Mutex<VecDeque<String>>> {
        self.drop_queue.clone()
    }

    pub fn create_record_store(
        &self,
        ns: &str,
        ident: &str,
        options: &RecordStoreOptions,
        prefix: KvPrefix,
    ) -> Result<(), CapstanError> {
        self.ensure_ident_path(ident)?;
        let config = generate_record_store_config(
            &self.engine_name,
            ns,
            options,
            &self.rs_options,
            prefix.is_prefixed(),
        )?;
        let uri = self.uri(ident);
        debug!(ns, uri = %uri, config = %config, "creating record store");
        let mut session = self.conn.open_session().map_err(CapstanError::Core)?;
        session
            .create(&uri, &config)
            .map_err(CapstanError::Core)
    }

    pub fn get_record_store(
        &self,
        ns: &str,
        ident: &str,
        options: &RecordStoreOptions,
    ) -> RecordStore {
        let capped_max_size = if options.capped {
            options.capped_size.filter(|s| *s > 0).unwrap_or(4096)
        } else {
            -1
        };
        let capped_max_docs = if options.capped {
            options.capped_max_docs.filter(|d| *d > 0).unwrap_or(-1)
        } else {
            -1
        };
        RecordStore {
            ns: ns.to_string(),
            uri: self.uri(ident),
            capped: options.capped,
            capped_max_size,
            capped_max_docs,
            ephemeral: self.ephemeral,
            read_only: self.read_only,
        }
    }

    pub fn create_sorted_index(
        &self,
        ident: &str,
        index: &IndexConfig,
        prefix: KvPrefix,
    ) -> Result<(), CapstanError> {
        self.ensure_ident_path(ident)?;
        let config = generate_index_config(index, &self.index_options, prefix.is_prefixed());
        let uri = self.uri(ident);
        debug!(index = %index.name, uri = %uri, config = %config, "creating sorted index");
        let mut session = self.conn.open_session().map_err(CapstanError::Core)?;
        session
            .create(&uri, &config)
            .map_err(CapstanError::Core)
    }

    pub fn get_sorted_index(&self, ident: &str, index: &IndexConfig) -> SortedIndex {
        SortedIndex {
            uri: self.uri(ident),
            unique: index.unique,
            read_only: self.read_only,
        }
    }

    /// Drops a table. Idempotent: a missing table counts as dropped. A busy
    /// table is queued for the reaper and the call still succeeds.
    pub fn drop_ident(&self, ident: &str) -> Result<(), CapstanError> {
        let uri = self.uri(ident);

        self.session_cache.close_all_cursors(&uri);

        let mut session = self.conn.open_session().map_err(CapstanError::Core)?;
        let ret = session.drop_table(&uri, DROP_RETRY_CONFIG);
        debug!(uri = %uri, ok = ret.is_ok(), "storage core drop");

        match ret {
            Ok(()) => Ok(()),
            Err(e) if e.is_busy() => {
                self.drop_queue.lock().push_back(uri);
                self.session_cache.close_cursors_for_queued_drops();
                Ok(())
            }
            Err(e) if e.is_no_entry() => Ok(()),
            Err(e) => {
                invariant_core_ok::<()>(Err(e));
                unreachable!()
            }
        }
    }

    /// Periodic reaper over the drop queue. Drains `max(10, 10%)` entries;
    /// entries that are still busy are re-queued at the back.
    pub fn drop_some_queued_idents(&self) -> Result<(), CapstanError> {
        let num_in_queue = self.drop_queue.lock().len();

        let mut num_to_delete = 10;
        let ten_percent = num_in_queue / 10;
        if ten_percent > 10 {
            num_to_delete = ten_percent;
        }

        debug!(
            queued = num_in_queue,
            attempting = num_to_delete,
            "reaping queued table drops"
        );
        let mut session = self.conn.open_session().map_err(CapstanError::Core)?;
        for _ in 0..num_to_delete {
            let uri = {
                let mut queue = self.drop_queue.lock();
                match queue.pop_front() {
                    Some(uri) => uri,
                    None => break,
                }
            };
            let ret = session.drop_table(&uri, DROP_RETRY_CONFIG);
            debug!(uri = %uri, ok = ret.is_ok(), "queued storage core drop");
            match ret {
                Ok(()) => {}
                Err(e) if e.is_busy() => {
                    self.drop_queue.lock().push_back(uri);
                }
                Err(e) if e.is_no_entry() => {}
                Err(e) => {
                    invariant_core_ok::<()>(Err(e));
                }
            }
        }
        Ok(())
    }

    /// Cheap, rate-limited predicate for the reaper's caller. At most one
    /// real check per second; under queue-lock contention it conservatively
    /// reports false rather than blocking.
    pub fn have_drops_queued(&self) -> bool {
        let now = self.clock.now_millis();
        let prev = self.previous_checked_millis.load(Ordering::Acquire);
        if now.saturating_sub(prev) < 1000 {
            return false;
        }
        self.previous_checked_millis.store(now, Ordering::Release);

        match self.drop_queue.try_lock() {
            Some(queue) => !queue.is_empty(),
            None => false,
        }
    }

    pub fn queued_drop_count(&self) -> usize {
        self.drop_queue.lock().len()
    }

    pub fn is_drop_queued(&self, ident: &str) -> bool {
        let uri = self.uri(ident);
        self.drop_queue.lock().iter().any(|u| *u == uri)
    }

    pub fn all_idents(&self) -> Result<Vec<String>, CapstanError> {
        let mut session = self.conn.open_session().map_err(CapstanError::Core)?;
        let cursor = session
            .open_cursor("metadata:create")
            .map_err(CapstanError::Core)?;
        let mut all = Vec::new();
        for entry in CursorIter::new(cursor) {
            let (key, _value) = entry.map_err(CapstanError::Core)?;
            let Some((kind, ident)) = key.split_once(':') else {
                continue;
            };
            if kind != "table" || ident == SIZE_STORER_IDENT {
                continue;
            }
            all.push(ident.to_string());
        }
        Ok(all)
    }

    pub fn has_ident(&self, ident: &str) -> Result<bool, CapstanError> {
        let uri = self.uri(ident);
        let mut session = self.conn.open_session().map_err(CapstanError::Core)?;
        let mut cursor = match session.open_cursor("metadata:create") {
            Ok(c) => c,
            Err(e) if e.is_no_entry() => return Ok(false),
            Err(e) => return Err(CapstanError::Core(e)),
        };
        cursor.search(&uri).map_err(CapstanError::Core)
    }

    /// Public salvage entry point: close every cursor over the table, then
    /// verify-and-salvage. Ephemeral engines have nothing on disk to
    /// repair.
    pub fn repair_ident(&self, ident: &str) -> Result<RepairOutcome, CapstanError> {
        let uri = self.uri(ident);
        self.session_cache.close_all_cursors(&uri);
        if self.ephemeral {
            return Ok(RepairOutcome::Clean);
        }
        self.ensure_ident_path(ident)?;
        self.salvage_if_needed(&uri)
    }

    /// Verify, and on failure branch into salvage or rebuild. A clean
    /// verify needs nothing; busy means the table is merely in use and is
    /// skipped; a missing data file rebuilds the ident from metadata; any
    /// other failure runs salvage, falling back to rebuild when the
    /// salvage fails too.
    pub fn salvage_if_needed(&self, uri: &str) -> Result<RepairOutcome, CapstanError> {
        let mut session = self.conn.open_session().map_err(CapstanError::Core)?;

        match session.verify(uri) {
            Ok(()) => {
                info!(uri, "verify succeeded, not salvaging");
                return Ok(RepairOutcome::Clean);
            }
            Err(e) if e.is_busy() => {
                error!(
                    uri,
                    "verify returned busy; the table is being accessed and no repair is \
                     necessary unless other errors are reported"
                );
                return Ok(RepairOutcome::Clean);
            }
            Err(e) if e.is_no_entry() => {
                warn!(uri, "data file is missing, attempting to drop and re-create the table");
                return self.rebuild_ident_with(session.as_mut(), uri);
            }
            Err(e) => {
                info!(uri, reason = %e.reason, "verify failed, running a salvage operation");
            }
        }

        match session.salvage(uri) {
            Ok(()) => {
                info!(uri, "salvaged data");
                Ok(RepairOutcome::Modified)
            }
            Err(e) => {
                warn!(
                    uri,
                    reason = %e.reason,
                    "salvage failed; the file will be moved out of the way and a new ident created"
                );
                self.rebuild_ident_with(session.as_mut(), uri)
            }
        }
    }

    /// Moves the data file aside as `.corrupt` and re-creates the table
    /// from its stored metadata.
    pub fn rebuild_ident(&self, uri: &str) -> Result<RepairOutcome, CapstanError> {
        let mut session = self.conn.open_session().map_err(CapstanError::Core)?;
        self.rebuild_ident_with(session.as_mut(), uri)
    }

    fn rebuild_ident_with(
        &self,
        session: &mut dyn CoreSession,
        uri: &str,
    ) -> Result<RepairOutcome, CapstanError> {
        assert!(self.in_repair_mode, "rebuild requires repair mode");

        let ident = uri
            .strip_prefix("table:")
            .unwrap_or_else(|| panic!("rebuild of non-table uri: {uri}"));

        if let Some(file_path) = self.data_file_path(ident) {
            let corrupt = file_path.with_extension("wt.corrupt");
            warn!(
                from = %file_path.display(),
                to = %corrupt.display(),
                "moving data file to backup"
            );
            fsync_rename(&file_path, &corrupt)?;
        }

        warn!(ident, "rebuilding ident");

        // Reads only the metadata, so safe after moving the file aside.
        let metadata = session.table_metadata(uri).map_err(|e| {
            error!(uri, "failed to get metadata");
            CapstanError::Core(e)
        })?;

        session.drop_table(uri, "").map_err(|e| {
            error!(uri, "failed to drop");
            CapstanError::Core(e)
        })?;

        session.create(uri, &metadata).map_err(|e| {
            error!(uri, config = %metadata, "failed to create with config");
            CapstanError::Core(e)
        })?;
        info!(uri, "successfully re-created table");
        Ok(RepairOutcome::Modified)
    }

    /// Recovers a data file the metadata no longer knows about: park the
    /// orphan, create a fresh empty ident under the same name, swap the
    /// orphan back in, then salvage it.
    #[cfg(not(windows))]
    pub fn recover_orphaned(
        &self,
        ns: &str,
        ident: &str,
        options: &RecordStoreOptions,
    ) -> Result<RepairOutcome, CapstanError> {
        assert!(self.in_repair_mode, "orphan recovery requires repair mode");

        let Some(ident_file) = self.data_file_path(ident) else {
            return Err(CapstanError::NotFound {
                what: format!("data file for ident {ident}"),
            });
        };

        let mut tmp_file = ident_file.clone();
        tmp_file.set_extension("wt.tmp");

        info!(
            from = %ident_file.display(),
            to = %tmp_file.display(),
            "renaming data file to temporary"
        );
        fsync_rename(&ident_file, &tmp_file)?;

        info!(ns, ident, "creating new record store for orphan recovery");
        self.create_record_store(ns, ident, options, KvPrefix::NOT_PREFIXED)?;

        info!(path = %ident_file.display(), "moving orphaned data file back");
        std::fs::remove_file(&ident_file)?;
        fsync_parent_dir(&ident_file)?;
        fsync_rename(&tmp_file, &ident_file)?;

        info!(ident, "salvaging ident");
        let uri = self.uri(ident);
        let mut session = self.conn.open_session().map_err(CapstanError::Core)?;
        match session.salvage(&uri) {
            Ok(()) => Ok(RepairOutcome::Modified),
            Err(e) => {
                warn!(reason = %e.reason, "could not salvage data, rebuilding ident");
                self.rebuild_ident_with(session.as_mut(), &uri)
            }
        }
    }

    #[cfg(windows)]
    pub fn recover_orphaned(
        &self,
        _ns: &str,
        _ident: &str,
        _options: &RecordStoreOptions,
    ) -> Result<RepairOutcome, CapstanError> {
        Err(CapstanError::Unsupported {
            message: "orphan file recovery is not supported on Windows".into(),
        })
    }

    /// Metadata-only alter. `exclusive_refreshed=false` keeps the call from
    /// taking exclusive table access, so concurrent readers are unaffected.
    pub fn alter_ident_metadata(
        &self,
        ident: &str,
        index: &IndexConfig,
    ) -> Result<(), CapstanError> {
        let uri = self.uri(ident);
        let alter = format!("{}exclusive_refreshed=false,", index.app_metadata);
        let mut session = self.conn.open_session().map_err(CapstanError::Core)?;
        invariant_core_ok(session.alter(&uri, &alter));
        Ok(())
    }

    pub fn data_file_path(&self, ident: &str) -> Option<PathBuf> {
        let path = self.path.join(format!("{ident}.wt"));
        if path.exists() {
            Some(path)
        } else {
            None
        }
    }

    /// Pre-creates directories for idents that contain `/`.
    pub fn ensure_ident_path(&self, ident: &str) -> Result<(), CapstanError> {
        let mut start = 0;
        while let Some(idx) = ident[start..].find('/') {
            let dir = &ident[..start + idx];
            let subdir = self.path.join(dir);
            if !subdir.exists() {
                debug!(dir, "creating subdirectory");
                std::fs::create_dir(&subdir).map_err(|e| {
                    error!(path = %subdir.display(), "error creating path: {e}");
                    CapstanError::Io(e)
                })?;
            }
            start += idx + 1;
        }
        Ok(())
    }
}

fn generate_record_store_config(
    engine_name: &str,
    ns: &str,
    options: &RecordStoreOptions,
    extra: &str,
    prefixed: bool,
) -> Result<String, CapstanError> {
    let mut config = String::new();
    config.push_str("type=file,");
    config.push_str("memory_page_max=10m,");
    config.push_str("split_pct=90,");
    config.push_str("leaf_value_max=64MB,");
    config.push_str("checksum=on,");
    if prefixed {
        config.push_str("key_format=qq,value_format=u,");
    } else {
        config.push_str("key_format=q,value_format=u,");
    }
    if !extra.is_empty() {
        config.push_str(extra);
        if !extra.ends_with(',') {
            config.push(',');
        }
    }
    if !options.custom_config.is_empty() {
        if options.custom_config.contains('=') {
            config.push_str(&options.custom_config);
            if !options.custom_config.ends_with(',') {
                config.push(',');
            }
        } else {
            return Err(CapstanError::InvalidConfig {
                message: format!(
                    "custom record-store config is not a key=value list: {}",
                    options.custom_config
                ),
            });
        }
    }
    config.push_str(&format!(
        "app_metadata=(formatVersion=1,engine={engine_name},ns={ns}),"
    ));
    Ok(config)
}

fn generate_index_config(index: &IndexConfig, extra: &str, prefixed: bool) -> String {
    let mut config = String::new();
    config.push_str("type=file,");
    config.push_str("internal_page_max=16k,");
    config.push_str("leaf_page_max=16k,");
    config.push_str("checksum=on,");
    if prefixed {
        config.push_str("key_format=qu,value_format=u,");
    } else {
        config.push_str("key_format=u,value_format=u,");
    }
    if !extra.is_empty() {
        config.push_str(extra);
        if !extra.ends_with(',') {
            config.push(',');
        }
    }
    if !index.app_metadata.is_empty() {
        config.push_str(&index.app_metadata);
        if !index.app_metadata.ends_with(',') {
            config.push(',');
        }
    }
    config.push_str(&format!(
        "app_metadata=(formatVersion=8,unique={}),",
        index.unique
    ));
    config
}

#[cfg(test)]
mod tests {
    use super::{IdentManager, IndexConfig, KvPrefix, RecordStoreOptions};
    use crate::clock::ManualClock;
    use crate::core::memcore::MemCoreDriver;
    use crate::core::{CoreCode, CoreDriver};
    use crate::error::RepairOutcome;
    use crate::session_cache::SessionCache;
    use std::sync::Arc;
    use tempfile::tempdir;

    struct Fixture {
        _dir: tempfile::TempDir,
        driver: MemCoreDriver,
        clock: Arc<ManualClock>,
        idents: IdentManager,
    }

    fn fixture(repair: bool) -> Fixture {
        let dir = tempdir().expect("tempdir");
        let driver = MemCoreDriver::new();
        let conn = driver.open(dir.path(), "create").expect("open");
        let cache = Arc::new(SessionCache::new(conn.clone(), false));
        let clock = Arc::new(ManualClock::new());
        let idents = IdentManager::new(
            conn,
            cache,
            clock.clone(),
            dir.path().to_path_buf(),
            "capstan".into(),
            String::new(),
            String::new(),
            repair,
            false,
            false,
        );
        Fixture {
            _dir: dir,
            driver,
            clock,
            idents,
        }
    }

    fn create(f: &Fixture, ident: &str) {
        f.idents
            .create_record_store(
                &format!("db.{ident}"),
                ident,
                &RecordStoreOptions::default(),
                KvPrefix::NOT_PREFIXED,
            )
            .expect("create record store");
    }

    #[test]
    fn create_and_enumerate_idents() {
        let f = fixture(false);
        create(&f, "collection-1");
        create(&f, "index-1");
        let mut idents = f.idents.all_idents().expect("all idents");
        idents.sort();
        assert_eq!(idents, vec!["collection-1", "index-1"]);
        assert!(f.idents.has_ident("collection-1").expect("has"));
        assert!(!f.idents.has_ident("absent").expect("has not"));
    }

    #[test]
    fn size_storer_is_hidden_from_ident_listing() {
        let f = fixture(false);
        create(&f, "visible");
        let conn = f.driver.connections()[0].clone();
        use crate::core::{CoreConnection, CoreSession};
        let mut session = conn.open_session().expect("session");
        session
            .create("table:sizeStorer", "cfg")
            .expect("create size storer");
        let idents = f.idents.all_idents().expect("all idents");
        assert_eq!(idents, vec!["visible"]);
    }

    #[test]
    fn drop_of_missing_ident_is_ok() {
        let f = fixture(false);
        f.idents.drop_ident("never-existed").expect("idempotent");
        assert_eq!(f.idents.queued_drop_count(), 0);
    }

    #[test]
    fn busy_drop_queues_and_reaper_retries() {
        let f = fixture(false);
        create(&f, "busy-table");
        f.driver.faults().set_drop_busy("table:busy-table", 2);

        f.idents.drop_ident("busy-table").expect("queued");
        assert!(f.idents.is_drop_queued("busy-table"));
        assert_eq!(f.idents.queued_drop_count(), 1);

        // Still busy on the first reap: re-queued at the back.
        f.idents.drop_some_queued_idents().expect("reap 1");
        assert_eq!(f.idents.queued_drop_count(), 1);

        f.idents.drop_some_queued_idents().expect("reap 2");
        assert_eq!(f.idents.queued_drop_count(), 0);
        assert!(!f.idents.has_ident("busy-table").expect("gone"));
    }

    #[test]
    fn drop_queue_preserves_insertion_order() {
        let f = fixture(false);
        for name in ["q1", "q2", "q3"] {
            create(&f, name);
            f.driver.faults().set_drop_busy(&f.idents.uri(name), 1);
            f.idents.drop_ident(name).expect("queued");
        }
        let queue = f.idents.drop_queue_handle();
        let order: Vec<String> = queue.lock().iter().cloned().collect();
        assert_eq!(order, vec!["table:q1", "table:q2", "table:q3"]);
    }

    #[test]
    fn have_drops_queued_is_rate_limited() {
        let f = fixture(false);
        create(&f, "gated");
        f.driver.faults().set_drop_busy("table:gated", 10);
        f.idents.drop_ident("gated").expect("queued");

        // Inside the 1s gate: conservatively false.
        assert!(!f.idents.have_drops_queued());
        f.clock.advance_millis(1001);
        assert!(f.idents.have_drops_queued());
        // Gate re-arms.
        assert!(!f.idents.have_drops_queued());
    }

    #[test]
    fn salvage_paths() {
        let f = fixture(true);
        create(&f, "fine");
        create(&f, "sick");
        let fine = f.idents.uri("fine");
        let sick = f.idents.uri("sick");

        // Clean verify.
        assert_eq!(
            f.idents.salvage_if_needed(&fine).expect("clean"),
            RepairOutcome::Clean
        );

        // Busy verify skips.
        f.driver.faults().set_verify_error(&fine, CoreCode::Busy);
        assert_eq!(
            f.idents.salvage_if_needed(&fine).expect("busy skip"),
            RepairOutcome::Clean
        );
        f.driver.faults().clear_verify_error(&fine);

        // Generic verify failure salvages.
        f.driver
            .faults()
            .set_verify_error(&sick, CoreCode::Other(-31802));
        assert_eq!(
            f.idents.salvage_if_needed(&sick).expect("salvaged"),
            RepairOutcome::Modified
        );
    }

    #[test]
    fn missing_file_rebuilds_from_metadata() {
        let f = fixture(true);
        create(&f, "lost");
        let file = f._dir.path().join("lost.wt");
        std::fs::remove_file(&file).expect("remove data file");

        let outcome = f
            .idents
            .salvage_if_needed(&f.idents.uri("lost"))
            .expect("rebuilt");
        assert_eq!(outcome, RepairOutcome::Modified);
        assert!(f.idents.has_ident("lost").expect("still known"));
        assert!(file.exists());
    }

    #[test]
    fn failed_salvage_moves_file_to_corrupt() {
        let f = fixture(true);
        create(&f, "wrecked");
        let uri = f.idents.uri("wrecked");
        f.driver
            .faults()
            .set_verify_error(&uri, CoreCode::Other(-31802));
        f.driver
            .faults()
            .set_salvage_error(&uri, CoreCode::Other(-31802));

        let outcome = f.idents.salvage_if_needed(&uri).expect("rebuilt");
        assert_eq!(outcome, RepairOutcome::Modified);
        assert!(f._dir.path().join("wrecked.wt.corrupt").exists());
        assert!(f._dir.path().join("wrecked.wt").exists());
    }

    #[cfg(not(windows))]
    #[test]
    fn orphan_recovery_roundtrip() {
        let f = fixture(true);
        create(&f, "orphan");
        // Forget the table in core metadata but leave the file behind.
        let conn = f.driver.connections()[0].clone();
        use crate::core::{CoreConnection, CoreSession};
        let mut session = conn.open_session().expect("session");
        session
            .drop_table("table:orphan", "force")
            .expect("metadata drop");
        std::fs::write(f._dir.path().join("orphan.wt"), b"orphan bytes").expect("restore file");

        let outcome = f
            .idents
            .recover_orphaned("db.orphan", "orphan", &RecordStoreOptions::default())
            .expect("recovered");
        assert_eq!(outcome, RepairOutcome::Modified);
        assert!(f.idents.has_ident("orphan").expect("known again"));
        assert!(f._dir.path().join("orphan.wt").exists());
        assert!(!f._dir.path().join("orphan.wt.tmp").exists());
    }

    #[test]
    fn subdirectory_idents_get_directories() {
        let f = fixture(false);
        create(&f, "mydb/collection-7");
        assert!(f._dir.path().join("mydb").is_dir());
        assert!(f.idents.has_ident("mydb/collection-7").expect("has"));
    }

    #[test]
    fn alter_is_non_exclusive() {
        let f = fixture(false);
        create(&f, "altered");
        f.idents
            .alter_ident_metadata(
                "altered",
                &IndexConfig {
                    name: "x".into(),
                    unique: false,
                    app_metadata: "app_metadata=(v=2),".into(),
                },
            )
            .expect("alter");
        let log = f.driver.connections()[0].alter_log();
        assert_eq!(log.len(), 1);
        assert!(log[0].1.contains("exclusive_refreshed=false"));
    }

    #[test]
    fn capped_flags_thread_through() {
        let f = fixture(false);
        create(&f, "capped");
        let rs = f.idents.get_record_store(
            "db.capped",
            "capped",
            &RecordStoreOptions {
                capped: true,
                capped_size: Some(8192),
                capped_max_docs: Some(10),
                custom_config: String::new(),
            },
        );
        assert!(rs.capped);
        assert_eq!(rs.capped_max_size, 8192);
        assert_eq!(rs.capped_max_docs, 10);
        let plain = f
            .idents
            .get_record_store("db.plain", "capped", &RecordStoreOptions::default());
        assert_eq!(plain.capped_max_size, -1);
    }
}
