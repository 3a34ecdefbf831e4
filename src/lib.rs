//! Capstan: the control plane of an embedded, transactional,
//! timestamp-aware KV storage subsystem.
//!
//! The storage core (tables, cursors, WAL, checkpoint mechanics) is driven
//! through the traits in [`core`]; this crate owns bootstrap and version
//! negotiation, ident lifecycle, timestamp coordination, the background
//! worker trio, hot backup, and at-rest encryption key management.

pub mod backup;
pub mod clock;
pub mod config;
pub mod core;
pub mod error;
pub mod fsutil;
pub mod handle;
pub mod idents;
pub mod keydb;
pub mod repl;
pub mod session_cache;
pub mod sizes;
pub mod tickets;
pub mod timestamps;
pub mod workers;

pub use crate::config::{CapstanConfig, CipherMode};
pub use crate::error::{CapstanError, ErrorCode, RepairOutcome};
pub use crate::timestamps::Timestamp;

use crate::backup::{BackupInstance, FileCopySpec, InstanceBackup, ObjectStore, S3BackupParams};
use crate::clock::{ClockSource, PeriodicTracker, SystemClock};
use crate::core::{
    invariant_core_ok, CoreCode, CoreConnection, CoreDriver, CoreSession, CursorIter,
};
use crate::handle::{build_open_config, nojournal_transition, open_core, FileVersion};
use crate::idents::{IdentManager, IndexConfig, KvPrefix, RecordStore, RecordStoreOptions, SortedIndex};
use crate::keydb::{bootstrap_encryption, encryption_extension_config, EncryptionKeyDb, MasterKeyStore};
use crate::repl::EngineContext;
use crate::session_cache::SessionCache;
use crate::sizes::{SizeInfo, SizeStorer, SIZE_STORER_IDENT};
use crate::tickets::{PoolStats, TicketPool};
use crate::timestamps::{TimestampCoordinator, TimestampState};
use crate::workers::{
    spawn_checkpointer, spawn_journal_flusher, spawn_session_sweeper, CheckpointerParams,
    WakeSignal, WorkerHandle,
};
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const ENGINE_NAME: &str = "capstan";

type OplogThreadInit = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Process-level mode flags fixed for the lifetime of the engine.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub durable: bool,
    pub ephemeral: bool,
    pub repair: bool,
    pub read_only: bool,
    /// Leak storage-core memory on close for faster shutdown. Turn off
    /// when running under a leak checker.
    pub leak_memory_on_shutdown: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            durable: true,
            ephemeral: false,
            repair: false,
            read_only: false,
            leak_memory_on_shutdown: true,
        }
    }
}

/// Everything `CapstanEngine::open` needs besides the driver and the path.
pub struct EngineParams {
    pub config: CapstanConfig,
    pub settings: EngineSettings,
    pub context: EngineContext,
    pub key_store: Option<Arc<dyn MasterKeyStore>>,
    pub clock: Arc<dyn ClockSource>,
    /// Customization-hook config appended to the storage-core open for
    /// system tables.
    pub table_create_config: String,
}

impl Default for EngineParams {
    fn default() -> Self {
        Self {
            config: CapstanConfig::default(),
            settings: EngineSettings::default(),
            context: EngineContext::standalone(),
            key_store: None,
            clock: Arc::new(SystemClock::new()),
            table_create_config: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrentTransactionStats {
    pub read: PoolStats,
    pub write: PoolStats,
}

impl std::fmt::Debug for CapstanEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapstanEngine").finish_non_exhaustive()
    }
}

pub struct CapstanEngine {
    config: CapstanConfig,
    settings: EngineSettings,
    path: PathBuf,
    driver: Arc<dyn CoreDriver>,
    conn: Arc<dyn CoreConnection>,
    open_config: String,
    file_version: FileVersion,
    keep_data_history: bool,
    recovery_timestamp: Timestamp,
    context: EngineContext,
    keydb: Option<Arc<EncryptionKeyDb>>,
    session_cache: Arc<SessionCache>,
    idents: IdentManager,
    coordinator: TimestampCoordinator,
    ts_state: Arc<TimestampState>,
    checkpoint_wake: Arc<WakeSignal>,
    sweeper: Mutex<Option<WorkerHandle>>,
    journal_flusher: Mutex<Option<WorkerHandle>>,
    checkpointer: Mutex<Option<WorkerHandle>>,
    size_storer: Mutex<Option<Arc<SizeStorer>>>,
    size_storer_uri: String,
    size_sync_tracker: PeriodicTracker,
    read_tickets: TicketPool,
    write_tickets: TicketPool,
    /// Held for reads while both backup cursors are opened, so the two
    /// instances' logs are captured in a consistent order. Writers at the
    /// command layer take it for writing.
    global_lock: RwLock<()>,
    backup_session: Mutex<Option<Vec<InstanceBackup>>>,
    oplog_manager_count: Mutex<u32>,
    oplog_thread_init: Mutex<Option<OplogThreadInit>>,
    repair_modified: AtomicBool,
    closed: AtomicBool,
}

impl CapstanEngine {
    pub fn open(
        driver: Arc<dyn CoreDriver>,
        path: &Path,
        params: EngineParams,
    ) -> Result<CapstanEngine, CapstanError> {
        let EngineParams {
            config,
            settings,
            context,
            key_store,
            clock,
            table_create_config,
        } = params;

        config.validate()?;
        if settings.read_only && settings.durable {
            return Err(CapstanError::InvalidConfig {
                message: "a read-only engine cannot be durable".into(),
            });
        }

        std::fs::create_dir_all(path)?;
        let path = path.to_path_buf();

        let journal_path = path.join("journal");
        if settings.durable && !journal_path.exists() {
            std::fs::create_dir(&journal_path).map_err(|e| {
                error!(path = %journal_path.display(), "error creating journal dir: {e}");
                CapstanError::Io(e)
            })?;
        }

        // Encryption bootstrap, including one-shot master key rotation
        // (which aborts startup with a rotation-finished status).
        let keydb = if config.enable_encryption {
            let store = key_store.as_deref().ok_or_else(|| CapstanError::InvalidConfig {
                message: "enable_encryption requires a master key store".into(),
            })?;
            bootstrap_encryption(driver.as_ref(), &path, &config, store)?
        } else {
            None
        };

        let encryption_ext = keydb
            .as_ref()
            .map(|_| encryption_extension_config(config.cipher_mode));
        let mut open_config = build_open_config(
            &config,
            settings.read_only,
            encryption_ext.as_deref(),
            &table_create_config,
        );

        if !settings.durable && !settings.read_only {
            // A journal left behind by a durable run must be replayed and
            // removed before reopening without one.
            if journal_path.exists() {
                nojournal_transition(driver.as_ref(), &path, &open_config)?;
            }
            // Later in the config string, so it overrides the journal
            // settings above.
            open_config.push_str(",log=(enabled=false),");
        }

        info!(config = %open_config, "storage core open config");
        let opened = open_core(driver.as_ref(), &path, &open_config, settings.repair)?;
        let conn = opened.conn;
        let repair_modified = AtomicBool::new(false);
        if opened.salvaged_metadata {
            warn!("storage core metadata salvaged");
            repair_modified.store(true, Ordering::Release);
        }

        let recovery_timestamp = Timestamp::from_hex(
            &conn
                .query_timestamp("get=recovery")
                .map_err(CapstanError::Core)?,
        )?;
        info!(recovery_timestamp = %recovery_timestamp, "storage core recovery timestamp");

        let session_cache = Arc::new(SessionCache::new(conn.clone(), settings.durable));

        let idents = IdentManager::new(
            conn.clone(),
            session_cache.clone(),
            clock.clone(),
            path.clone(),
            ENGINE_NAME.to_string(),
            config.record_store_options.clone(),
            config.index_options.clone(),
            settings.repair,
            settings.ephemeral,
            settings.read_only,
        );
        {
            let queue = idents.drop_queue_handle();
            session_cache.set_queued_drop_filter(Arc::new(move |uri| {
                queue.lock().iter().any(|queued| queued.as_str() == uri)
            }));
        }

        let keep_data_history = config.enable_majority_read_concern;
        let ts_state = Arc::new(TimestampState::default());
        let checkpoint_wake = Arc::new(WakeSignal::new());
        let coordinator = TimestampCoordinator::new(
            conn.clone(),
            ts_state.clone(),
            checkpoint_wake.clone(),
            context.oplog.clone(),
            context.snapshots.clone(),
            keep_data_history,
            recovery_timestamp,
        );

        let sweeper = spawn_session_sweeper(
            session_cache.clone(),
            config.session_close_idle_time_secs,
        );

        let journal_flusher = if settings.durable && !settings.ephemeral {
            Some(spawn_journal_flusher(
                session_cache.clone(),
                config.journal_commit_interval_ms,
            ))
        } else {
            None
        };

        let checkpointer = if !settings.read_only && !settings.ephemeral {
            if !recovery_timestamp.is_null() {
                coordinator.set_initial_data(recovery_timestamp);
                coordinator.set_stable(recovery_timestamp)?;
            }
            Some(spawn_checkpointer(
                session_cache.clone(),
                keydb.clone(),
                ts_state.clone(),
                checkpoint_wake.clone(),
                CheckpointerParams {
                    delay_secs: config.checkpoint_delay_secs,
                    keep_data_history,
                },
            ))
        } else {
            None
        };

        let size_storer_uri = idents.uri(SIZE_STORER_IDENT);
        if !settings.read_only && settings.repair && idents.has_ident(SIZE_STORER_IDENT)? {
            info!("repairing size cache");
            let outcome = idents.salvage_if_needed(&size_storer_uri)?;
            if outcome.modified() {
                repair_modified.store(true, Ordering::Release);
            }
        }
        let size_storer = Arc::new(
            SizeStorer::open(conn.clone(), &size_storer_uri, settings.read_only)
                .map_err(CapstanError::Core)?,
        );

        let read_tickets = TicketPool::new(config.concurrent_read_transactions);
        let write_tickets = TicketPool::new(config.concurrent_write_transactions);

        let engine = CapstanEngine {
            size_sync_tracker: PeriodicTracker::new(clock.clone(), 100_000, 60_000),
            config,
            settings,
            path,
            driver,
            conn,
            open_config,
            file_version: opened.file_version,
            keep_data_history,
            recovery_timestamp,
            context,
            keydb,
            session_cache,
            idents,
            coordinator,
            ts_state,
            checkpoint_wake,
            sweeper: Mutex::new(Some(sweeper)),
            journal_flusher: Mutex::new(journal_flusher),
            checkpointer: Mutex::new(checkpointer),
            size_storer: Mutex::new(Some(size_storer)),
            size_storer_uri,
            read_tickets,
            write_tickets,
            global_lock: RwLock::new(()),
            backup_session: Mutex::new(None),
            oplog_manager_count: Mutex::new(0),
            oplog_thread_init: Mutex::new(None),
            repair_modified,
            closed: AtomicBool::new(false),
        };
        engine.ensure_engine_metadata()?;
        Ok(engine)
    }

    // ---- accessors ------------------------------------------------------

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn connection(&self) -> Arc<dyn CoreConnection> {
        self.conn.clone()
    }

    pub fn session_cache(&self) -> Arc<SessionCache> {
        self.session_cache.clone()
    }

    pub fn idents(&self) -> &IdentManager {
        &self.idents
    }

    pub fn file_version(&self) -> FileVersion {
        self.file_version
    }

    pub fn is_durable(&self) -> bool {
        self.settings.durable
    }

    pub fn is_ephemeral(&self) -> bool {
        self.settings.ephemeral
    }

    pub fn is_read_only(&self) -> bool {
        self.settings.read_only
    }

    pub fn is_in_repair_mode(&self) -> bool {
        self.settings.repair
    }

    pub fn was_modified_by_repair(&self) -> bool {
        self.repair_modified.load(Ordering::Acquire)
    }

    pub fn note_repair_modification(&self) {
        self.repair_modified.store(true, Ordering::Release);
    }

    pub fn supports_recover_to_stable_timestamp(&self) -> bool {
        !self.settings.ephemeral && self.keep_data_history
    }

    pub fn supports_recovery_timestamp(&self) -> bool {
        !self.settings.ephemeral
    }

    pub fn supports_read_concern_majority(&self) -> bool {
        self.keep_data_history
    }

    // ---- timestamps -----------------------------------------------------

    pub fn set_stable_timestamp(&self, ts: Timestamp) -> Result<(), CapstanError> {
        self.coordinator.set_stable(ts)
    }

    pub fn set_oldest_timestamp(&self, ts: Timestamp, force: bool) -> Result<(), CapstanError> {
        self.coordinator.set_oldest(ts, force)
    }

    pub fn set_initial_data_timestamp(&self, ts: Timestamp) {
        self.coordinator.set_initial_data(ts);
    }

    pub fn stable_timestamp(&self) -> Timestamp {
        self.coordinator.stable_timestamp()
    }

    pub fn initial_data_timestamp(&self) -> Timestamp {
        self.coordinator.initial_data_timestamp()
    }

    pub fn oldest_timestamp(&self) -> Timestamp {
        self.coordinator.oldest_timestamp()
    }

    pub fn recovery_timestamp(&self) -> Result<Option<Timestamp>, CapstanError> {
        if !self.supports_recovery_timestamp() {
            return Err(CapstanError::Unsupported {
                message: "engine is configured to not support providing a recovery timestamp"
                    .into(),
            });
        }
        if self.recovery_timestamp.is_null() {
            return Ok(None);
        }
        Ok(Some(self.recovery_timestamp))
    }

    pub fn last_stable_checkpoint_timestamp(&self) -> Result<Option<Timestamp>, CapstanError> {
        if !self.supports_recover_to_stable_timestamp() {
            return Err(CapstanError::Unsupported {
                message: "engine is configured to not support recover to a stable timestamp"
                    .into(),
            });
        }
        Ok(self.coordinator.last_stable_checkpoint())
    }

    pub fn all_committed_timestamp(&self) -> Result<Timestamp, CapstanError> {
        self.coordinator
            .all_committed_timestamp()
            .map_err(CapstanError::Core)
    }

    pub fn oldest_open_read_timestamp(&self) -> Result<Timestamp, CapstanError> {
        self.coordinator.oldest_open_read_timestamp()
    }

    pub fn set_preserve_snapshot_history(&self, on: bool) {
        self.coordinator.set_preserve_history(on);
    }

    /// Rolls the storage core back to the last stable timestamp: the
    /// journal flusher and checkpointer are joined, the core rolls back,
    /// and both workers restart against the preserved timestamps.
    pub fn recover_to_stable_timestamp(&self) -> Result<Timestamp, CapstanError> {
        if !self.supports_recover_to_stable_timestamp() {
            return Err(CapstanError::Unsupported {
                message: "engine is configured to not support recover to a stable timestamp"
                    .into(),
            });
        }

        if !self.coordinator.can_recover_to_stable() {
            return Err(CapstanError::UnrecoverableRollback {
                reason: format!(
                    "no stable timestamp available to recover to; initial data timestamp: {}, \
                     stable timestamp: {}",
                    self.coordinator.initial_data_timestamp(),
                    self.coordinator.stable_timestamp()
                ),
            });
        }

        debug!("recover-to-stable: syncing size storer to disk");
        self.sync_size_info(true)?;

        debug!("recover-to-stable: shutting down journal and checkpoint workers");
        if let Some(worker) = self.journal_flusher.lock().take() {
            worker.shutdown();
        }
        if let Some(worker) = self.checkpointer.lock().take() {
            worker.shutdown();
        }

        let stable = self.coordinator.stable_timestamp();
        let initial_data = self.coordinator.initial_data_timestamp();
        info!(
            stable = %stable,
            initial_data = %initial_data,
            "rolling back to the stable timestamp"
        );
        if let Err(e) = self.conn.rollback_to_stable() {
            return Err(CapstanError::UnrecoverableRollback {
                reason: format!("error rolling back to stable: {}", e.reason),
            });
        }

        if self.settings.durable && !self.settings.ephemeral {
            *self.journal_flusher.lock() = Some(spawn_journal_flusher(
                self.session_cache.clone(),
                self.config.journal_commit_interval_ms,
            ));
        }
        // The shared timestamp state carries stable/initial-data across the
        // worker restart.
        *self.checkpointer.lock() = Some(spawn_checkpointer(
            self.session_cache.clone(),
            self.keydb.clone(),
            self.ts_state.clone(),
            self.checkpoint_wake.clone(),
            CheckpointerParams {
                delay_secs: self.config.checkpoint_delay_secs,
                keep_data_history: self.keep_data_history,
            },
        ));

        let storer = Arc::new(
            SizeStorer::open(
                self.conn.clone(),
                &self.size_storer_uri,
                self.settings.read_only,
            )
            .map_err(CapstanError::Core)?,
        );
        *self.size_storer.lock() = Some(storer);

        Ok(stable)
    }

    // ---- idents ---------------------------------------------------------

    pub fn create_record_store(
        &self,
        ns: &str,
        ident: &str,
        options: &RecordStoreOptions,
        prefix: KvPrefix,
    ) -> Result<(), CapstanError> {
        self.idents.create_record_store(ns, ident, options, prefix)
    }

    pub fn get_record_store(
        &self,
        ns: &str,
        ident: &str,
        options: &RecordStoreOptions,
    ) -> RecordStore {
        self.idents.get_record_store(ns, ident, options)
    }

    pub fn create_sorted_index(
        &self,
        ident: &str,
        index: &IndexConfig,
        prefix: KvPrefix,
    ) -> Result<(), CapstanError> {
        self.idents.create_sorted_index(ident, index, prefix)
    }

    pub fn get_sorted_index(&self, ident: &str, index: &IndexConfig) -> SortedIndex {
        self.idents.get_sorted_index(ident, index)
    }

    pub fn drop_ident(&self, ident: &str) -> Result<(), CapstanError> {
        self.idents.drop_ident(ident)
    }

    pub fn drop_some_queued_idents(&self) -> Result<(), CapstanError> {
        self.idents.drop_some_queued_idents()
    }

    /// Rate-limited queue check for the periodic reaper's caller; also the
    /// hook where the size storer syncs opportunistically.
    pub fn have_drops_queued(&self) -> bool {
        if !self.settings.read_only && self.size_sync_tracker.interval_elapsed() {
            self.size_sync_tracker.reset();
            if let Err(e) = self.sync_size_info(false) {
                warn!("opportunistic size storer sync failed: {e}");
            }
        }
        self.idents.have_drops_queued()
    }

    pub fn all_idents(&self) -> Result<Vec<String>, CapstanError> {
        self.idents.all_idents()
    }

    pub fn has_ident(&self, ident: &str) -> Result<bool, CapstanError> {
        self.idents.has_ident(ident)
    }

    pub fn repair_ident(&self, ident: &str) -> Result<RepairOutcome, CapstanError> {
        let outcome = self.idents.repair_ident(ident)?;
        if outcome.modified() {
            self.note_repair_modification();
        }
        Ok(outcome)
    }

    pub fn recover_orphaned_ident(
        &self,
        ns: &str,
        ident: &str,
        options: &RecordStoreOptions,
    ) -> Result<RepairOutcome, CapstanError> {
        let outcome = self.idents.recover_orphaned(ns, ident, options)?;
        if outcome.modified() {
            self.note_repair_modification();
        }
        Ok(outcome)
    }

    pub fn alter_ident_metadata(
        &self,
        ident: &str,
        index: &IndexConfig,
    ) -> Result<(), CapstanError> {
        self.idents.alter_ident_metadata(ident, index)
    }

    /// Called by the catalog before renaming a namespace; a good moment to
    /// push size info out.
    pub fn ok_to_rename(&self, _from_ns: &str, _to_ns: &str, _ident: &str) -> Result<(), CapstanError> {
        self.sync_size_info(false)
    }

    pub fn ident_size(&self, ident: &str) -> Result<SizeInfo, CapstanError> {
        let uri = self.idents.uri(ident);
        let storer = self.size_storer();
        storer.load(&uri).map_err(CapstanError::Core)
    }

    /// Record-store layers report size changes here; they are flushed by
    /// the opportunistic sync.
    pub fn update_size_info(&self, ident: &str, info: SizeInfo) {
        let uri = self.idents.uri(ident);
        self.size_storer().store(&uri, info);
        self.size_sync_tracker.note_op();
    }

    fn size_storer(&self) -> Arc<SizeStorer> {
        self.size_storer
            .lock()
            .as_ref()
            .expect("size storer present while engine is open")
            .clone()
    }

    /// Flushes buffered size info, tolerating transient storage failures:
    /// conflicts retry on the next sync, and a full cache on a nojournal
    /// engine only warns.
    pub fn sync_size_info(&self, sync: bool) -> Result<(), CapstanError> {
        let Some(storer) = self.size_storer.lock().clone() else {
            return Ok(());
        };
        match storer.flush(sync) {
            Ok(()) => Ok(()),
            Err(e) if e.is_write_conflict() => Ok(()),
            Err(e) if e.code == CoreCode::CacheFull && !self.settings.durable => {
                error!("size storer failed to sync cache, ignoring: {}", e.reason);
                Ok(())
            }
            Err(e) => Err(CapstanError::Core(e)),
        }
    }

    // ---- durability -----------------------------------------------------

    /// Forces everything out: a full checkpoint without a journal, a stable
    /// checkpoint with one.
    pub fn flush_all_files(&self, _sync: bool) -> Result<(), CapstanError> {
        debug!("flushing all files");
        if self.settings.ephemeral {
            return Ok(());
        }
        self.sync_size_info(false)?;
        self.session_cache
            .wait_until_durable(true, self.settings.durable)
            .map_err(CapstanError::Core)
    }

    // ---- backup ---------------------------------------------------------

    /// Opens a backup cursor and parks it so an external tool can copy
    /// files; the snapshot stays pinned until [`end_backup`].
    ///
    /// [`end_backup`]: CapstanEngine::end_backup
    pub fn begin_backup(&self) -> Result<(), CapstanError> {
        let mut slot = self.backup_session.lock();
        assert!(slot.is_none(), "backup already in progress");

        // An ephemeral engine has no files to pin.
        if self.settings.ephemeral {
            return Ok(());
        }

        let mut session = self.conn.open_session().map_err(CapstanError::Core)?;
        let cursor = session.open_cursor("backup:").map_err(CapstanError::Core)?;
        *slot = Some(vec![InstanceBackup::new(cursor, session)]);
        Ok(())
    }

    pub fn end_backup(&self) {
        *self.backup_session.lock() = None;
    }

    fn backup_instances(&self, dest_root: &Path) -> Vec<BackupInstance> {
        let mut instances = vec![BackupInstance {
            conn: self.conn.clone(),
            src_root: self.path.clone(),
            dst_root: dest_root.to_path_buf(),
        }];
        if let Some(keydb) = &self.keydb {
            instances.push(BackupInstance {
                conn: keydb.connection(),
                src_root: keydb.path().to_path_buf(),
                dst_root: dest_root.join(keydb::KEYDB_DIR),
            });
        }
        instances
    }

    fn populate_backup(&self, dest_root: &Path) -> Result<(Vec<InstanceBackup>, Vec<FileCopySpec>), CapstanError> {
        if !self.settings.durable {
            return Err(CapstanError::Unsupported {
                message: "hot backup requires a durable engine".into(),
            });
        }
        // Prevent writes between the two backup cursors when the key db
        // participates; released as soon as both cursors are open.
        let guard = self.keydb.as_ref().map(|_| self.global_lock.read());
        let result = backup::populate_backup_lists(
            self.backup_instances(dest_root),
            &self.path,
            dest_root,
        );
        drop(guard);
        result
    }

    /// Hot backup into a local directory tree.
    pub fn hot_backup_local(&self, dest: &Path) -> Result<(), CapstanError> {
        let (sessions, files) = self.populate_backup(dest)?;
        let result = backup::local_backup(&files);
        drop(sessions);
        result
    }

    /// Hot backup streamed to an S3-compatible object store.
    pub fn hot_backup_s3(
        &self,
        store: &dyn ObjectStore,
        params: &S3BackupParams,
    ) -> Result<(), CapstanError> {
        let (sessions, files) = self.populate_backup(Path::new(&params.path))?;
        let result = backup::s3_backup(store, params, &files);
        drop(sessions);
        result
    }

    // ---- encryption -----------------------------------------------------

    pub fn encryption_key_db(&self) -> Option<Arc<EncryptionKeyDb>> {
        self.keydb.clone()
    }

    /// Deletes the encryption key for a dropped database. Runs inside the
    /// drop commit, so failures are logged rather than propagated.
    pub fn keydb_drop_database(&self, db_name: &str) {
        keydb::drop_database_key(self.keydb.as_deref(), db_name);
    }

    // ---- oplog manager --------------------------------------------------

    pub fn start_oplog_manager(&self, oplog_uri: &str) {
        let mut count = self.oplog_manager_count.lock();
        if *count == 0 {
            self.context.oplog.start(oplog_uri);
        }
        *count += 1;
    }

    pub fn halt_oplog_manager(&self) {
        let mut count = self.oplog_manager_count.lock();
        assert!(*count > 0, "oplog manager halted more times than started");
        *count -= 1;
        if *count == 0 {
            self.context.oplog.halt();
        }
    }

    pub fn replication_batch_is_complete(&self) {
        self.context.oplog.trigger_journal_flush();
    }

    pub fn set_oplog_thread_init(&self, cb: OplogThreadInit) {
        *self.oplog_thread_init.lock() = Some(cb);
    }

    pub fn init_oplog_background_thread(&self, ns: &str) -> bool {
        let cb = self
            .oplog_thread_init
            .lock()
            .clone()
            .expect("oplog background thread callback not installed");
        cb(ns)
    }

    // ---- admission control ----------------------------------------------

    pub fn read_tickets(&self) -> &TicketPool {
        &self.read_tickets
    }

    pub fn write_tickets(&self) -> &TicketPool {
        &self.write_tickets
    }

    pub fn set_concurrent_read_transactions(&self, n: usize) -> Result<(), CapstanError> {
        self.read_tickets.resize(n)
    }

    pub fn set_concurrent_write_transactions(&self, n: usize) -> Result<(), CapstanError> {
        self.write_tickets.resize(n)
    }

    pub fn concurrent_transaction_stats(&self) -> ConcurrentTransactionStats {
        ConcurrentTransactionStats {
            read: self.read_tickets.stats(),
            write: self.write_tickets.stats(),
        }
    }

    // ---- shutdown -------------------------------------------------------

    pub fn reconfigure(&self, config: &str) -> Result<(), CapstanError> {
        self.conn.reconfigure(config).map_err(CapstanError::Core)
    }

    /// Stops the workers, flushes what must be flushed, and closes the
    /// storage core, downgrading data files first when the compatibility
    /// rules call for it. Idempotent; also runs from `Drop`.
    pub fn clean_shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("capstan engine shutting down");

        if !self.settings.read_only {
            if let Err(e) = self.sync_size_info(true) {
                warn!("final size storer sync failed: {e}");
            }
        }

        if let Some(worker) = self.sweeper.lock().take() {
            info!("shutting down session sweeper thread");
            worker.shutdown();
            info!("finished shutting down session sweeper thread");
        }
        if let Some(worker) = self.journal_flusher.lock().take() {
            worker.shutdown();
        }
        if let Some(worker) = self.checkpointer.lock().take() {
            worker.shutdown();
            debug!(
                stable = %self.ts_state.stable(),
                initial_data = %self.ts_state.initial_data(),
                "shutdown timestamps"
            );
        }

        *self.size_storer.lock() = None;
        *self.backup_session.lock() = None;
        self.session_cache.shutting_down();

        let mut close_config = String::new();
        if self.settings.leak_memory_on_shutdown {
            close_config.push_str("leak_memory=true,");
        }

        let downgrade = self.file_version.should_downgrade(
            self.settings.read_only,
            self.context.repl.as_ref(),
            self.context.fcv.as_ref(),
            !self.recovery_timestamp.is_null(),
        );

        if !downgrade {
            close_config.push_str(if self.keep_data_history {
                "use_timestamp=true,"
            } else {
                "use_timestamp=false,"
            });
            invariant_core_ok(self.conn.close(&close_config));
        } else {
            info!("downgrading storage core data files");
            // An unstable checkpoint closes leftover cursors that would get
            // in the way; then logging goes back on for every table and the
            // compatibility level is rewound.
            close_config.push_str("use_timestamp=false,");
            invariant_core_ok(self.conn.close(&close_config));

            let conn = invariant_core_ok(self.driver.open(&self.path, &self.open_config));
            {
                let mut session = invariant_core_ok(conn.open_session());
                let cursor = invariant_core_ok(session.open_cursor("metadata:create"));
                let mut table_uris = Vec::new();
                for entry in CursorIter::new(cursor) {
                    let (key, _value) = invariant_core_ok(entry);
                    let Some((kind, _rest)) = key.split_once(':') else {
                        continue;
                    };
                    if kind == "table" {
                        table_uris.push(key);
                    }
                }
                for uri in table_uris {
                    invariant_core_ok(session.alter(&uri, "log=(enabled=true)"));
                }
            }
            let downgrade_config = self.file_version.downgrade_config(self.context.fcv.as_ref());
            debug!(config = downgrade_config, "downgrade compatibility configuration");
            invariant_core_ok(conn.reconfigure(downgrade_config));
            invariant_core_ok(conn.close(&close_config));
        }

        if let Some(keydb) = &self.keydb {
            if let Err(e) = keydb.close() {
                if !e.is_shutdown() {
                    warn!("error closing encryption key db: {e}");
                }
            }
        }
    }

    fn ensure_engine_metadata(&self) -> Result<(), CapstanError> {
        let metadata_path = self.path.join(backup::ENGINE_METADATA_FILE);
        if metadata_path.exists() || self.settings.read_only {
            return Ok(());
        }
        let metadata = serde_json::json!({
            "storage": {
                "engine": ENGINE_NAME,
                "version": env!("CARGO_PKG_VERSION"),
            },
        });
        std::fs::write(&metadata_path, serde_json::to_vec_pretty(&metadata).expect("metadata serializes"))?;
        Ok(())
    }
}

impl Drop for CapstanEngine {
    fn drop(&mut self) {
        self.clean_shutdown();
    }
}
