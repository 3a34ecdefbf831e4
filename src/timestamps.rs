//! Timestamp coordination between replication and the storage core.
//!
//! The coordinator owns the four distinguished timestamps (stable, oldest,
//! initial-data, recovery) and serializes their publication to the storage
//! core. The checkpoint worker reads the shared [`TimestampState`] and is
//! woken out-of-band exactly once when the stable timestamp first catches up
//! with the initial-data timestamp.

use crate::core::{CoreCode, CoreConnection, CoreError, CoreResult};
use crate::error::CapstanError;
use crate::repl::{OplogManager, SnapshotView};
use crate::workers::WakeSignal;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// 64-bit opaque timestamp; higher is newer. Zero is the null value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub const NULL: Timestamp = Timestamp(0);

    /// Initial-data values at or below this mean "no consistent view yet"
    /// and permit unstable checkpoints.
    pub const ALLOW_UNSTABLE_SENTINEL: u64 = 1;

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn from_hex(hex: &str) -> Result<Timestamp, CapstanError> {
        u64::from_str_radix(hex.trim(), 16)
            .map(Timestamp)
            .map_err(|_| CapstanError::InvalidConfig {
                message: format!("timestamp is not hex: {hex}"),
            })
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// Lock-free scalars shared between the coordinator, the checkpoint worker
/// and the engine facade.
#[derive(Default)]
pub struct TimestampState {
    stable: AtomicU64,
    initial_data: AtomicU64,
    oldest: AtomicU64,
    last_stable_checkpoint: AtomicU64,
    first_stable_taken: AtomicBool,
}

impl TimestampState {
    pub fn stable(&self) -> Timestamp {
        Timestamp(self.stable.load(Ordering::Acquire))
    }

    pub fn initial_data(&self) -> Timestamp {
        Timestamp(self.initial_data.load(Ordering::Acquire))
    }

    pub fn oldest(&self) -> Timestamp {
        Timestamp(self.oldest.load(Ordering::Acquire))
    }

    pub fn set_initial_data(&self, ts: Timestamp) {
        self.initial_data.store(ts.0, Ordering::Release);
    }

    pub fn last_stable_checkpoint_raw(&self) -> u64 {
        self.last_stable_checkpoint.load(Ordering::Acquire)
    }

    pub fn publish_stable_checkpoint(&self, value: u64) {
        self.last_stable_checkpoint.store(value, Ordering::Release);
    }
}

pub struct TimestampCoordinator {
    conn: Arc<dyn CoreConnection>,
    state: Arc<TimestampState>,
    checkpoint_wake: Arc<WakeSignal>,
    oplog: Arc<dyn OplogManager>,
    snapshots: Arc<dyn SnapshotView>,
    keep_data_history: bool,
    recovery_timestamp: Timestamp,
    /// Debug switch: when engaged, `set_oldest` is a no-op and history is
    /// retained indefinitely.
    preserve_history: AtomicBool,
}

impl TimestampCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        conn: Arc<dyn CoreConnection>,
        state: Arc<TimestampState>,
        checkpoint_wake: Arc<WakeSignal>,
        oplog: Arc<dyn OplogManager>,
        snapshots: Arc<dyn SnapshotView>,
        keep_data_history: bool,
        recovery_timestamp: Timestamp,
    ) -> Self {
        Self {
            conn,
            state,
            checkpoint_wake,
            oplog,
            snapshots,
            keep_data_history,
            recovery_timestamp,
            preserve_history: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> Arc<TimestampState> {
        self.state.clone()
    }

    pub fn set_preserve_history(&self, on: bool) {
        self.preserve_history.store(on, Ordering::SeqCst);
    }

    /// Publishes the stable timestamp: storage core first, then the
    /// checkpoint worker, then the oldest timestamp. The stable push always
    /// reaches the core before the oldest push from the same call.
    pub fn set_stable(&self, ts: Timestamp) -> Result<(), CapstanError> {
        if !self.keep_data_history || ts.is_null() {
            return Ok(());
        }

        self.conn
            .set_timestamp(&format!("stable_timestamp={ts}"))
            .map_err(CapstanError::Core)?;

        let prev_stable = Timestamp(self.state.stable.swap(ts.0, Ordering::AcqRel));
        if !self.state.first_stable_taken.load(Ordering::Acquire) {
            let initial_data = self.state.initial_data();
            if prev_stable < initial_data && ts >= initial_data {
                self.state.first_stable_taken.store(true, Ordering::Release);
                info!(
                    initial_data = %initial_data,
                    prev_stable = %prev_stable,
                    stable = %ts,
                    "triggering the first stable checkpoint"
                );
                self.checkpoint_wake.notify();
            }
        }

        self.set_oldest(ts, false)
    }

    /// Advances the oldest timestamp. Without `force` the value is clamped
    /// down to the oplog read timestamp and the pinned local snapshot so
    /// readers at those points can still be serviced.
    pub fn set_oldest(&self, ts: Timestamp, force: bool) -> Result<(), CapstanError> {
        if self.preserve_history.load(Ordering::SeqCst) {
            return Ok(());
        }
        if ts.is_null() {
            return Ok(());
        }

        let mut oldest = ts;
        if !force {
            let oplog_read = self.oplog.oplog_read_timestamp();
            if !oplog_read.is_null() && oldest > oplog_read {
                oldest = oplog_read;
            }
            if let Some(local) = self.snapshots.local_snapshot() {
                if oldest > local {
                    oldest = local;
                }
            }
        }

        let config = if force {
            format!("force=true,oldest_timestamp={oldest},commit_timestamp={oldest}")
        } else {
            format!("oldest_timestamp={oldest}")
        };
        self.conn
            .set_timestamp(&config)
            .map_err(CapstanError::Core)?;

        // The core ignores backwards movement unless forced; mirror that in
        // the cached value.
        if force {
            self.state.oldest.store(oldest.0, Ordering::Release);
            debug!(oldest = %oldest, "oldest and commit timestamps force set");
        } else {
            self.state.oldest.fetch_max(oldest.0, Ordering::AcqRel);
            debug!(oldest = %oldest, "oldest timestamp set");
        }
        Ok(())
    }

    pub fn set_initial_data(&self, ts: Timestamp) {
        debug!(initial_data = %ts, "setting initial data timestamp");
        self.state.set_initial_data(ts);
    }

    pub fn stable_timestamp(&self) -> Timestamp {
        self.state.stable()
    }

    pub fn initial_data_timestamp(&self) -> Timestamp {
        self.state.initial_data()
    }

    pub fn oldest_timestamp(&self) -> Timestamp {
        self.state.oldest()
    }

    pub fn recovery_timestamp(&self) -> Timestamp {
        self.recovery_timestamp
    }

    pub fn all_committed_timestamp(&self) -> CoreResult<Timestamp> {
        self.oplog.fetch_all_committed(&self.conn)
    }

    /// Minimum read timestamp across open transactions, or null when none
    /// are open.
    pub fn oldest_open_read_timestamp(&self) -> Result<Timestamp, CapstanError> {
        match self.conn.query_timestamp("get=oldest_reader") {
            Ok(hex) => Timestamp::from_hex(&hex),
            Err(CoreError {
                code: CoreCode::NotFound,
                ..
            }) => Ok(Timestamp::NULL),
            Err(e) => Err(CapstanError::Core(e)),
        }
    }

    /// Timestamp of the most recent stable checkpoint; falls back to the
    /// recovery timestamp when none has been published since startup.
    pub fn last_stable_checkpoint(&self) -> Option<Timestamp> {
        let raw = self.state.last_stable_checkpoint_raw();
        if raw != 0 {
            return Some(Timestamp(raw));
        }
        if !self.recovery_timestamp.is_null() {
            return Some(self.recovery_timestamp);
        }
        None
    }

    /// Illegal to call while the dataset is incomplete; recover-to-stable
    /// is only meaningful once a real initial-data timestamp exists.
    pub fn can_recover_to_stable(&self) -> bool {
        let initial_data = self.state.initial_data();
        assert!(
            initial_data.as_u64() > Timestamp::ALLOW_UNSTABLE_SENTINEL,
            "recover-to-stable queried before a consistent data view exists"
        );
        self.state.stable() >= initial_data
    }
}

#[cfg(test)]
mod tests {
    use super::{Timestamp, TimestampCoordinator, TimestampState};
    use crate::core::memcore::MemCoreDriver;
    use crate::core::{CoreConnection, CoreDriver, CoreResult};
    use crate::repl::{OplogManager, SnapshotView};
    use crate::workers::WakeSignal;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tempfile::tempdir;

    struct FakeOplog {
        read_ts: Mutex<Timestamp>,
    }

    impl OplogManager for FakeOplog {
        fn oplog_read_timestamp(&self) -> Timestamp {
            *self.read_ts.lock()
        }

        fn fetch_all_committed(
            &self,
            _conn: &Arc<dyn CoreConnection>,
        ) -> CoreResult<Timestamp> {
            Ok(Timestamp::NULL)
        }

        fn start(&self, _uri: &str) {}
        fn halt(&self) {}
        fn trigger_journal_flush(&self) {}
    }

    struct FakeSnapshots {
        local: Mutex<Option<Timestamp>>,
    }

    impl SnapshotView for FakeSnapshots {
        fn local_snapshot(&self) -> Option<Timestamp> {
            *self.local.lock()
        }
    }

    fn coordinator(
        dir: &std::path::Path,
        oplog: Arc<FakeOplog>,
        snapshots: Arc<FakeSnapshots>,
    ) -> (TimestampCoordinator, crate::core::memcore::MemCore) {
        let driver = MemCoreDriver::new();
        let conn = driver.open(dir, "create").expect("open");
        let core = driver.connections()[0].clone();
        let coord = TimestampCoordinator::new(
            conn,
            Arc::new(TimestampState::default()),
            Arc::new(WakeSignal::new()),
            oplog,
            snapshots,
            true,
            Timestamp::NULL,
        );
        (coord, core)
    }

    fn no_clamps() -> (Arc<FakeOplog>, Arc<FakeSnapshots>) {
        (
            Arc::new(FakeOplog {
                read_ts: Mutex::new(Timestamp::NULL),
            }),
            Arc::new(FakeSnapshots {
                local: Mutex::new(None),
            }),
        )
    }

    #[test]
    fn stable_pushes_before_oldest() {
        let dir = tempdir().expect("tempdir");
        let (oplog, snapshots) = no_clamps();
        let (coord, core) = coordinator(dir.path(), oplog, snapshots);
        coord.set_stable(Timestamp(0x50)).expect("set stable");
        let pushes = core.timestamp_pushes();
        assert_eq!(pushes.len(), 2);
        assert!(pushes[0].starts_with("stable_timestamp=50"));
        assert!(pushes[1].starts_with("oldest_timestamp=50"));
    }

    #[test]
    fn null_and_history_disabled_are_noops() {
        let dir = tempdir().expect("tempdir");
        let (oplog, snapshots) = no_clamps();
        let (coord, core) = coordinator(dir.path(), oplog, snapshots);
        coord.set_stable(Timestamp::NULL).expect("noop");
        assert!(core.timestamp_pushes().is_empty());
    }

    #[test]
    fn oldest_clamps_to_oplog_and_local_snapshot() {
        let dir = tempdir().expect("tempdir");
        let oplog = Arc::new(FakeOplog {
            read_ts: Mutex::new(Timestamp(0x30)),
        });
        let snapshots = Arc::new(FakeSnapshots {
            local: Mutex::new(Some(Timestamp(0x20))),
        });
        let (coord, core) = coordinator(dir.path(), oplog, snapshots);
        coord.set_oldest(Timestamp(0x40), false).expect("set oldest");
        let pushes = core.timestamp_pushes();
        assert_eq!(pushes, vec!["oldest_timestamp=20".to_string()]);
        assert_eq!(coord.oldest_timestamp(), Timestamp(0x20));
    }

    #[test]
    fn forced_oldest_skips_clamp_and_sets_commit() {
        let dir = tempdir().expect("tempdir");
        let oplog = Arc::new(FakeOplog {
            read_ts: Mutex::new(Timestamp(0x10)),
        });
        let snapshots = Arc::new(FakeSnapshots {
            local: Mutex::new(Some(Timestamp(0x10))),
        });
        let (coord, core) = coordinator(dir.path(), oplog, snapshots);
        coord.set_oldest(Timestamp(0x40), true).expect("force");
        let pushes = core.timestamp_pushes();
        assert_eq!(
            pushes,
            vec!["force=true,oldest_timestamp=40,commit_timestamp=40".to_string()]
        );
        assert_eq!(coord.oldest_timestamp(), Timestamp(0x40));
    }

    #[test]
    fn cached_oldest_is_monotonic_without_force() {
        let dir = tempdir().expect("tempdir");
        let (oplog, snapshots) = no_clamps();
        let (coord, _core) = coordinator(dir.path(), oplog, snapshots);
        coord.set_oldest(Timestamp(0x40), false).expect("first");
        coord.set_oldest(Timestamp(0x30), false).expect("second");
        assert_eq!(coord.oldest_timestamp(), Timestamp(0x40));
        coord.set_oldest(Timestamp(0x20), true).expect("forced");
        assert_eq!(coord.oldest_timestamp(), Timestamp(0x20));
    }

    #[test]
    fn first_stable_wake_fires_once() {
        let dir = tempdir().expect("tempdir");
        let (oplog, snapshots) = no_clamps();
        let (coord, _core) = coordinator(dir.path(), oplog, snapshots);
        coord.set_initial_data(Timestamp(0x100));
        coord.set_stable(Timestamp(0x80)).expect("below initial");
        assert_eq!(coord.state().first_stable_taken.load(std::sync::atomic::Ordering::SeqCst), false);
        coord.set_stable(Timestamp(0x100)).expect("crosses");
        assert!(coord
            .state()
            .first_stable_taken
            .load(std::sync::atomic::Ordering::SeqCst));
        // Same value again must not re-trigger.
        coord.set_stable(Timestamp(0x100)).expect("repeat");
    }

    #[test]
    fn preserve_history_switch_blocks_oldest() {
        let dir = tempdir().expect("tempdir");
        let (oplog, snapshots) = no_clamps();
        let (coord, core) = coordinator(dir.path(), oplog, snapshots);
        coord.set_preserve_history(true);
        coord.set_oldest(Timestamp(0x40), false).expect("noop");
        assert!(core.timestamp_pushes().is_empty());
    }

    #[test]
    #[should_panic(expected = "recover-to-stable")]
    fn can_recover_panics_on_incomplete_dataset() {
        let dir = tempdir().expect("tempdir");
        let (oplog, snapshots) = no_clamps();
        let (coord, _core) = coordinator(dir.path(), oplog, snapshots);
        coord.set_initial_data(Timestamp(1));
        let _ = coord.can_recover_to_stable();
    }

    #[test]
    fn timestamp_hex_roundtrip() {
        let ts = Timestamp(0x1000_0005);
        assert_eq!(ts.to_string(), "10000005");
        assert_eq!(Timestamp::from_hex("10000005").expect("parse"), ts);
        assert!(Timestamp::from_hex("zz").is_err());
    }
}
