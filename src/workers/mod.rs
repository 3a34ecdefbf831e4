//! The three long-lived background workers: idle-session sweeper, journal
//! flusher and checkpoint worker.
//!
//! Each worker is an owned native thread with a cooperative shutdown flag.
//! Shutdown choreography is always: set the flag, notify the worker's
//! condvar (when it has one), join. The engine facade stops them in the
//! order sweeper, journal flusher, checkpointer before the storage-core
//! connection goes away.

use crate::core::{CoreError, CoreSession};
use crate::keydb::EncryptionKeyDb;
use crate::session_cache::SessionCache;
use crate::timestamps::{Timestamp, TimestampState};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_JOURNAL_DELAY_MILLIS: u64 = 100;

/// Condvar-backed wakeup. A worker parks on `wait_timeout`; any other
/// thread can cut the wait short with `notify`.
pub struct WakeSignal {
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl WakeSignal {
    pub fn new() -> Self {
        Self {
            mutex: Mutex::new(()),
            condvar: Condvar::new(),
        }
    }

    pub fn notify(&self) {
        let _guard = self.mutex.lock();
        self.condvar.notify_one();
    }

    pub fn wait_timeout(&self, timeout: Duration) {
        let mut guard = self.mutex.lock();
        self.condvar.wait_for(&mut guard, timeout);
    }
}

impl Default for WakeSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// An owned background worker. Dropping without `shutdown` joins too, so a
/// worker can never outlive the engine that spawned it.
pub struct WorkerHandle {
    name: &'static str,
    shutdown: Arc<AtomicBool>,
    signal: Option<Arc<WakeSignal>>,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn shutdown(mut self) {
        self.shutdown_in_place();
    }

    fn shutdown_in_place(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(signal) = &self.signal {
            signal.notify();
        }
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                warn!(worker = self.name, "worker thread panicked before join");
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.shutdown_in_place();
    }
}

fn spawn_worker(
    name: &'static str,
    signal: Option<Arc<WakeSignal>>,
    body: impl FnOnce(Arc<AtomicBool>) + Send + 'static,
) -> WorkerHandle {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    let join = std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            debug!(worker = name, "starting worker thread");
            body(flag);
            debug!(worker = name, "stopping worker thread");
        })
        .expect("failed to spawn background worker thread");
    WorkerHandle {
        name,
        shutdown,
        signal,
        join: Some(join),
    }
}

/// Closes cache sessions that have been idle past the TTL. Checks every
/// ten seconds (every second in debug builds) and wakes early on shutdown.
pub fn spawn_session_sweeper(cache: Arc<SessionCache>, idle_secs: u64) -> WorkerHandle {
    let signal = Arc::new(WakeSignal::new());
    let wait = Duration::from_secs(if cfg!(debug_assertions) { 1 } else { 10 });
    let loop_signal = signal.clone();
    spawn_worker("capstan-session-sweeper", Some(signal), move |shutdown| {
        while !shutdown.load(Ordering::Acquire) {
            loop_signal.wait_timeout(wait);
            if shutdown.load(Ordering::Acquire) {
                break;
            }
            let closed = cache.close_expired_idle_sessions(idle_secs * 1000);
            if closed > 0 {
                debug!(closed, "closed expired idle sessions");
            }
        }
    })
}

/// Flushes the journal on a short interval so commits become durable
/// without every writer paying an fsync.
pub fn spawn_journal_flusher(cache: Arc<SessionCache>, interval_ms: u64) -> WorkerHandle {
    let interval = if interval_ms == 0 {
        DEFAULT_JOURNAL_DELAY_MILLIS
    } else {
        interval_ms
    };
    spawn_worker("capstan-journal-flusher", None, move |shutdown| {
        while !shutdown.load(Ordering::Acquire) {
            match cache.wait_until_durable(false, false) {
                Ok(()) => {}
                Err(e) if e.is_shutdown() => {}
                Err(e) => panic!("journal flush failed: {e}"),
            }
            std::thread::sleep(Duration::from_millis(interval));
        }
    })
}

pub struct CheckpointerParams {
    pub delay_secs: u64,
    pub keep_data_history: bool,
}

/// The periodic checkpoint worker. Each tick reads the stable and
/// initial-data timestamps and picks exactly one of four branches; see the
/// match below. The key DB, when present, is checkpointed untimestamped
/// right after.
pub fn spawn_checkpointer(
    cache: Arc<SessionCache>,
    keydb: Option<Arc<EncryptionKeyDb>>,
    state: Arc<TimestampState>,
    wake: Arc<WakeSignal>,
    params: CheckpointerParams,
) -> WorkerHandle {
    let delay = Duration::from_secs(params.delay_secs);
    let keep_data_history = params.keep_data_history;
    let loop_wake = wake.clone();
    spawn_worker("capstan-checkpointer", Some(wake), move |shutdown| {
        while !shutdown.load(Ordering::Acquire) {
            loop_wake.wait_timeout(delay);
            if shutdown.load(Ordering::Acquire) {
                break;
            }

            let stable = state.stable();
            let initial_data = state.initial_data();
            let result = checkpoint_once(&cache, keydb.as_deref(), &state, stable, initial_data, keep_data_history);
            match result {
                Ok(()) => {}
                Err(e) if e.is_write_conflict() => {
                    warn!("checkpoint encountered a write conflict");
                }
                Err(e) if e.is_shutdown() => break,
                Err(e) => panic!("checkpoint failed: {e}"),
            }
        }
    })
}

fn checkpoint_once(
    cache: &Arc<SessionCache>,
    keydb: Option<&EncryptionKeyDb>,
    state: &TimestampState,
    stable: Timestamp,
    initial_data: Timestamp,
    keep_data_history: bool,
) -> Result<(), CoreError> {
    if initial_data.as_u64() <= Timestamp::ALLOW_UNSTABLE_SENTINEL {
        // No consistent view of the data yet (initial sync): full
        // checkpoint.
        let mut session = cache.get_session()?;
        session.session().checkpoint("use_timestamp=false")?;
    } else if !keep_data_history {
        // Not tracking a stable timestamp: full checkpoint, and release
        // oplog truncation from stable-checkpoint gating.
        let mut session = cache.get_session()?;
        session.session().checkpoint("use_timestamp=false")?;
        state.publish_stable_checkpoint(u64::MAX);
    } else if stable < initial_data {
        // Data on disk is prone to rollback; hold off until the stable
        // timestamp catches up.
        debug!(
            stable = %stable,
            initial_data = %initial_data,
            "stable timestamp is behind the initial data timestamp, skipping a checkpoint"
        );
    } else {
        debug!(stable = %stable, "performing stable checkpoint");
        let stable_at_start = stable;
        let mut session = cache.get_session()?;
        session.session().checkpoint("use_timestamp=true")?;
        // Publish only after the checkpoint is durable, with the value
        // sampled before the call.
        state.publish_stable_checkpoint(stable_at_start.as_u64());
    }

    if let Some(keydb) = keydb {
        keydb.checkpoint()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{
        checkpoint_once, spawn_journal_flusher, spawn_session_sweeper, WakeSignal,
    };
    use crate::core::memcore::MemCoreDriver;
    use crate::core::{CoreCode, CoreDriver};
    use crate::session_cache::SessionCache;
    use crate::timestamps::{Timestamp, TimestampState};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;

    fn cache(dir: &std::path::Path) -> Arc<SessionCache> {
        let driver = MemCoreDriver::new();
        let conn = driver
            .open(dir, "create,log=(enabled=true,path=journal)")
            .expect("open");
        Arc::new(SessionCache::new(conn, true))
    }

    #[test]
    fn wake_signal_cuts_wait_short() {
        let signal = Arc::new(WakeSignal::new());
        let signal2 = signal.clone();
        let start = std::time::Instant::now();
        let waiter = std::thread::spawn(move || {
            signal2.wait_timeout(Duration::from_secs(30));
        });
        std::thread::sleep(Duration::from_millis(20));
        signal.notify();
        waiter.join().expect("join");
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn sweeper_shuts_down_promptly() {
        let dir = tempdir().expect("tempdir");
        let cache = cache(dir.path());
        let worker = spawn_session_sweeper(cache, 300);
        let start = std::time::Instant::now();
        worker.shutdown();
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn journal_flusher_survives_shutdown_errors() {
        let dir = tempdir().expect("tempdir");
        let cache = cache(dir.path());
        let worker = spawn_journal_flusher(cache.clone(), 10);
        std::thread::sleep(Duration::from_millis(50));
        // Flip the cache into shutdown mode while the worker is running; it
        // must treat the failure as recoverable until joined.
        cache.shutting_down();
        std::thread::sleep(Duration::from_millis(30));
        worker.shutdown();
    }

    #[test]
    fn checkpoint_branches() {
        let dir = tempdir().expect("tempdir");
        let cache = cache(dir.path());
        let state = TimestampState::default();

        // Branch 1: initial data at the sentinel takes a full checkpoint.
        state.set_initial_data(Timestamp(1));
        checkpoint_once(&cache, None, &state, Timestamp::NULL, Timestamp(1), true)
            .expect("full checkpoint");
        assert_eq!(state.last_stable_checkpoint_raw(), 0);

        // Branch 2: majority read concern off publishes the max sentinel.
        state.set_initial_data(Timestamp(0x100));
        checkpoint_once(&cache, None, &state, Timestamp(0x50), Timestamp(0x100), false)
            .expect("full checkpoint");
        assert_eq!(state.last_stable_checkpoint_raw(), u64::MAX);

        // Branch 3: stable behind initial data skips entirely.
        state.publish_stable_checkpoint(0);
        checkpoint_once(&cache, None, &state, Timestamp(0x50), Timestamp(0x100), true)
            .expect("skip");
        assert_eq!(state.last_stable_checkpoint_raw(), 0);

        // Branch 4: steady state publishes the sampled stable value.
        checkpoint_once(&cache, None, &state, Timestamp(0x200), Timestamp(0x100), true)
            .expect("stable checkpoint");
        assert_eq!(state.last_stable_checkpoint_raw(), 0x200);
    }

    #[test]
    fn checkpoint_write_conflict_is_recoverable() {
        let dir = tempdir().expect("tempdir");
        let driver = MemCoreDriver::new();
        let conn = driver.open(dir.path(), "create").expect("open");
        let cache = Arc::new(SessionCache::new(conn, false));
        driver
            .faults()
            .push_checkpoint_error(CoreCode::WriteConflict);
        let state = TimestampState::default();
        let err = checkpoint_once(&cache, None, &state, Timestamp::NULL, Timestamp(1), true)
            .expect_err("conflict");
        assert!(err.is_write_conflict());
    }
}
