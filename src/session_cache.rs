//! Session pooling in front of the storage core.
//!
//! Sessions are expensive to open and single-caller by contract, so the
//! engine checks them out of a pool and returns them on drop. Cached
//! sessions may carry cached cursors; the ident manager asks the cache to
//! cull cursors for URIs it is about to drop (a table cannot be dropped
//! while a cached cursor still references it).

use crate::core::{CoreConnection, CoreCursor, CoreError, CoreResult, CoreSession};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

type QueuedDropFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;

struct CachedCursor {
    uri: String,
    cursor: Box<dyn CoreCursor>,
}

struct CachedSession {
    session: Box<dyn CoreSession>,
    cursors: Vec<CachedCursor>,
    last_used: Instant,
}

#[derive(Default)]
struct CacheInner {
    idle: Vec<CachedSession>,
}

pub struct SessionCache {
    conn: Arc<dyn CoreConnection>,
    durable: bool,
    inner: Mutex<CacheInner>,
    shutting_down: AtomicBool,
    /// Installed by the engine: answers "is this URI queued for drop?".
    queued_drop_filter: Mutex<Option<QueuedDropFilter>>,
}

impl SessionCache {
    pub fn new(conn: Arc<dyn CoreConnection>, durable: bool) -> Self {
        Self {
            conn,
            durable,
            inner: Mutex::new(CacheInner::default()),
            shutting_down: AtomicBool::new(false),
            queued_drop_filter: Mutex::new(None),
        }
    }

    pub fn connection(&self) -> Arc<dyn CoreConnection> {
        self.conn.clone()
    }

    pub fn set_queued_drop_filter(&self, filter: QueuedDropFilter) {
        *self.queued_drop_filter.lock() = Some(filter);
    }

    /// Checks a session out of the pool, opening a fresh one when the pool
    /// is empty. Fails once shutdown has begun.
    pub fn get_session(self: &Arc<Self>) -> CoreResult<PooledSession> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(CoreError::shutdown("session cache is shutting down"));
        }
        let cached = self.inner.lock().idle.pop();
        let entry = match cached {
            Some(entry) => entry,
            None => CachedSession {
                session: self.conn.open_session()?,
                cursors: Vec::new(),
                last_used: Instant::now(),
            },
        };
        Ok(PooledSession {
            cache: self.clone(),
            entry: Some(entry),
        })
    }

    fn release(&self, mut entry: CachedSession) {
        if self.shutting_down.load(Ordering::Acquire) {
            return;
        }
        if let Some(filter) = self.queued_drop_filter.lock().clone() {
            entry.cursors.retain(|c| !filter(&c.uri));
        }
        entry.last_used = Instant::now();
        self.inner.lock().idle.push(entry);
    }

    /// Drops pooled sessions that have sat idle longer than the TTL.
    /// Returns how many were closed.
    pub fn close_expired_idle_sessions(&self, max_idle_millis: u64) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.idle.len();
        let now = Instant::now();
        inner
            .idle
            .retain(|s| now.duration_since(s.last_used).as_millis() < u128::from(max_idle_millis));
        before - inner.idle.len()
    }

    /// Closes every cached cursor over `uri` across the pool.
    pub fn close_all_cursors(&self, uri: &str) {
        let mut inner = self.inner.lock();
        for session in &mut inner.idle {
            session.cursors.retain(|c| c.uri != uri);
        }
    }

    /// Culls cached cursors whose URI is queued for drop.
    pub fn close_cursors_for_queued_drops(&self) {
        let Some(filter) = self.queued_drop_filter.lock().clone() else {
            return;
        };
        let mut inner = self.inner.lock();
        for session in &mut inner.idle {
            session.cursors.retain(|c| !filter(&c.uri));
        }
    }

    /// Journal durability entry point. Without a journal (or when a
    /// checkpoint is forced) this takes a checkpoint instead of flushing
    /// the log.
    pub fn wait_until_durable(
        self: &Arc<Self>,
        force_checkpoint: bool,
        stable_checkpoint: bool,
    ) -> CoreResult<()> {
        let mut pooled = self.get_session()?;
        if force_checkpoint || !self.durable {
            let config = if stable_checkpoint {
                "use_timestamp=true"
            } else {
                "use_timestamp=false"
            };
            pooled.session().checkpoint(config)
        } else {
            pooled.session().log_flush("sync=on")
        }
    }

    /// Flips the cache into shutdown mode and drops all pooled sessions.
    pub fn shutting_down(&self) {
        self.shutting_down.store(true, Ordering::Release);
        self.inner.lock().idle.clear();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub fn idle_session_count(&self) -> usize {
        self.inner.lock().idle.len()
    }

    pub fn cached_cursor_count(&self) -> usize {
        self.inner
            .lock()
            .idle
            .iter()
            .map(|s| s.cursors.len())
            .sum()
    }
}

/// RAII session checkout; returns the session (and any cursors stashed on
/// it) to the pool on drop.
pub struct PooledSession {
    cache: Arc<SessionCache>,
    entry: Option<CachedSession>,
}

impl std::fmt::Debug for PooledSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledSession").finish_non_exhaustive()
    }
}

impl PooledSession {
    pub fn session(&mut self) -> &mut dyn CoreSession {
        self.entry
            .as_mut()
            .expect("session present until drop")
            .session
            .as_mut()
    }

    /// Opens a cursor over `uri`, reusing a cached one when available.
    pub fn open_cursor(&mut self, uri: &str) -> CoreResult<Box<dyn CoreCursor>> {
        let entry = self.entry.as_mut().expect("session present until drop");
        if let Some(pos) = entry.cursors.iter().position(|c| c.uri == uri) {
            return Ok(entry.cursors.remove(pos).cursor);
        }
        entry.session.open_cursor(uri)
    }

    /// Returns a cursor to this session's cache for reuse.
    pub fn stash_cursor(&mut self, uri: &str, cursor: Box<dyn CoreCursor>) {
        let entry = self.entry.as_mut().expect("session present until drop");
        entry.cursors.push(CachedCursor {
            uri: uri.to_string(),
            cursor,
        });
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            self.cache.release(entry);
        }
    }
}
