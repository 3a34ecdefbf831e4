use crate::error::CapstanError;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

struct PoolState {
    capacity: usize,
    in_use: usize,
}

struct PoolInner {
    state: Mutex<PoolState>,
    available: Condvar,
}

/// Bounded admission control for concurrent read or write transactions.
///
/// A thread-blocking counting semaphore. Capacity can be resized live;
/// shrinking never revokes permits in flight, it simply stops handing out
/// new ones until enough are released.
#[derive(Clone)]
pub struct TicketPool {
    inner: Arc<PoolInner>,
}

/// Permit returned by [`TicketPool::acquire`]. Releases on drop.
pub struct Ticket {
    inner: Arc<PoolInner>,
}

impl Drop for Ticket {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.in_use -= 1;
        drop(state);
        self.inner.available.notify_one();
    }
}

impl TicketPool {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ticket pool capacity must be > 0");
        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    capacity,
                    in_use: 0,
                }),
                available: Condvar::new(),
            }),
        }
    }

    /// Blocks until a permit is free.
    pub fn acquire(&self) -> Ticket {
        let mut state = self.inner.state.lock();
        while state.in_use >= state.capacity {
            self.inner.available.wait(&mut state);
        }
        state.in_use += 1;
        Ticket {
            inner: self.inner.clone(),
        }
    }

    pub fn try_acquire(&self) -> Option<Ticket> {
        let mut state = self.inner.state.lock();
        if state.in_use >= state.capacity {
            return None;
        }
        state.in_use += 1;
        Some(Ticket {
            inner: self.inner.clone(),
        })
    }

    /// Grows or shrinks live capacity. Shrinking takes effect as permits
    /// are released.
    pub fn resize(&self, capacity: usize) -> Result<(), CapstanError> {
        if capacity == 0 {
            return Err(CapstanError::InvalidConfig {
                message: "ticket pool capacity has to be > 0".into(),
            });
        }
        let mut state = self.inner.state.lock();
        let grew = capacity > state.capacity;
        state.capacity = capacity;
        drop(state);
        if grew {
            self.inner.available.notify_all();
        }
        Ok(())
    }

    pub fn in_use(&self) -> usize {
        self.inner.state.lock().in_use
    }

    pub fn available(&self) -> usize {
        let state = self.inner.state.lock();
        state.capacity.saturating_sub(state.in_use)
    }

    pub fn capacity(&self) -> usize {
        self.inner.state.lock().capacity
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub out: usize,
    pub available: usize,
    pub total_tickets: usize,
}

impl TicketPool {
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            out: state.in_use,
            available: state.capacity.saturating_sub(state.in_use),
            total_tickets: state.capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::TicketPool;
    use std::time::Duration;

    #[test]
    fn acquire_release_roundtrip() {
        let pool = TicketPool::new(2);
        let t1 = pool.acquire();
        let t2 = pool.acquire();
        assert_eq!(pool.in_use(), 2);
        assert_eq!(pool.available(), 0);
        assert!(pool.try_acquire().is_none());
        drop(t1);
        assert_eq!(pool.available(), 1);
        drop(t2);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn resize_zero_is_invalid() {
        let pool = TicketPool::new(4);
        assert!(pool.resize(0).is_err());
        assert_eq!(pool.capacity(), 4);
    }

    #[test]
    fn shrink_takes_effect_lazily() {
        let pool = TicketPool::new(3);
        let t1 = pool.acquire();
        let t2 = pool.acquire();
        pool.resize(1).expect("resize");
        // Two permits remain in flight even though capacity is 1 now.
        assert_eq!(pool.in_use(), 2);
        assert!(pool.try_acquire().is_none());
        drop(t1);
        assert!(pool.try_acquire().is_none());
        drop(t2);
        let t3 = pool.try_acquire();
        assert!(t3.is_some());
    }

    #[test]
    fn blocked_acquire_wakes_on_release() {
        let pool = TicketPool::new(1);
        let held = pool.acquire();
        let pool2 = pool.clone();
        let waiter = std::thread::spawn(move || {
            let _t = pool2.acquire();
        });
        std::thread::sleep(Duration::from_millis(20));
        drop(held);
        waiter.join().expect("waiter joins");
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn grow_wakes_blocked_acquirers() {
        let pool = TicketPool::new(1);
        let _held = pool.acquire();
        let pool2 = pool.clone();
        let waiter = std::thread::spawn(move || {
            let _t = pool2.acquire();
        });
        std::thread::sleep(Duration::from_millis(20));
        pool.resize(2).expect("resize");
        waiter.join().expect("waiter joins");
    }

    #[test]
    fn stats_snapshot() {
        let pool = TicketPool::new(128);
        let _t = pool.acquire();
        let stats = pool.stats();
        assert_eq!(stats.out, 1);
        assert_eq!(stats.available, 127);
        assert_eq!(stats.total_tickets, 128);
    }
}
