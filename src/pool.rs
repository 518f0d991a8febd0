//! Connection pool for managing connections to one backing store.
//!
//! The pool hands out at most `max_size` connections. Idle connections are
//! reused first-in first-out; with pre-ping enabled each reused connection is
//! probed and silently replaced when the probe fails. A connection is
//! returned to the pool when its [`PooledConnection`] guard is dropped.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use log::{debug, info};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::backend::{Backend, StoreConnection};
use crate::error::{DataError, DataResult};

/// Connection pool configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of open connections, idle and in use together.
    pub max_size: usize,
    /// Probe idle connections before handing them out.
    pub pre_ping: bool,
    /// Log every statement under the `sql` target.
    pub trace_sql: bool,
    /// How long `acquire` waits for a free connection.
    pub acquire_timeout_ms: u64,
    /// Connections older than this are closed instead of reused.
    pub max_lifetime_ms: Option<u64>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 5,
            pre_ping: true,
            trace_sql: false,
            acquire_timeout_ms: 30_000,
            max_lifetime_ms: None,
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_size(mut self, max: usize) -> Self {
        self.max_size = max;
        self
    }

    pub fn pre_ping(mut self, enabled: bool) -> Self {
        self.pre_ping = enabled;
        self
    }

    pub fn trace_sql(mut self, enabled: bool) -> Self {
        self.trace_sql = enabled;
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime_ms = Some(lifetime.as_millis() as u64);
        self
    }

    pub fn validate(&self) -> DataResult<()> {
        if self.max_size == 0 {
            return Err(DataError::InvalidConfig(
                "max_size must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    fn acquire_wait(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    fn lifetime(&self) -> Option<Duration> {
        self.max_lifetime_ms.map(Duration::from_millis)
    }
}

/// Pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Open connections, idle plus in use.
    pub size: usize,
    pub idle: usize,
    pub in_use: usize,
    /// Connections opened over the pool's lifetime.
    pub created: u64,
    /// Connections closed because they were dead, expired, broken, or disposed.
    pub discarded: u64,
    pub acquisitions: u64,
    pub releases: u64,
    pub timeouts: u64,
}

#[derive(Default)]
struct Counters {
    created: AtomicU64,
    discarded: AtomicU64,
    acquisitions: AtomicU64,
    releases: AtomicU64,
    timeouts: AtomicU64,
}

struct Slot<C> {
    conn: C,
    created_at: Instant,
    use_count: u64,
}

impl<C> Slot<C> {
    fn is_expired(&self, lifetime: Option<Duration>) -> bool {
        lifetime.is_some_and(|max| self.created_at.elapsed() > max)
    }
}

struct PoolState<C> {
    idle: VecDeque<Slot<C>>,
    /// Checked-out connections, including slots reserved while a connection opens.
    in_use: usize,
    closed: bool,
}

/// A bounded pool of connections opened through a [`Backend`].
pub struct ConnectionPool<B: Backend> {
    backend: B,
    config: PoolConfig,
    state: Mutex<PoolState<B::Connection>>,
    available: Condvar,
    counters: Counters,
}

impl<B: Backend> ConnectionPool<B> {
    /// Creates an empty pool; connections are opened on demand.
    pub fn new(backend: B, config: PoolConfig) -> DataResult<Self> {
        config.validate()?;
        debug!(
            "connection pool for {} (max_size={}, pre_ping={})",
            backend.target(),
            config.max_size,
            config.pre_ping
        );
        Ok(Self {
            backend,
            config,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                in_use: 0,
                closed: false,
            }),
            available: Condvar::new(),
            counters: Counters::default(),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Acquires a connection, waiting up to the configured acquire timeout.
    ///
    /// Fails with `PoolExhausted` when the wait elapses and `PoolClosed`
    /// once the pool has been disposed.
    pub fn acquire(&self) -> DataResult<PooledConnection<'_, B>> {
        self.acquire_within(self.config.acquire_wait())
    }

    /// Acquires a connection without waiting for one to be released.
    pub fn try_acquire(&self) -> DataResult<PooledConnection<'_, B>> {
        self.acquire_within(Duration::ZERO)
    }

    /// Returns a connection to the pool. Equivalent to dropping the guard.
    pub fn release(&self, conn: PooledConnection<'_, B>) {
        drop(conn);
    }

    /// Closes every idle connection and refuses further acquisitions.
    ///
    /// Connections checked out at this point are closed when released.
    pub fn dispose(&self) {
        let drained = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            std::mem::take(&mut state.idle)
        };
        self.available.notify_all();
        self.counters
            .discarded
            .fetch_add(drained.len() as u64, Ordering::Relaxed);
        info!(
            "disposed connection pool for {} ({} idle connections closed)",
            self.backend.target(),
            drained.len()
        );
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn stats(&self) -> PoolStats {
        let (idle, in_use) = {
            let state = self.state.lock();
            (state.idle.len(), state.in_use)
        };
        PoolStats {
            size: idle + in_use,
            idle,
            in_use,
            created: self.counters.created.load(Ordering::Relaxed),
            discarded: self.counters.discarded.load(Ordering::Relaxed),
            acquisitions: self.counters.acquisitions.load(Ordering::Relaxed),
            releases: self.counters.releases.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
        }
    }

    // =========================================================================
    // Internal Methods
    // =========================================================================

    fn acquire_within(&self, wait: Duration) -> DataResult<PooledConnection<'_, B>> {
        let deadline = Instant::now() + wait;
        let reused = {
            let mut state = self.state.lock();
            loop {
                if state.closed {
                    return Err(DataError::PoolClosed);
                }
                if let Some(slot) = state.idle.pop_front() {
                    state.in_use += 1;
                    break Some(slot);
                }
                if state.in_use + state.idle.len() < self.config.max_size {
                    state.in_use += 1;
                    break None;
                }
                if Instant::now() >= deadline {
                    self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                    return Err(DataError::PoolExhausted);
                }
                self.available.wait_until(&mut state, deadline);
            }
        };

        // The slot is reserved; anything that fails from here must give it back.
        let slot = match reused {
            Some(slot) => self.check_out(slot),
            None => self.open_slot(),
        };
        match slot {
            Ok(mut slot) => {
                slot.use_count += 1;
                self.counters.acquisitions.fetch_add(1, Ordering::Relaxed);
                Ok(PooledConnection {
                    pool: self,
                    slot: Some(slot),
                    broken: false,
                })
            }
            Err(e) => {
                self.forfeit_slot();
                Err(e)
            }
        }
    }

    fn check_out(&self, mut slot: Slot<B::Connection>) -> DataResult<Slot<B::Connection>> {
        if slot.is_expired(self.config.lifetime()) {
            debug!("recycling expired connection to {}", self.backend.target());
            self.discard(slot);
            return self.open_slot();
        }
        if self.config.pre_ping && !slot.conn.ping() {
            debug!(
                "pre-ping failed, replacing connection to {}",
                self.backend.target()
            );
            self.discard(slot);
            return self.open_slot();
        }
        Ok(slot)
    }

    fn open_slot(&self) -> DataResult<Slot<B::Connection>> {
        let conn = self.backend.open()?;
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        Ok(Slot {
            conn,
            created_at: Instant::now(),
            use_count: 0,
        })
    }

    fn discard(&self, slot: Slot<B::Connection>) {
        self.counters.discarded.fetch_add(1, Ordering::Relaxed);
        drop(slot);
    }

    fn forfeit_slot(&self) {
        self.state.lock().in_use -= 1;
        self.available.notify_one();
    }

    fn check_in(&self, slot: Slot<B::Connection>, broken: bool) {
        self.counters.releases.fetch_add(1, Ordering::Relaxed);
        let rejected = {
            let mut state = self.state.lock();
            state.in_use -= 1;
            if state.closed || broken || slot.is_expired(self.config.lifetime()) {
                Some(slot)
            } else {
                state.idle.push_back(slot);
                None
            }
        };
        if let Some(slot) = rejected {
            self.discard(slot);
        }
        self.available.notify_one();
    }
}

impl<B: Backend> std::fmt::Debug for ConnectionPool<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("ConnectionPool")
            .field("target", &self.backend.target())
            .field("max_size", &self.config.max_size)
            .field("idle", &stats.idle)
            .field("in_use", &stats.in_use)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A connection checked out of a [`ConnectionPool`].
///
/// When dropped, the connection is returned to the pool, or closed if it
/// was marked broken or the pool has been disposed.
pub struct PooledConnection<'a, B: Backend> {
    pool: &'a ConnectionPool<B>,
    slot: Option<Slot<B::Connection>>,
    broken: bool,
}

impl<'a, B: Backend> PooledConnection<'a, B> {
    /// Closes the connection on release instead of returning it to the idle set.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Times this connection has been checked out, including this one.
    pub fn use_count(&self) -> u64 {
        self.slot.as_ref().map(|s| s.use_count).unwrap_or(0)
    }

    pub fn connection_age(&self) -> Duration {
        self.slot
            .as_ref()
            .map(|s| s.created_at.elapsed())
            .unwrap_or(Duration::ZERO)
    }
}

impl<'a, B: Backend> Deref for PooledConnection<'a, B> {
    type Target = B::Connection;

    fn deref(&self) -> &B::Connection {
        // The slot is only taken in `drop`.
        match &self.slot {
            Some(slot) => &slot.conn,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl<'a, B: Backend> DerefMut for PooledConnection<'a, B> {
    fn deref_mut(&mut self) -> &mut B::Connection {
        match &mut self.slot {
            Some(slot) => &mut slot.conn,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl<'a, B: Backend> Drop for PooledConnection<'a, B> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.pool.check_in(slot, self.broken);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockBackend;
    use std::sync::Arc;
    use std::thread;

    fn pool(backend: &MockBackend, config: PoolConfig) -> ConnectionPool<MockBackend> {
        ConnectionPool::new(backend.clone(), config).unwrap()
    }

    #[test]
    fn test_pool_config() {
        let config = PoolConfig::new()
            .max_size(10)
            .acquire_timeout(Duration::from_secs(5));
        assert_eq!(config.max_size, 10);
        assert_eq!(config.acquire_timeout_ms, 5000);
        assert!(config.validate().is_ok());
        assert!(PoolConfig::new().max_size(0).validate().is_err());
    }

    #[test]
    fn test_pool_reuses_idle_connection() {
        let backend = MockBackend::default();
        let pool = pool(&backend, PoolConfig::default());

        let conn = pool.acquire().unwrap();
        assert_eq!(conn.use_count(), 1);
        pool.release(conn);
        assert_eq!(pool.stats().idle, 1);

        let conn = pool.acquire().unwrap();
        assert_eq!(conn.use_count(), 2);
        drop(conn);

        assert_eq!(backend.opened(), 1);
        let stats = pool.stats();
        assert_eq!(stats.acquisitions, 2);
        assert_eq!(stats.releases, 2);
        assert_eq!(stats.in_use, 0);
    }

    #[test]
    fn test_pool_exhausted_at_capacity() {
        let backend = MockBackend::default();
        let pool = pool(
            &backend,
            PoolConfig::new()
                .max_size(2)
                .acquire_timeout(Duration::from_millis(50)),
        );

        let c1 = pool.acquire().unwrap();
        let c2 = pool.acquire().unwrap();
        assert!(matches!(pool.try_acquire(), Err(DataError::PoolExhausted)));
        assert!(matches!(pool.acquire(), Err(DataError::PoolExhausted)));

        let stats = pool.stats();
        assert_eq!(stats.in_use, 2);
        assert_eq!(stats.timeouts, 2);
        assert_eq!(backend.opened(), 2);

        drop(c1);
        assert!(pool.try_acquire().is_ok());
        drop(c2);
    }

    #[test]
    fn test_acquire_waits_for_release() {
        let backend = MockBackend::default();
        let pool = pool(
            &backend,
            PoolConfig::new()
                .max_size(1)
                .acquire_timeout(Duration::from_secs(5)),
        );

        let held = pool.acquire().unwrap();
        thread::scope(|s| {
            let waiter = s.spawn(|| pool.acquire().map(|c| c.use_count()));
            thread::sleep(Duration::from_millis(50));
            drop(held);
            assert_eq!(waiter.join().unwrap().unwrap(), 2);
        });
        assert_eq!(backend.opened(), 1);
    }

    #[test]
    fn test_pre_ping_replaces_dead_connection() {
        let backend = MockBackend::default();
        let pool = pool(&backend, PoolConfig::default());

        drop(pool.acquire().unwrap());
        backend.kill_all();

        let mut conn = pool.acquire().unwrap();
        assert!(conn.ping());
        assert_eq!(conn.use_count(), 1);
        drop(conn);

        assert_eq!(backend.opened(), 2);
        let stats = pool.stats();
        assert_eq!(stats.discarded, 1);
        assert_eq!(stats.size, 1);
    }

    #[test]
    fn test_without_pre_ping_dead_connection_is_reused() {
        let backend = MockBackend::default();
        let pool = pool(&backend, PoolConfig::new().pre_ping(false));

        drop(pool.acquire().unwrap());
        backend.kill_all();

        let mut conn = pool.acquire().unwrap();
        assert!(!conn.ping());
        assert_eq!(backend.opened(), 1);
    }

    #[test]
    fn test_expired_connection_is_recycled() {
        let backend = MockBackend::default();
        let pool = pool(
            &backend,
            PoolConfig::new().max_lifetime(Duration::from_millis(10)),
        );

        let conn = pool.acquire().unwrap();
        thread::sleep(Duration::from_millis(20));
        drop(conn);
        assert_eq!(pool.stats().idle, 0);

        drop(pool.acquire().unwrap());
        assert_eq!(backend.opened(), 2);
    }

    #[test]
    fn test_dispose() {
        let backend = MockBackend::default();
        let pool = pool(&backend, PoolConfig::default());

        let held = pool.acquire().unwrap();
        drop(pool.acquire().unwrap());
        assert_eq!(pool.stats().idle, 1);

        pool.dispose();
        assert!(pool.is_closed());
        assert_eq!(pool.stats().idle, 0);
        assert!(matches!(pool.acquire(), Err(DataError::PoolClosed)));

        drop(held);
        let stats = pool.stats();
        assert_eq!(stats.size, 0);
        assert_eq!(stats.discarded, 2);
    }

    #[test]
    fn test_dispose_wakes_waiters() {
        let backend = MockBackend::default();
        let pool = pool(
            &backend,
            PoolConfig::new()
                .max_size(1)
                .acquire_timeout(Duration::from_secs(5)),
        );

        let _held = pool.acquire().unwrap();
        thread::scope(|s| {
            let waiter = s.spawn(|| pool.acquire().map(|_| ()));
            thread::sleep(Duration::from_millis(50));
            pool.dispose();
            assert!(matches!(waiter.join().unwrap(), Err(DataError::PoolClosed)));
        });
    }

    #[test]
    fn test_broken_connection_is_closed() {
        let backend = MockBackend::default();
        let pool = pool(&backend, PoolConfig::default());

        let mut conn = pool.acquire().unwrap();
        conn.mark_broken();
        drop(conn);

        let stats = pool.stats();
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.discarded, 1);
    }

    #[test]
    fn test_open_failure_frees_slot() {
        let backend = MockBackend::default();
        let pool = pool(&backend, PoolConfig::new().max_size(1));

        backend.fail_open(true);
        assert!(matches!(pool.acquire(), Err(DataError::DataAccess(_))));
        assert_eq!(pool.stats().in_use, 0);

        backend.fail_open(false);
        assert!(pool.try_acquire().is_ok());
    }

    #[test]
    fn test_size_never_exceeds_max() {
        let backend = MockBackend::default();
        let pool = Arc::new(pool(
            &backend,
            PoolConfig::new()
                .max_size(3)
                .acquire_timeout(Duration::from_secs(5)),
        ));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    for _ in 0..50 {
                        let conn = pool.acquire().unwrap();
                        let stats = pool.stats();
                        assert!(stats.in_use + stats.idle <= 3);
                        drop(conn);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(backend.opened() <= 3);
        assert_eq!(pool.stats().acquisitions, 400);
    }
}
