//! Bounded pool of reusable client sockets.
//!
//! A [`Pool`] lends sockets out as [`PooledConnection`] handles. Dropping a
//! handle reclaims its socket: it is handed straight to the oldest waiting
//! acquirer, parked on the idle list, or closed when the pool already has
//! enough sockets. Idle sockets are reused most-recently-returned first.
//!
//! All bookkeeping sits behind one mutex per pool. Connecting, closing and
//! waiting happen outside of it.

mod reaper;
mod registry;
mod socket;

pub use registry::PoolRegistry;
pub use socket::{Connector, PooledConnection, TcpConnector, Transport};

use crate::instrument::{emit, Instrumentation, Sink};
use reaper::Reaper;
use slab::Slab;
use socket::{PooledSocket, SocketStatus};
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Runtime-adjustable pool settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Upper bound on idle plus lent sockets.
    pub max_connections: usize,
    /// Idle sockets older than this are closed by the reaper.
    pub idle_timeout: Duration,
    /// Bound on both connecting and waiting for a free socket.
    pub connect_timeout: Duration,
    /// Idle sockets older than this are checked for liveness before reuse.
    pub check_interval: Duration,
    /// Period of the background reaper.
    pub cleanup_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            idle_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            check_interval: Duration::from_secs(10),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("no connection available within {timeout:?}")]
    Exhausted { timeout: Duration },

    #[error("connect timed out after {timeout:?}")]
    TimedOut { timeout: Duration },

    #[error("connect failed: {0}")]
    Connect(#[source] io::Error),

    #[error("pool is shut down")]
    Shutdown,
}

/// Point-in-time occupancy of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub available: usize,
    pub busy: usize,
    pub waiters: usize,
}

struct Idle {
    socket: PooledSocket,
    queued_at: Instant,
}

/// A busy slot. `Connecting` reserves capacity while a connect runs
/// outside the lock.
enum Busy {
    Connecting,
    Lent(Arc<SocketStatus>),
}

/// What a waiter is handed: a ready socket, or a reserved slot to connect into.
enum Grant {
    Socket { key: usize, socket: PooledSocket },
    Slot { key: usize },
}

impl Grant {
    fn into_socket(self) -> Option<PooledSocket> {
        match self {
            Grant::Socket { socket, .. } => Some(socket),
            Grant::Slot { .. } => None,
        }
    }
}

struct Waiter {
    id: u64,
    tx: SyncSender<Grant>,
}

struct PoolState {
    config: PoolConfig,
    available: Vec<Idle>,
    busy: Slab<Busy>,
    waiters: VecDeque<Waiter>,
    next_waiter: u64,
}

impl PoolState {
    fn occupied(&self) -> usize {
        self.available.len() + self.busy.len()
    }

    fn has_capacity(&self) -> bool {
        self.occupied() < self.config.max_connections
    }

    /// Release the busy slot at `key` if it still belongs to `status`.
    fn release(&mut self, key: usize, status: &Arc<SocketStatus>) {
        if matches!(self.busy.get(key), Some(Busy::Lent(s)) if Arc::ptr_eq(s, status)) {
            self.busy.remove(key);
        }
    }

    /// Hand free capacity to waiters as connect slots.
    fn grant_slots(&mut self) {
        while self.has_capacity() {
            let Some(waiter) = self.waiters.pop_front() else {
                break;
            };
            let key = self.busy.insert(Busy::Connecting);
            if waiter.tx.try_send(Grant::Slot { key }).is_err() {
                self.busy.remove(key);
            }
        }
    }

    /// Drop zombie busy entries and move expired idle sockets into `out`.
    fn reap(&mut self, out: &mut Vec<PooledSocket>) {
        self.busy
            .retain(|_, entry| !matches!(entry, Busy::Lent(status) if status.is_disposed()));

        let idle_timeout = self.config.idle_timeout;
        let expired = self
            .available
            .iter()
            .take_while(|idle| idle.queued_at.elapsed() >= idle_timeout)
            .count();
        out.extend(self.available.drain(..expired).map(|idle| idle.socket));

        let mut i = 0;
        while i < self.available.len() {
            if self.available[i].socket.is_disposed() {
                out.push(self.available.remove(i).socket);
            } else {
                i += 1;
            }
        }
    }
}

pub(crate) struct Shared {
    connector: Box<dyn Connector>,
    state: Mutex<PoolState>,
    shutdown: AtomicBool,
    next_id: AtomicU64,
    sink: Sink,
    reaper: Mutex<Option<Reaper>>,
}

enum Step {
    Ready(usize, PooledSocket),
    Connect(usize, Duration),
    Wait(Receiver<Grant>, u64, Duration),
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // A panic while holding the lock cannot leave the state torn.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn endpoint(&self) -> &str {
        self.connector.endpoint()
    }

    pub(crate) fn cleanup_interval(&self) -> Duration {
        self.lock().config.cleanup_interval
    }

    fn close(&self, socket: PooledSocket) {
        trace!(endpoint = self.endpoint(), id = socket.id, "Closing socket");
        socket.close();
        emit(&self.sink, |s| s.socket_closed(self.endpoint()));
    }

    fn close_all(&self, sockets: Vec<PooledSocket>) -> usize {
        let count = sockets.len();
        for socket in sockets {
            self.close(socket);
        }
        count
    }

    pub(crate) fn reap(&self) -> usize {
        let mut closed = Vec::new();
        {
            let mut state = self.lock();
            state.reap(&mut closed);
            state.grant_slots();
        }
        self.close_all(closed)
    }

    pub(crate) fn reclaim(&self, key: usize, socket: PooledSocket) {
        let mut state = self.lock();
        state.release(key, &socket.status);

        if self.shutdown.load(Ordering::Acquire) {
            drop(state);
            self.close(socket);
            return;
        }
        if !socket.is_connected() {
            state.grant_slots();
            drop(state);
            self.close(socket);
            return;
        }

        let mut offered = Some(socket);
        while let Some(socket) = offered.take() {
            let Some(waiter) = state.waiters.pop_front() else {
                offered = Some(socket);
                break;
            };
            let key = state.busy.insert(Busy::Lent(socket.status.clone()));
            match waiter.tx.try_send(Grant::Socket { key, socket }) {
                Ok(()) => {
                    trace!(
                        endpoint = self.endpoint(),
                        waiter = waiter.id,
                        "Handed socket to waiter"
                    );
                    return;
                }
                Err(TrySendError::Full(grant) | TrySendError::Disconnected(grant)) => {
                    state.busy.remove(key);
                    offered = grant.into_socket();
                }
            }
        }
        let Some(socket) = offered else {
            return;
        };

        if !state.has_capacity() {
            drop(state);
            self.close(socket);
            return;
        }

        state.available.push(Idle {
            socket,
            queued_at: Instant::now(),
        });
    }

    fn connect(
        self: &Arc<Self>,
        key: usize,
        timeout: Duration,
    ) -> Result<PooledConnection, PoolError> {
        match self.connector.connect(timeout) {
            Ok(transport) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let socket = PooledSocket::new(id, transport);
                {
                    let mut state = self.lock();
                    if let Some(slot) = state.busy.get_mut(key) {
                        *slot = Busy::Lent(socket.status.clone());
                    }
                }
                debug!(endpoint = self.endpoint(), id, "Socket created");
                emit(&self.sink, |s| s.socket_created(self.endpoint()));
                Ok(PooledConnection::new(key, socket, self.clone()))
            }
            Err(e) => {
                {
                    let mut state = self.lock();
                    state.busy.try_remove(key);
                    state.grant_slots();
                }
                debug!(endpoint = self.endpoint(), error = %e, "Connect failed");
                Err(e)
            }
        }
    }
}

/// Shared handle to a connection pool. Clones refer to the same pool.
#[derive(Clone)]
pub struct Pool {
    shared: Arc<Shared>,
}

/// Builder for an isolated [`Pool`].
pub struct PoolBuilder {
    connector: Box<dyn Connector>,
    config: PoolConfig,
    sink: Sink,
}

impl PoolBuilder {
    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    pub fn instrumentation(mut self, sink: Arc<dyn Instrumentation>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Create the pool and start its reaper thread.
    pub fn build(self) -> io::Result<Pool> {
        let shared = Arc::new(Shared {
            connector: self.connector,
            state: Mutex::new(PoolState {
                config: self.config,
                available: Vec::new(),
                busy: Slab::new(),
                waiters: VecDeque::new(),
                next_waiter: 0,
            }),
            shutdown: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            sink: self.sink,
            reaper: Mutex::new(None),
        });

        let reaper = Reaper::start(Arc::downgrade(&shared))?;
        *shared.reaper.lock().unwrap_or_else(|e| e.into_inner()) = Some(reaper);
        debug!(endpoint = shared.endpoint(), "Pool created");

        Ok(Pool { shared })
    }
}

impl Pool {
    pub fn builder(connector: impl Connector + 'static) -> PoolBuilder {
        PoolBuilder {
            connector: Box::new(connector),
            config: PoolConfig::default(),
            sink: None,
        }
    }

    /// Create an isolated pool of TCP sockets to `host:port`.
    pub fn create(host: &str, port: u16, config: PoolConfig) -> io::Result<Self> {
        Self::builder(TcpConnector::new(host, port)).config(config).build()
    }

    pub fn endpoint(&self) -> &str {
        self.shared.endpoint()
    }

    /// Borrow a socket, connecting or waiting as needed.
    pub fn acquire(&self) -> Result<PooledConnection, PoolError> {
        let shared = &self.shared;
        if shared.shutdown.load(Ordering::Acquire) {
            return Err(PoolError::Shutdown);
        }

        let mut stale = Vec::new();
        let step = {
            let mut state = shared.lock();
            let check_interval = state.config.check_interval;

            let mut found = None;
            while let Some(idle) = state.available.pop() {
                let suspect = idle.queued_at.elapsed() >= check_interval;
                if idle.socket.is_disposed() || (suspect && !idle.socket.is_connected()) {
                    stale.push(idle.socket);
                    continue;
                }
                found = Some(idle.socket);
                break;
            }

            if let Some(socket) = found {
                let key = state.busy.insert(Busy::Lent(socket.status.clone()));
                Step::Ready(key, socket)
            } else {
                let timeout = state.config.connect_timeout;
                if !state.has_capacity() {
                    state.reap(&mut stale);
                }
                if state.has_capacity() {
                    let key = state.busy.insert(Busy::Connecting);
                    // The reap may have freed more than this caller needs.
                    state.grant_slots();
                    Step::Connect(key, timeout)
                } else {
                    let (tx, rx) = mpsc::sync_channel(1);
                    let id = state.next_waiter;
                    state.next_waiter += 1;
                    state.waiters.push_back(Waiter { id, tx });
                    Step::Wait(rx, id, timeout)
                }
            }
        };

        if !stale.is_empty() {
            debug!(endpoint = shared.endpoint(), count = stale.len(), "Discarding stale sockets");
            shared.close_all(stale);
        }

        match step {
            Step::Ready(key, socket) => Ok(PooledConnection::new(key, socket, shared.clone())),
            Step::Connect(key, timeout) => shared.connect(key, timeout),
            Step::Wait(rx, id, timeout) => self.wait(rx, id, timeout),
        }
    }

    fn wait(
        &self,
        rx: Receiver<Grant>,
        id: u64,
        timeout: Duration,
    ) -> Result<PooledConnection, PoolError> {
        trace!(endpoint = self.endpoint(), waiter = id, "Waiting for a socket");
        match rx.recv_timeout(timeout) {
            Ok(grant) => self.take_grant(grant, timeout),
            Err(RecvTimeoutError::Timeout) => {
                self.shared.lock().waiters.retain(|w| w.id != id);
                // A grant may have been sent right before we left the queue.
                if let Ok(grant) = rx.try_recv() {
                    return self.take_grant(grant, timeout);
                }
                warn!(endpoint = self.endpoint(), ?timeout, "Pool exhausted");
                Err(PoolError::Exhausted { timeout })
            }
            Err(RecvTimeoutError::Disconnected) => Err(PoolError::Shutdown),
        }
    }

    fn take_grant(&self, grant: Grant, timeout: Duration) -> Result<PooledConnection, PoolError> {
        match grant {
            Grant::Socket { key, socket } => {
                Ok(PooledConnection::new(key, socket, self.shared.clone()))
            }
            Grant::Slot { key } => self.shared.connect(key, timeout),
        }
    }

    /// Run one reaper pass now. Returns the number of sockets closed.
    pub fn reap(&self) -> usize {
        self.shared.reap()
    }

    /// Adjust the configuration of the live pool.
    pub fn configure<F>(&self, f: F)
    where
        F: FnOnce(&mut PoolConfig),
    {
        f(&mut self.shared.lock().config);
    }

    pub fn config(&self) -> PoolConfig {
        self.shared.lock().config.clone()
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock();
        PoolStats {
            available: state.available.len(),
            busy: state.busy.len(),
            waiters: state.waiters.len(),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    /// Close idle sockets, fail pending waiters and stop the reaper.
    ///
    /// Sockets still on loan are closed when their handles drop.
    pub fn shutdown(&self) {
        let shared = &self.shared;
        if shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }

        let (idle, waiters) = {
            let mut state = shared.lock();
            let idle: Vec<_> = state.available.drain(..).map(|idle| idle.socket).collect();
            (idle, std::mem::take(&mut state.waiters))
        };
        drop(waiters);
        let closed = shared.close_all(idle);

        let reaper = shared.reaper.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(reaper) = reaper {
            reaper.stop();
        }
        debug!(endpoint = shared.endpoint(), closed, "Pool shut down");
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("endpoint", &self.endpoint())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::tests::Recorder;
    use std::io::{Read, Write};
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[derive(Debug)]
    pub(crate) struct MockLink {
        pub(crate) connected: AtomicBool,
        pub(crate) closed: AtomicBool,
    }

    struct MockTransport(Arc<MockLink>);

    impl Read for MockTransport {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }
    }

    impl Write for MockTransport {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Transport for MockTransport {
        fn is_connected(&self) -> bool {
            self.0.connected.load(Ordering::SeqCst) && !self.0.closed.load(Ordering::SeqCst)
        }

        fn close(&mut self) {
            self.0.closed.store(true, Ordering::SeqCst);
        }
    }

    /// Hands out in-memory transports and remembers every one it made.
    #[derive(Default)]
    pub(crate) struct MockConnector {
        pub(crate) links: Mutex<Vec<Arc<MockLink>>>,
        pub(crate) refuse: AtomicBool,
    }

    impl MockConnector {
        pub(crate) fn created(&self) -> usize {
            self.links.lock().unwrap().len()
        }

        pub(crate) fn link(&self, index: usize) -> Arc<MockLink> {
            self.links.lock().unwrap()[index].clone()
        }
    }

    impl Connector for MockConnector {
        fn connect(&self, _timeout: Duration) -> Result<Box<dyn Transport>, PoolError> {
            if self.refuse.load(Ordering::SeqCst) {
                return Err(PoolError::Connect(io::ErrorKind::ConnectionRefused.into()));
            }
            let link = Arc::new(MockLink {
                connected: AtomicBool::new(true),
                closed: AtomicBool::new(false),
            });
            self.links.lock().unwrap().push(link.clone());
            Ok(Box::new(MockTransport(link)))
        }

        fn endpoint(&self) -> &str {
            "mock:0"
        }
    }

    fn pool(config: PoolConfig) -> (Pool, Arc<MockConnector>) {
        let connector = Arc::new(MockConnector::default());
        let pool = Pool::builder(connector.clone()).config(config).build().unwrap();
        (pool, connector)
    }

    fn small(max_connections: usize) -> PoolConfig {
        PoolConfig {
            max_connections,
            connect_timeout: Duration::from_millis(100),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.max_connections, 100);
        assert_eq!(config.idle_timeout, Duration::from_secs(30));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.check_interval, Duration::from_secs(10));
        assert_eq!(config.cleanup_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_sequential_reuse_creates_one_socket() {
        let (pool, connector) = pool(small(4));
        for _ in 0..10 {
            let mut conn = pool.acquire().unwrap();
            conn.write_all(b"PING\r\n").unwrap();
        }
        assert_eq!(connector.created(), 1);
        assert_eq!(
            pool.stats(),
            PoolStats {
                available: 1,
                busy: 0,
                waiters: 0
            }
        );
    }

    #[test]
    fn test_concurrent_acquisitions_create_one_socket_each() {
        let (pool, connector) = pool(small(4));
        let held: Vec<_> = (0..3).map(|_| pool.acquire().unwrap()).collect();
        assert_eq!(connector.created(), 3);
        assert_eq!(pool.stats().busy, 3);
        drop(held);
        assert_eq!(pool.stats().available, 3);
        assert_eq!(pool.stats().busy, 0);
    }

    #[test]
    fn test_lifo_reuse() {
        let (pool, _) = pool(small(4));
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        let (a_id, b_id) = (a.id(), b.id());
        drop(a);
        drop(b);
        assert_eq!(pool.acquire().unwrap().id(), b_id);
        assert_ne!(a_id, b_id);
    }

    #[test]
    fn test_exhausted_after_connect_timeout() {
        let (pool, connector) = pool(small(2));
        let _a = pool.acquire().unwrap();
        let _b = pool.acquire().unwrap();

        let started = Instant::now();
        let err = pool.acquire().unwrap_err();
        assert!(matches!(err, PoolError::Exhausted { .. }));
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(connector.created(), 2);
        assert_eq!(pool.stats().waiters, 0);
    }

    #[test]
    fn test_waiter_receives_released_socket() {
        let (pool, connector) = pool(PoolConfig {
            max_connections: 2,
            connect_timeout: Duration::from_secs(5),
            ..Default::default()
        });
        let a = pool.acquire().unwrap();
        let _b = pool.acquire().unwrap();
        let a_id = a.id();

        let waiting = {
            let pool = pool.clone();
            thread::spawn(move || pool.acquire().map(|conn| conn.id()))
        };
        while pool.stats().waiters == 0 {
            thread::sleep(Duration::from_millis(5));
        }
        drop(a);

        assert_eq!(waiting.join().unwrap().unwrap(), a_id);
        assert_eq!(connector.created(), 2);
        assert_eq!(pool.stats().available, 1);
    }

    #[test]
    fn test_waiter_connects_when_lent_socket_fails() {
        let (pool, connector) = pool(PoolConfig {
            connect_timeout: Duration::from_secs(5),
            ..small(1)
        });
        let mut held = pool.acquire().unwrap();
        let first = held.id();

        let waiting = {
            let pool = pool.clone();
            thread::spawn(move || pool.acquire().map(|conn| conn.id()))
        };
        while pool.stats().waiters == 0 {
            thread::sleep(Duration::from_millis(5));
        }
        held.discard();
        drop(held);

        let id = waiting.join().unwrap().unwrap();
        assert_ne!(id, first);
        assert_eq!(connector.created(), 2);
    }

    #[test]
    fn test_discarded_socket_is_closed_not_reused() {
        let (pool, connector) = pool(small(4));
        let mut conn = pool.acquire().unwrap();
        conn.discard();
        assert!(conn.write(b"x").is_err());
        drop(conn);

        assert!(connector.link(0).closed.load(Ordering::SeqCst));
        assert_eq!(pool.stats().available, 0);
        let _conn = pool.acquire().unwrap();
        assert_eq!(connector.created(), 2);
    }

    #[test]
    fn test_stale_idle_socket_is_checked() {
        let (pool, connector) = pool(PoolConfig {
            check_interval: Duration::ZERO,
            ..small(4)
        });
        drop(pool.acquire().unwrap());
        connector.link(0).connected.store(false, Ordering::SeqCst);

        let _conn = pool.acquire().unwrap();
        assert_eq!(connector.created(), 2);
        assert!(connector.link(0).closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_reap_closes_expired_idle_sockets() {
        let (pool, connector) = pool(small(4));
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        drop(a);
        drop(b);

        assert_eq!(pool.reap(), 0);
        pool.configure(|c| c.idle_timeout = Duration::ZERO);
        assert_eq!(pool.reap(), 2);
        assert_eq!(pool.stats().available, 0);
        assert!(connector.link(1).closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_reap_forgets_zombie_busy_entries() {
        let (pool, connector) = pool(small(1));
        let mut zombie = pool.acquire().unwrap();
        zombie.discard();
        assert_eq!(pool.stats().busy, 1);

        // At capacity, acquire reaps before queueing.
        let fresh = pool.acquire().unwrap();
        assert_eq!(connector.created(), 2);
        assert_eq!(pool.stats().busy, 1);

        drop(zombie);
        assert_eq!(pool.stats().busy, 1);
        drop(fresh);
        assert_eq!(pool.stats().available, 1);
    }

    #[test]
    fn test_inline_reap_wakes_queued_waiters() {
        let (pool, connector) = pool(PoolConfig {
            connect_timeout: Duration::from_secs(5),
            ..small(2)
        });
        let mut a = pool.acquire().unwrap();
        let mut b = pool.acquire().unwrap();

        let waiting = {
            let pool = pool.clone();
            thread::spawn(move || pool.acquire().map(|conn| conn.id()))
        };
        while pool.stats().waiters == 0 {
            thread::sleep(Duration::from_millis(5));
        }

        // Two zombies: disposed but still held, so no reclaim runs.
        a.discard();
        b.discard();
        let started = Instant::now();
        let fresh = pool.acquire().unwrap();

        assert!(waiting.join().unwrap().is_ok());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(connector.created(), 4);
        assert_eq!(pool.stats().waiters, 0);
        drop(fresh);
    }

    #[test]
    fn test_reclaim_over_capacity_closes() {
        let (pool, connector) = pool(small(3));
        let held: Vec<_> = (0..3).map(|_| pool.acquire().unwrap()).collect();
        pool.configure(|c| c.max_connections = 1);
        drop(held);

        assert_eq!(pool.stats().available, 1);
        let closed = connector
            .links
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.closed.load(Ordering::SeqCst))
            .count();
        assert_eq!(closed, 2);
    }

    #[test]
    fn test_connect_failure_releases_reservation() {
        let (pool, connector) = pool(small(1));
        connector.refuse.store(true, Ordering::SeqCst);
        assert!(matches!(pool.acquire(), Err(PoolError::Connect(_))));
        assert_eq!(pool.stats().busy, 0);

        connector.refuse.store(false, Ordering::SeqCst);
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn test_shutdown_closes_idle_sockets() {
        let (pool, connector) = pool(small(2));
        drop(pool.acquire().unwrap());
        assert_eq!(pool.stats().available, 1);

        pool.shutdown();
        assert!(pool.is_shutdown());
        assert!(connector.link(0).closed.load(Ordering::SeqCst));
        assert_eq!(pool.stats().available, 0);
        assert!(matches!(pool.acquire(), Err(PoolError::Shutdown)));
    }

    #[test]
    fn test_shutdown_fails_waiters_and_closes_returned_sockets() {
        let (pool, connector) = pool(PoolConfig {
            connect_timeout: Duration::from_secs(5),
            ..small(1)
        });
        let held = pool.acquire().unwrap();

        let waiting = {
            let pool = pool.clone();
            thread::spawn(move || pool.acquire().map(|conn| conn.id()))
        };
        while pool.stats().waiters == 0 {
            thread::sleep(Duration::from_millis(5));
        }

        pool.shutdown();
        assert!(matches!(waiting.join().unwrap(), Err(PoolError::Shutdown)));

        drop(held);
        assert!(connector.link(0).closed.load(Ordering::SeqCst));
        assert_eq!(pool.stats().available, 0);
    }

    #[test]
    fn test_reaper_runs_in_background() {
        let (pool, connector) = pool(PoolConfig {
            idle_timeout: Duration::ZERO,
            cleanup_interval: Duration::from_millis(20),
            ..small(2)
        });
        drop(pool.acquire().unwrap());

        let deadline = Instant::now() + Duration::from_secs(5);
        while !connector.link(0).closed.load(Ordering::SeqCst) {
            assert!(Instant::now() < deadline, "reaper never ran");
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(pool.stats().available, 0);
    }

    #[test]
    fn test_socket_events() {
        let recorder = Arc::new(Recorder::default());
        let connector = Arc::new(MockConnector::default());
        let pool = Pool::builder(connector)
            .instrumentation(recorder.clone())
            .build()
            .unwrap();

        let mut conn = pool.acquire().unwrap();
        conn.discard();
        drop(conn);
        assert_eq!(recorder.take(), vec!["created mock:0", "closed mock:0"]);
    }

    #[test]
    fn test_capacity_under_contention() {
        let (pool, connector) = pool(PoolConfig {
            connect_timeout: Duration::from_secs(5),
            ..small(3)
        });
        let counter = Arc::new(AtomicUsize::new(0));
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                let counter = counter.clone();
                thread::spawn(move || {
                    for _ in 0..20 {
                        let _conn = pool.acquire().unwrap();
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 160);
        assert!(connector.created() <= 3);
        let stats = pool.stats();
        assert!(stats.available + stats.busy <= 3);
    }
}
