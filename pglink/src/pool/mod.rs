//! Bounded session pool.
//!
//! Requests are served strictly FIFO; idle sessions are reused in the order
//! they were released (earliest-released first); a background timer thread
//! force-closes sessions held past the allocated-connection timeout and
//! flushes metrics on an interval.
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    thread,
    time::Instant,
};

use lru::LruCache;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::{
    connection::{Config, Connection},
    error::{ErrorKind, Result},
    logger::{LogLevel, now_millis, plog},
    protocol::TransactionStatus,
};

mod config;
mod metrics;

pub use config::PoolConfig;
pub use metrics::PoolMetrics;

use metrics::MetricsAccum;

/// A bounded pool of sessions multiplexed across concurrent requestors.
///
/// Cloning yields another handle to the same pool; the pool closes
/// gracefully when the last handle drops.
pub struct Pool {
    shared: Arc<PoolShared>,
}

struct PoolShared {
    name: String,
    pool_config: PoolConfig,
    conn_config: Config,
    state: Mutex<PoolState>,
    /// Wakes the timer thread when deadlines change or the pool closes.
    timer: Condvar,
    handles: AtomicUsize,
}

struct PoolState {
    closed: bool,
    /// Insert on release, `pop_lru` on reuse: earliest-released first.
    idle: LruCache<String, IdleEntry>,
    allocated: HashMap<String, AllocatedEntry>,
    /// Strictly FIFO by enqueue time.
    pending: VecDeque<Arc<Waiter>>,
    /// Acquires currently creating a session outside the lock.
    connecting: usize,
    next_flush: Option<Instant>,
    metrics: MetricsAccum,
}

struct IdleEntry {
    conn: Connection,
    released_at: Instant,
}

struct AllocatedEntry {
    session: Arc<crate::connection::Shared>,
    deadline: Option<Instant>,
    timed_out: bool,
}

struct Waiter {
    slot: Mutex<WaiterSlot>,
    condvar: Condvar,
    deadline: Option<Instant>,
}

enum WaiterSlot {
    Waiting,
    /// A released session was handed over.
    Ready(Connection),
    /// Capacity opened up; leave the queue and try again (front position
    /// is kept on a lost race).
    Retry,
    /// The waiter gave up; any later signal must go to somebody else.
    Cancelled,
    PoolClosed,
}

static POOL_SEQ: AtomicU64 = AtomicU64::new(1);

fn next_pool_id() -> String {
    let seq = POOL_SEQ.fetch_add(1, Ordering::SeqCst);
    let mut buf = itoa::Buffer::new();
    ["Pool-", buf.format(seq)].concat()
}

impl Pool {
    /// Create a pool. Sessions are created lazily, on demand.
    pub fn new(pool_config: PoolConfig, conn_config: Config) -> Pool {
        let name = next_pool_id();
        let interval = pool_config.metrics_logging_interval;
        let shared = Arc::new(PoolShared {
            name,
            pool_config,
            conn_config,
            state: Mutex::new(PoolState {
                closed: false,
                idle: LruCache::unbounded(),
                allocated: HashMap::new(),
                pending: VecDeque::new(),
                connecting: 0,
                next_flush: (!interval.is_zero()).then(|| Instant::now() + interval),
                metrics: MetricsAccum::new(now_millis(), 0, 0),
            }),
            timer: Condvar::new(),
            handles: AtomicUsize::new(1),
        });

        let weak = Arc::downgrade(&shared);
        thread::Builder::new()
            .name([shared.name.as_str(), "-timer"].concat())
            .spawn(move || timer_loop(weak))
            .expect("failed to spawn pool timer thread");

        Pool { shared }
    }

    /// The pool's identity, used as log context.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Obtain an exclusive session.
    ///
    /// Served from the idle set (earliest released first) when possible;
    /// creates a session while under the connection cap; otherwise joins the
    /// FIFO pending queue, subject to the pending cap and timeout.
    pub fn acquire(&self) -> Result<PoolConnection> {
        let started = Instant::now();
        let shared = &self.shared;

        let waiter = {
            let mut state = shared.state.lock();

            if state.closed {
                state.metrics.unsuccessful_requests_error += 1;
                return Err(ErrorKind::ConnectionPoolClosed.into());
            }

            if let Some(conn) = take_idle(shared, &mut state) {
                state.metrics.record_success(started.elapsed());
                return Ok(PoolConnection::new(self.clone(), conn));
            }

            if state.allocated.len() + state.connecting < shared.pool_config.max_connections {
                return self.connect_new(state, started);
            }

            if let Some(cap) = shared.pool_config.max_pending_requests {
                if state.pending.len() >= cap {
                    state.metrics.unsuccessful_requests_too_busy += 1;
                    return Err(ErrorKind::TooManyRequestsForConnections.into());
                }
            }

            let waiter = Arc::new(Waiter {
                slot: Mutex::new(WaiterSlot::Waiting),
                condvar: Condvar::new(),
                deadline: shared
                    .pool_config
                    .pending_request_timeout
                    .map(|timeout| started + timeout),
            });
            state.pending.push_back(waiter.clone());
            let pending_len = state.pending.len();
            state.metrics.record_pending_level(pending_len);
            waiter
        };

        self.wait_for_session(waiter, started)
    }

    /// Close the pool. New acquires are rejected and pending requests fail;
    /// idle sessions close immediately, allocated sessions close on release.
    /// With `force`, allocated sessions are closed out from under their
    /// holders as well.
    pub fn close(&self, force: bool) {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;

        let mut idle = Vec::new();
        while let Some((_, entry)) = state.idle.pop_lru() {
            idle.push(entry.conn);
        }

        for waiter in state.pending.drain(..) {
            let mut slot = waiter.slot.lock();
            if matches!(&*slot, WaiterSlot::Waiting) {
                *slot = WaiterSlot::PoolClosed;
                waiter.condvar.notify_one();
            }
        }

        let forced: Vec<_> = if force {
            state.allocated.values().map(|e| e.session.clone()).collect()
        } else {
            Vec::new()
        };

        shared.timer.notify_all();
        drop(state);

        for conn in idle {
            conn.close();
        }
        for session in forced {
            session.control.abort();
        }

        plog!(LogLevel::Fine, &shared.name, "pool closed (force: {force})");
    }

    /// Snapshot the metrics for the current period.
    pub fn metrics(&self) -> PoolMetrics {
        self.compute_metrics(false)
    }

    /// Snapshot the metrics, optionally starting a new period.
    pub fn compute_metrics(&self, reset: bool) -> PoolMetrics {
        let mut state = self.shared.state.lock();
        let connections = state.allocated.len() + state.idle.len();
        let snapshot = state.metrics.snapshot(now_millis(), connections);
        if reset {
            let pending = state.pending.len();
            state.metrics.reset(snapshot.period_end_millis, pending, connections);
        }
        snapshot
    }

    /// Create a session outside the lock, under a reserved capacity slot.
    fn connect_new(
        &self,
        mut state: MutexGuard<'_, PoolState>,
        started: Instant,
    ) -> Result<PoolConnection> {
        let shared = &self.shared;
        state.connecting += 1;
        drop(state);

        let result = Connection::connect(&shared.conn_config);

        let mut state = shared.state.lock();
        state.connecting -= 1;
        match result {
            Ok(conn) => {
                if state.closed {
                    state.metrics.unsuccessful_requests_error += 1;
                    drop(state);
                    conn.close();
                    return Err(ErrorKind::ConnectionPoolClosed.into());
                }
                state.metrics.connections_created += 1;
                mark_allocated(shared, &mut state, &conn);
                state.metrics.record_success(started.elapsed());
                plog!(
                    LogLevel::Fine,
                    &shared.name,
                    "created {} ({} allocated, {} idle)",
                    conn.id(),
                    state.allocated.len(),
                    state.idle.len(),
                );
                Ok(PoolConnection::new(self.clone(), conn))
            }
            Err(err) => {
                state.metrics.unsuccessful_requests_error += 1;
                // the reserved slot is free again; let a waiter have it
                nudge_waiter(shared, &mut state);
                Err(err)
            }
        }
    }

    fn wait_for_session(&self, waiter: Arc<Waiter>, started: Instant) -> Result<PoolConnection> {
        let shared = &self.shared;
        let mut slot = waiter.slot.lock();
        loop {
            match &*slot {
                WaiterSlot::Ready(_) => {
                    let WaiterSlot::Ready(conn) =
                        std::mem::replace(&mut *slot, WaiterSlot::Cancelled)
                    else {
                        unreachable!()
                    };
                    drop(slot);
                    shared.state.lock().metrics.record_success(started.elapsed());
                    return Ok(PoolConnection::new(self.clone(), conn));
                }
                WaiterSlot::PoolClosed => {
                    *slot = WaiterSlot::Cancelled;
                    drop(slot);
                    shared.state.lock().metrics.unsuccessful_requests_error += 1;
                    return Err(ErrorKind::ConnectionPoolClosed.into());
                }
                WaiterSlot::Retry => {
                    *slot = WaiterSlot::Waiting;
                    drop(slot);

                    let mut state = shared.state.lock();
                    if state.closed {
                        state.metrics.unsuccessful_requests_error += 1;
                        return Err(ErrorKind::ConnectionPoolClosed.into());
                    }
                    if let Some(conn) = take_idle(shared, &mut state) {
                        state.metrics.record_success(started.elapsed());
                        return Ok(PoolConnection::new(self.clone(), conn));
                    }
                    if state.allocated.len() + state.connecting
                        < shared.pool_config.max_connections
                    {
                        return self.connect_new(state, started);
                    }
                    // lost the race; take the front position back
                    state.pending.push_front(waiter.clone());
                    let pending_len = state.pending.len();
                    state.metrics.record_pending_level(pending_len);
                    drop(state);

                    slot = waiter.slot.lock();
                }
                WaiterSlot::Waiting | WaiterSlot::Cancelled => match waiter.deadline {
                    None => waiter.condvar.wait(&mut slot),
                    Some(deadline) => {
                        let timed_out = waiter.condvar.wait_until(&mut slot, deadline).timed_out();
                        if timed_out && matches!(&*slot, WaiterSlot::Waiting) {
                            *slot = WaiterSlot::Cancelled;
                            drop(slot);

                            let mut state = shared.state.lock();
                            state.pending.retain(|w| !Arc::ptr_eq(w, &waiter));
                            let pending_len = state.pending.len();
                            state.metrics.record_pending_level(pending_len);
                            state.metrics.unsuccessful_requests_timed_out += 1;
                            return Err(ErrorKind::TimedOutAcquiringConnection.into());
                        }
                        // a signal landed between the timeout and the
                        // re-lock; the next iteration consumes it
                    }
                },
            }
        }
    }

    /// Give a session back. Sessions inside a transaction block, closed by
    /// their holder, or past the allocation timeout are discarded instead of
    /// returning to the idle set.
    fn release(&self, conn: Connection) {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        let id = conn.id().to_owned();

        let Some(entry) = state.allocated.remove(&id) else {
            drop(state);
            plog!(
                LogLevel::Warning,
                &shared.name,
                "released session {id} is not allocated from this pool; closing it",
            );
            conn.close();
            return;
        };

        if entry.timed_out {
            state.metrics.allocated_connections_timed_out += 1;
            nudge_waiter(shared, &mut state);
            return;
        }

        if conn.is_closed() {
            state.metrics.allocated_connections_closed_by_requestor += 1;
            nudge_waiter(shared, &mut state);
            return;
        }

        let status = conn.transaction_status();
        if status != TransactionStatus::Idle {
            plog!(
                LogLevel::Warning,
                &shared.name,
                "session {id} released with transaction status {status:?}; closing it",
            );
            nudge_waiter(shared, &mut state);
            drop(state);
            conn.close();
            return;
        }

        if state.closed {
            drop(state);
            conn.close();
            return;
        }

        state.idle.push(id, IdleEntry { conn, released_at: Instant::now() });

        // the oldest waiter gets the oldest idle session
        while !state.pending.is_empty() && !state.idle.is_empty() {
            let waiter = state.pending.pop_front().expect("pending checked non-empty");
            let pending_len = state.pending.len();
            state.metrics.record_pending_level(pending_len);
            let mut slot = waiter.slot.lock();
            if !matches!(&*slot, WaiterSlot::Waiting) {
                continue;
            }
            let conn = take_idle(shared, &mut state).expect("idle checked non-empty");
            *slot = WaiterSlot::Ready(conn);
            waiter.condvar.notify_one();
        }
    }
}

impl Clone for Pool {
    fn clone(&self) -> Pool {
        self.shared.handles.fetch_add(1, Ordering::SeqCst);
        Pool { shared: self.shared.clone() }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        if self.shared.handles.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.close(false);
        }
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Pool")
            .field("name", &self.shared.name)
            .field("closed", &state.closed)
            .field("allocated", &state.allocated.len())
            .field("idle", &state.idle.len())
            .field("pending", &state.pending.len())
            .finish()
    }
}

/// Pop the earliest-released idle session and mark it allocated.
fn take_idle(shared: &PoolShared, state: &mut PoolState) -> Option<Connection> {
    let (id, entry) = state.idle.pop_lru()?;
    plog!(
        LogLevel::Finest,
        &shared.name,
        "reusing {id}, idle for {:?}",
        entry.released_at.elapsed(),
    );
    mark_allocated(shared, state, &entry.conn);
    Some(entry.conn)
}

fn mark_allocated(shared: &PoolShared, state: &mut PoolState, conn: &Connection) {
    let deadline = shared
        .pool_config
        .allocated_connection_timeout
        .map(|timeout| Instant::now() + timeout);
    state.allocated.insert(
        conn.id().to_owned(),
        AllocatedEntry { session: conn.shared.clone(), deadline, timed_out: false },
    );
    if deadline.is_some() {
        shared.timer.notify_all();
    }
}

/// After a capacity slot frees up without producing an idle session, wake the
/// oldest waiter so it can create a replacement itself.
fn nudge_waiter(shared: &PoolShared, state: &mut PoolState) {
    if state.allocated.len() + state.connecting >= shared.pool_config.max_connections {
        return;
    }
    while let Some(waiter) = state.pending.pop_front() {
        state.metrics.record_pending_level(state.pending.len());
        let mut slot = waiter.slot.lock();
        if matches!(&*slot, WaiterSlot::Waiting) {
            *slot = WaiterSlot::Retry;
            waiter.condvar.notify_one();
            return;
        }
    }
}

/// The pool's single background thread: force-closes sessions past their
/// allocation deadline and flushes metrics, sleeping by timed condvar waits.
fn timer_loop(shared: Weak<PoolShared>) {
    loop {
        let Some(shared) = shared.upgrade() else { return };
        let mut state = shared.state.lock();
        if state.closed {
            return;
        }

        let now = Instant::now();

        for entry in state.allocated.values_mut() {
            if !entry.timed_out && entry.deadline.is_some_and(|deadline| deadline <= now) {
                entry.timed_out = true;
                entry.session.control.abort();
                plog!(
                    LogLevel::Warning,
                    &shared.name,
                    "{} held past the allocated-connection timeout; force-closed",
                    entry.session.control.id(),
                );
            }
        }

        if let Some(flush_at) = state.next_flush {
            if now >= flush_at {
                let connections = state.allocated.len() + state.idle.len();
                let snapshot = state.metrics.snapshot(now_millis(), connections);
                if shared.pool_config.metrics_reset_when_logged {
                    let pending = state.pending.len();
                    state.metrics.reset(snapshot.period_end_millis, pending, connections);
                }
                state.next_flush = Some(now + shared.pool_config.metrics_logging_interval);
                drop(state);
                plog!(LogLevel::Info, &shared.name, "{snapshot}");
                continue;
            }
        }

        let mut wake = state.next_flush;
        for entry in state.allocated.values() {
            if entry.timed_out {
                continue;
            }
            if let Some(deadline) = entry.deadline {
                wake = Some(wake.map_or(deadline, |at| at.min(deadline)));
            }
        }

        match wake {
            Some(at) => {
                let _ = shared.timer.wait_until(&mut state, at);
            }
            None => shared.timer.wait(&mut state),
        }
    }
}

/// An acquired session; releases itself back to the pool on drop.
pub struct PoolConnection {
    pool: Pool,
    conn: Option<Connection>,
}

impl PoolConnection {
    fn new(pool: Pool, conn: Connection) -> PoolConnection {
        PoolConnection { pool, conn: Some(conn) }
    }

    /// The pool this session came from.
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// The underlying session.
    pub fn connection(&self) -> &Connection {
        // `conn` only `None` on drop
        self.conn.as_ref().expect("session present until drop")
    }
}

impl std::ops::Deref for PoolConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.connection()
    }
}

impl Drop for PoolConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

impl std::fmt::Debug for PoolConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolConnection")
            .field("pool", &self.pool.shared.name)
            .field("connection", &self.conn)
            .finish()
    }
}
