use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};

use crate::config::PoolOptions;
use crate::connection::ConnectionId;
use crate::error::Error;
use crate::metrics::{
    POOL_CONNECT_FAILURES, POOL_CONNECTIONS_CREATED, POOL_EVICTED, POOL_QUEUE_FULL,
    POOL_WAITERS_QUEUED, POOLS_ACTIVE, POOLS_CREATED, POOLS_RETIRED,
};
use crate::pool::manager::{PoolStats, Shared};
use crate::pool::queue::WaitQueue;
use crate::pool::{EndpointKey, Pooled, Waiter, WaiterId};
use crate::transport::ConnectionProvider;

struct PoolState<C> {
    /// Connections open or being opened. Includes `idle`.
    live: usize,
    idle: VecDeque<C>,
    waiters: WaitQueue<Waiter<C>>,
    /// Set once the pool has emptied; a retired pool accepts no requests.
    retired: bool,
}

/// Connections to one endpoint, bounded by `options.max_connections`.
pub(crate) struct Pool<C: Pooled> {
    key: EndpointKey,
    options: PoolOptions,
    provider: Arc<dyn ConnectionProvider<C>>,
    manager: Weak<Shared<C>>,
    state: Mutex<PoolState<C>>,
}

impl<C: Pooled> Pool<C> {
    pub(crate) fn new(
        key: EndpointKey,
        options: PoolOptions,
        provider: Arc<dyn ConnectionProvider<C>>,
        manager: Weak<Shared<C>>,
    ) -> Self {
        POOLS_CREATED.increment();
        POOLS_ACTIVE.increment();
        tracing::debug!(endpoint = %key, max = options.max_connections, "pool created");
        Pool {
            key,
            options,
            provider,
            manager,
            state: Mutex::new(PoolState {
                live: 0,
                idle: VecDeque::new(),
                waiters: WaitQueue::new(),
                retired: false,
            }),
        }
    }

    /// Hand `waiter` an idle connection, open a new one, or queue it.
    ///
    /// Returns `false` only if this pool is retired; the waiter is untouched
    /// and the caller must retry against a fresh pool.
    pub(crate) fn get_connection(self: &Arc<Self>, waiter: Waiter<C>) -> bool {
        let mut state = self.state.lock();
        if state.retired {
            return false;
        }
        if let Some(conn) = state.idle.pop_front() {
            drop(state);
            self.deliver(conn, waiter);
        } else if state.live < self.options.max_connections {
            state.live += 1;
            drop(state);
            self.connect(waiter);
        } else if self.options.admits_waiter(state.waiters.len()) {
            let id = waiter.id;
            match state.waiters.push_back(id, waiter) {
                Ok(()) => {
                    POOL_WAITERS_QUEUED.increment();
                    tracing::trace!(endpoint = %self.key, waiter = ?id, "waiter queued");
                }
                // The queued entry shares the result and will complete it.
                Err(_) => {
                    tracing::warn!(endpoint = %self.key, waiter = ?id, "waiter already queued");
                }
            }
        } else {
            drop(state);
            POOL_QUEUE_FULL.increment();
            waiter.fail(Error::QueueFull);
        }
        true
    }

    /// Take back a checked-out connection: the oldest waiter gets it,
    /// otherwise it goes idle.
    pub(crate) fn recycle(self: &Arc<Self>, conn: C) {
        let mut state = self.state.lock();
        // Checked under the pool lock: eviction unregisters before it takes
        // this lock, so a closed connection never reaches `idle`.
        let tracked = self
            .manager
            .upgrade()
            .is_some_and(|manager| manager.is_tracked(conn.id()));
        if !tracked {
            drop(state);
            tracing::trace!(
                endpoint = %self.key,
                conn = %conn.id(),
                "closed connection not recycled"
            );
            return;
        }
        if state.retired {
            drop(state);
            self.provider.close(&conn);
            return;
        }
        match state.waiters.pop_front() {
            Some(waiter) => {
                drop(state);
                self.deliver(conn, waiter);
            }
            None => state.idle.push_back(conn),
        }
    }

    /// Connection `id` closed. Called once per connection.
    pub(crate) fn connection_closed(self: &Arc<Self>, id: ConnectionId) {
        let mut state = self.state.lock();
        state.idle.retain(|c| c.id() != id);
        state.live = state.live.saturating_sub(1);
        POOL_EVICTED.increment();
        tracing::trace!(endpoint = %self.key, conn = %id, "connection evicted");
        if !state.retired
            && let Some(next) = state.waiters.pop_front()
        {
            state.live += 1;
            drop(state);
            self.connect(next);
            return;
        }
        self.retire_if_empty(state);
    }

    /// Drop a queued waiter. `false` if it was not queued here.
    pub(crate) fn cancel(&self, id: WaiterId) -> bool {
        self.state.lock().waiters.remove(id).is_some()
    }

    /// Retire the pool and fail every queued waiter with `PoolClosed`.
    pub(crate) fn close(&self) {
        let waiters = {
            let mut state = self.state.lock();
            state.idle.clear();
            if state.retired {
                return;
            }
            state.retired = true;
            state.waiters.drain()
        };
        POOLS_RETIRED.increment();
        POOLS_ACTIVE.decrement();
        for waiter in waiters {
            waiter.fail(Error::PoolClosed);
        }
    }

    pub(crate) fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            live: state.live,
            idle: state.idle.len(),
            waiting: state.waiters.len(),
        }
    }

    /// Open a connection for `waiter`. A slot must already be reserved.
    fn connect(self: &Arc<Self>, waiter: Waiter<C>) {
        let pool = Arc::clone(self);
        self.provider
            .connect(&self.key, &waiter.context)
            .on_complete(move |res| match res {
                Ok(conn) => pool.connected(conn.clone(), waiter),
                Err(err) => pool.connect_failed(err.clone(), waiter),
            });
    }

    fn connected(self: &Arc<Self>, conn: C, waiter: Waiter<C>) {
        POOL_CONNECTIONS_CREATED.increment();
        match self.manager.upgrade() {
            Some(manager) if manager.register(&conn, self) => self.deliver(conn, waiter),
            _ => {
                self.provider.close(&conn);
                waiter.fail(Error::PoolClosed);
            }
        }
    }

    /// Fail only `waiter`; the next queued waiter gets a fresh attempt.
    fn connect_failed(self: &Arc<Self>, err: Error, waiter: Waiter<C>) {
        POOL_CONNECT_FAILURES.increment();
        tracing::debug!(endpoint = %self.key, error = %err, "connect failed");
        waiter.fail(err);

        let mut state = self.state.lock();
        state.live = state.live.saturating_sub(1);
        if !state.retired
            && let Some(next) = state.waiters.pop_front()
        {
            state.live += 1;
            drop(state);
            self.connect(next);
            return;
        }
        self.retire_if_empty(state);
    }

    /// Complete `waiter` with `conn` on the connection's context. If the
    /// waiter was already completed elsewhere the connection is recycled.
    fn deliver(self: &Arc<Self>, conn: C, waiter: Waiter<C>) {
        let pool = Arc::clone(self);
        let context = conn.context().clone();
        context.execute(move || {
            if !waiter.result.try_complete(conn.clone()) {
                pool.release(conn);
            }
        });
    }

    fn release(&self, conn: C) {
        if let Some(manager) = self.manager.upgrade() {
            manager.recycle(conn);
        }
    }

    fn retire_if_empty(self: &Arc<Self>, mut state: MutexGuard<'_, PoolState<C>>) {
        if state.retired || state.live > 0 || !state.waiters.is_empty() {
            return;
        }
        state.retired = true;
        drop(state);
        POOLS_RETIRED.increment();
        POOLS_ACTIVE.decrement();
        tracing::debug!(endpoint = %self.key, "pool retired");
        if let Some(manager) = self.manager.upgrade() {
            manager.remove_pool(&self.key, self);
        }
    }
}
