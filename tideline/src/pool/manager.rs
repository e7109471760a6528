use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;

use crate::config::PoolOptions;
use crate::connection::ConnectionId;
use crate::error::Error;
use crate::pool::endpoint::Pool;
use crate::pool::{EndpointKey, Pooled, Waiter, WaiterId};
use crate::runtime::context::Context;
use crate::transport::ConnectionProvider;

/// Attempts to find a live pool before giving up with `PoolUnavailable`.
///
/// A pool is only retired once it is empty, so losing this race repeatedly
/// needs another thread to drain and retire a fresh pool on every attempt.
const MAX_POOL_ATTEMPTS: usize = 8;

type OptionsFn = dyn Fn(&EndpointKey) -> PoolOptions + Send + Sync + 'static;

/// Snapshot of one endpoint pool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections open or being opened, idle ones included.
    pub live: usize,
    pub idle: usize,
    /// Queued waiters.
    pub waiting: usize,
}

struct Holder<C: Pooled> {
    conn: C,
    pool: Arc<Pool<C>>,
}

pub(crate) struct Shared<C: Pooled> {
    endpoint_map: DashMap<EndpointKey, Arc<Pool<C>>>,
    connection_map: DashMap<ConnectionId, Holder<C>>,
    provider: Arc<dyn ConnectionProvider<C>>,
    options: Arc<OptionsFn>,
    closed: AtomicBool,
}

impl<C: Pooled> Shared<C> {
    /// Track `conn` as belonging to `pool`. `false` once the manager is closed.
    pub(crate) fn register(self: &Arc<Self>, conn: &C, pool: &Arc<Pool<C>>) -> bool {
        let id = conn.id();
        self.connection_map.insert(
            id,
            Holder {
                conn: conn.clone(),
                pool: Arc::clone(pool),
            },
        );
        if self.closed.load(Ordering::Acquire) {
            self.connection_map.remove(&id);
            return false;
        }
        let shared = Arc::downgrade(self);
        conn.on_evict(Box::new(move || {
            if let Some(shared) = shared.upgrade() {
                shared.connection_closed(id);
            }
        }));
        true
    }

    /// Route a closed connection to its pool. Only the first call per
    /// connection reaches the pool.
    pub(crate) fn connection_closed(&self, id: ConnectionId) {
        if let Some((_, holder)) = self.connection_map.remove(&id) {
            holder.pool.connection_closed(id);
        }
    }

    /// Whether `id` is still registered, i.e. open and owned by a pool.
    pub(crate) fn is_tracked(&self, id: ConnectionId) -> bool {
        self.connection_map.contains_key(&id)
    }

    pub(crate) fn recycle(&self, conn: C) {
        let pool = match self.connection_map.get(&conn.id()) {
            Some(holder) => Arc::clone(&holder.pool),
            None => return,
        };
        pool.recycle(conn);
    }

    /// Drop the map entry for `key` if it still points at `pool`.
    pub(crate) fn remove_pool(&self, key: &EndpointKey, pool: &Arc<Pool<C>>) {
        self.endpoint_map
            .remove_if(key, |_, current| Arc::ptr_eq(current, pool));
    }
}

/// Routes connection requests to per-endpoint pools.
///
/// Cloning yields another handle to the same manager.
pub struct ConnectionManager<C: Pooled> {
    shared: Arc<Shared<C>>,
}

impl<C: Pooled> Clone for ConnectionManager<C> {
    fn clone(&self) -> Self {
        ConnectionManager {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: Pooled> ConnectionManager<C> {
    /// Manager applying `options` to every endpoint.
    pub fn new(provider: Arc<dyn ConnectionProvider<C>>, options: PoolOptions) -> Self {
        Self::with_options(provider, move |_| options)
    }

    /// Manager computing per-endpoint options with `options`.
    pub fn with_options<F>(provider: Arc<dyn ConnectionProvider<C>>, options: F) -> Self
    where
        F: Fn(&EndpointKey) -> PoolOptions + Send + Sync + 'static,
    {
        ConnectionManager {
            shared: Arc::new(Shared {
                endpoint_map: DashMap::new(),
                connection_map: DashMap::new(),
                provider,
                options: Arc::new(options),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Request a connection to `key` for `waiter`.
    ///
    /// The outcome arrives through `waiter.result()`.
    pub fn get_connection(&self, key: &EndpointKey, waiter: Waiter<C>) {
        self.route(key, waiter, MAX_POOL_ATTEMPTS);
    }

    /// Find a live pool for `key` within `attempts` tries, dropping retired
    /// entries on the way.
    fn route(&self, key: &EndpointKey, waiter: Waiter<C>, attempts: usize) {
        if self.shared.closed.load(Ordering::Acquire) {
            waiter.fail(Error::PoolClosed);
            return;
        }
        for _ in 0..attempts {
            let pool = match self.pool_for(key) {
                Ok(pool) => pool,
                Err(err) => {
                    waiter.fail(err);
                    return;
                }
            };
            if pool.get_connection(waiter.clone()) {
                return;
            }
            self.shared.remove_pool(key, &pool);
        }
        tracing::warn!(endpoint = %key, attempts, "no live pool for endpoint");
        waiter.fail(Error::PoolUnavailable);
    }

    /// Create a waiter on `context`, submit it and return it.
    pub fn request(&self, key: &EndpointKey, context: Context) -> Waiter<C> {
        let waiter = Waiter::new(context);
        self.get_connection(key, waiter.clone());
        waiter
    }

    /// Withdraw a queued waiter. Returns `false` if it is no longer queued.
    ///
    /// The waiter's result is left pending.
    pub fn cancel(&self, key: &EndpointKey, id: WaiterId) -> bool {
        let pool = match self.shared.endpoint_map.get(key) {
            Some(pool) => Arc::clone(pool.value()),
            None => return false,
        };
        pool.cancel(id)
    }

    /// Return a checked-out connection to its pool.
    pub fn recycle(&self, conn: C) {
        self.shared.recycle(conn);
    }

    /// Drop every pool, fail queued waiters and close tracked connections.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let pools: Vec<_> = self
            .shared
            .endpoint_map
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.shared.endpoint_map.clear();
        for pool in pools {
            pool.close();
        }

        let conns: Vec<C> = self
            .shared
            .connection_map
            .iter()
            .map(|entry| entry.conn.clone())
            .collect();
        self.shared.connection_map.clear();
        for conn in &conns {
            self.shared.provider.close(conn);
        }
        tracing::debug!(connections = conns.len(), "connection manager closed");
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Number of endpoint pools currently mapped.
    pub fn pool_count(&self) -> usize {
        self.shared.endpoint_map.len()
    }

    /// Number of connections tracked across all pools.
    pub fn connection_count(&self) -> usize {
        self.shared.connection_map.len()
    }

    pub fn stats(&self, key: &EndpointKey) -> Option<PoolStats> {
        let pool = Arc::clone(self.shared.endpoint_map.get(key)?.value());
        Some(pool.stats())
    }

    fn pool_for(&self, key: &EndpointKey) -> Result<Arc<Pool<C>>, Error> {
        if let Some(pool) = self.shared.endpoint_map.get(key) {
            return Ok(Arc::clone(pool.value()));
        }
        let options = (self.shared.options)(key);
        options.validate()?;
        let pool = self
            .shared
            .endpoint_map
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(Pool::new(
                    key.clone(),
                    options,
                    Arc::clone(&self.shared.provider),
                    Arc::downgrade(&self.shared),
                ))
            });
        Ok(Arc::clone(pool.value()))
    }
}
