//! tideline runtime metrics.
//!
//! [`NetworkMetrics`] is the per-connection sink a caller may attach; the
//! built-in [`RuntimeMetrics`] sink and the pool record into per-context
//! sharded counters registered with metriken.

use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::counter::{Counter, CounterGroup};
use crate::error::Error;
use metriken::{Gauge, metric};

/// Opaque per-connection value handed back to a [`NetworkMetrics`] sink.
#[derive(Clone)]
pub struct MetricHandle(Arc<dyn Any + Send + Sync>);

impl MetricHandle {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        MetricHandle(Arc::new(value))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }
}

impl fmt::Debug for MetricHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MetricHandle(..)")
    }
}

/// Network event sink. Every method defaults to a no-op.
pub trait NetworkMetrics: Send + Sync + 'static {
    fn bytes_read(&self, _metric: Option<&MetricHandle>, _remote: Option<SocketAddr>, _n: u64) {}

    fn bytes_written(&self, _metric: Option<&MetricHandle>, _remote: Option<SocketAddr>, _n: u64) {
    }

    fn exception_occurred(
        &self,
        _metric: Option<&MetricHandle>,
        _remote: Option<SocketAddr>,
        _err: &Error,
    ) {
    }

    fn disconnected(&self, _metric: Option<&MetricHandle>, _remote: Option<SocketAddr>) {}
}

/// Run a sink call, logging rather than propagating a panic from it.
pub(crate) fn report(what: &'static str, f: impl FnOnce()) {
    if panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
        tracing::warn!(event = what, "metrics sink panicked");
    }
}

/// [`NetworkMetrics`] backed by the process-wide counters below.
#[derive(Clone, Copy, Debug, Default)]
pub struct RuntimeMetrics;

impl NetworkMetrics for RuntimeMetrics {
    fn bytes_read(&self, _metric: Option<&MetricHandle>, _remote: Option<SocketAddr>, n: u64) {
        BYTES_READ.add(n);
    }

    fn bytes_written(&self, _metric: Option<&MetricHandle>, _remote: Option<SocketAddr>, n: u64) {
        BYTES_WRITTEN.add(n);
    }

    fn exception_occurred(
        &self,
        _metric: Option<&MetricHandle>,
        _remote: Option<SocketAddr>,
        _err: &Error,
    ) {
        CONNECTION_EXCEPTIONS.increment();
    }

    fn disconnected(&self, _metric: Option<&MetricHandle>, _remote: Option<SocketAddr>) {
        CONNECTIONS_DISCONNECTED.increment();
    }
}

// Counter groups (sharded storage, one shard per context).
static CONN: CounterGroup = CounterGroup::new();
static POOL: CounterGroup = CounterGroup::new();

/// Counter slot indices for connection metrics.
pub mod conn {
    pub const BYTES_READ: usize = 0;
    pub const BYTES_WRITTEN: usize = 1;
    pub const EXCEPTIONS: usize = 2;
    pub const DISCONNECTED: usize = 3;
}

/// Counter slot indices for pool metrics.
pub mod pool {
    pub const CONNECTIONS_CREATED: usize = 0;
    pub const CONNECT_FAILURES: usize = 1;
    pub const WAITERS_QUEUED: usize = 2;
    pub const QUEUE_FULL: usize = 3;
    pub const EVICTED: usize = 4;
    pub const POOLS_CREATED: usize = 5;
    pub const POOLS_RETIRED: usize = 6;
}

// ── Connections ──────────────────────────────────────────────────

#[metric(name = "tideline/bytes/read", description = "Total bytes read")]
pub static BYTES_READ: Counter = Counter::new(&CONN, conn::BYTES_READ);

#[metric(name = "tideline/bytes/written", description = "Total bytes written")]
pub static BYTES_WRITTEN: Counter = Counter::new(&CONN, conn::BYTES_WRITTEN);

#[metric(
    name = "tideline/connections/exceptions",
    description = "Exceptions raised on connections"
)]
pub static CONNECTION_EXCEPTIONS: Counter = Counter::new(&CONN, conn::EXCEPTIONS);

#[metric(
    name = "tideline/connections/disconnected",
    description = "Connections closed"
)]
pub static CONNECTIONS_DISCONNECTED: Counter = Counter::new(&CONN, conn::DISCONNECTED);

// ── Pools ────────────────────────────────────────────────────────

#[metric(
    name = "tideline/pool/connections_created",
    description = "Pooled connections established"
)]
pub static POOL_CONNECTIONS_CREATED: Counter = Counter::new(&POOL, pool::CONNECTIONS_CREATED);

#[metric(
    name = "tideline/pool/connect_failures",
    description = "Pooled connection attempts that failed"
)]
pub static POOL_CONNECT_FAILURES: Counter = Counter::new(&POOL, pool::CONNECT_FAILURES);

#[metric(
    name = "tideline/pool/waiters_queued",
    description = "Waiters queued because an endpoint was at its connection limit"
)]
pub static POOL_WAITERS_QUEUED: Counter = Counter::new(&POOL, pool::WAITERS_QUEUED);

#[metric(
    name = "tideline/pool/queue_full",
    description = "Waiters rejected by the wait queue limit"
)]
pub static POOL_QUEUE_FULL: Counter = Counter::new(&POOL, pool::QUEUE_FULL);

#[metric(
    name = "tideline/pool/evicted",
    description = "Pooled connections removed after closing"
)]
pub static POOL_EVICTED: Counter = Counter::new(&POOL, pool::EVICTED);

#[metric(name = "tideline/pool/created", description = "Endpoint pools created")]
pub static POOLS_CREATED: Counter = Counter::new(&POOL, pool::POOLS_CREATED);

#[metric(name = "tideline/pool/retired", description = "Endpoint pools retired")]
pub static POOLS_RETIRED: Counter = Counter::new(&POOL, pool::POOLS_RETIRED);

#[metric(name = "tideline/pool/active", description = "Endpoint pools alive")]
pub static POOLS_ACTIVE: Gauge = Gauge::new();
