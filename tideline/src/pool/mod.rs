//! Per-endpoint connection pooling.
//!
//! [`ConnectionManager`] maps each [`EndpointKey`] to a lazily created pool
//! that bounds live connections and queues [`Waiter`]s once the bound is
//! reached. A pool whose last connection and last waiter are gone is retired
//! and dropped from the map; the next request for that endpoint starts over.

pub(crate) mod endpoint;
pub mod manager;
pub(crate) mod queue;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::connection::ConnectionId;
use crate::error::Error;
use crate::runtime::context::Context;
use crate::runtime::result::AsyncResult;

pub use manager::{ConnectionManager, PoolStats};

/// Identity of one physical destination. Equal keys share a pool.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EndpointKey {
    pub secure: bool,
    pub port: u16,
    pub host: String,
}

impl EndpointKey {
    pub fn new(secure: bool, port: u16, host: impl Into<String>) -> Self {
        EndpointKey {
            secure,
            port,
            host: host.into(),
        }
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.secure { "tls" } else { "tcp" };
        write!(f, "{scheme}://{}:{}", self.host, self.port)
    }
}

/// A connection type the pool can manage.
pub trait Pooled: Clone + Send + Sync + 'static {
    fn id(&self) -> ConnectionId;

    /// Context that owns the connection. Assignments are delivered there.
    fn context(&self) -> &Context;

    /// Run `hook` once when the connection closes, or straight away if it
    /// already has.
    fn on_evict(&self, hook: Box<dyn FnOnce() + Send + 'static>);
}

static NEXT_WAITER: AtomicU64 = AtomicU64::new(1);

/// Process-unique waiter identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaiterId(u64);

/// A pending request for a connection.
///
/// The result completes with the assigned connection (on that connection's
/// context) or with the failure (on the requesting context).
pub struct Waiter<C> {
    id: WaiterId,
    context: Context,
    result: AsyncResult<C>,
}

impl<C> Clone for Waiter<C> {
    fn clone(&self) -> Self {
        Waiter {
            id: self.id,
            context: self.context.clone(),
            result: self.result.clone(),
        }
    }
}

impl<C: Send + Sync + 'static> Waiter<C> {
    pub fn new(context: Context) -> Self {
        Waiter {
            id: WaiterId(NEXT_WAITER.fetch_add(1, Ordering::Relaxed)),
            context,
            result: AsyncResult::pending(),
        }
    }

    pub fn id(&self) -> WaiterId {
        self.id
    }

    /// Context the request came from.
    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn result(&self) -> &AsyncResult<C> {
        &self.result
    }

    /// Fail the request on the requesting context.
    pub(crate) fn fail(self, err: Error) {
        let result = self.result;
        self.context.execute(move || {
            let _ = result.fail(err);
        });
    }
}

impl<C> fmt::Debug for Waiter<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Waiter")
            .field("id", &self.id)
            .field("context", &self.context)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn endpoint_keys_compare_by_value() {
        let a = EndpointKey::new(false, 80, "example.com");
        let b = EndpointKey::new(false, 80, "example.com".to_string());
        let c = EndpointKey::new(true, 80, "example.com");
        let set: HashSet<_> = [a.clone(), b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
        assert_eq!(a.to_string(), "tcp://example.com:80");
    }
}
