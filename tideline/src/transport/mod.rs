//! Connection establishment seam used by the pool.

pub mod memory;

use crate::pool::EndpointKey;
use crate::runtime::context::Context;
use crate::runtime::result::AsyncResult;

/// Opens and closes pooled connections. Opaque to the pool.
pub trait ConnectionProvider<C>: Send + Sync + 'static {
    /// Start connecting to `key`. The new connection is owned by `context`.
    fn connect(&self, key: &EndpointKey, context: &Context) -> AsyncResult<C>;

    fn close(&self, conn: &C);
}
