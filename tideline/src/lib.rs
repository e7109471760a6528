//! tideline: context-affine connection core.
//!
//! tideline provides the pieces a non-blocking network client or server is
//! built from: a single-assignment [`AsyncResult`] with ALL/ANY/JOIN
//! [`CompositeResult`] roll-ups, a [`Connection`] bound to the execution
//! [`Context`] that owns it, and a [`ConnectionManager`] that bounds
//! connections per endpoint and queues callers once the bound is reached.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use tideline::{
//!     ConfigBuilder, Connection, ConnectionManager, EndpointKey, EventLoopGroup, MemoryProvider,
//! };
//!
//! fn main() -> Result<(), tideline::Error> {
//!     let config = ConfigBuilder::new().threads(2).max_connections(4).build()?;
//!     let group = EventLoopGroup::new(&config.event_loop)?;
//!     let manager = ConnectionManager::<Connection>::new(
//!         Arc::new(MemoryProvider::new()),
//!         config.pool,
//!     );
//!
//!     let key = EndpointKey::new(false, 6379, "localhost");
//!     let waiter = manager.request(&key, group.next());
//!     waiter.result().on_complete(|res| match res {
//!         Ok(conn) => {
//!             let _ = conn.write_to_channel(bytes::Bytes::from_static(b"PING\r\n"));
//!         }
//!         Err(err) => eprintln!("connect failed: {err}"),
//!     });
//!
//!     manager.close();
//!     group.join()
//! }
//! ```

// ── Internal modules ────────────────────────────────────────────────────
pub(crate) mod channel;
pub(crate) mod connection;
pub(crate) mod counter;
pub(crate) mod runtime;
#[cfg(feature = "tls")]
pub(crate) mod tls;
pub(crate) mod worker;

// ── Public modules ──────────────────────────────────────────────────────
pub mod config;
pub mod error;
pub mod metrics;
pub mod pool;
pub mod transport;

// ── Re-exports: Results ─────────────────────────────────────────────────

/// Single-assignment completion cell.
pub use runtime::result::AsyncResult;
/// Future returned by [`AsyncResult::wait`].
pub use runtime::result::Wait;
/// ALL / ANY / JOIN roll-up over a set of [`AsyncResult`]s.
pub use runtime::composite::CompositeResult;

// ── Re-exports: Contexts ────────────────────────────────────────────────

/// Handle to an owning execution context.
pub use runtime::context::Context;
/// Process-unique context identifier.
pub use runtime::context::ContextId;
/// Fixed set of execution contexts.
pub use worker::EventLoopGroup;
/// Handle for stopping every context of a group.
pub use worker::ShutdownHandle;

// ── Re-exports: Connections ─────────────────────────────────────────────

/// Transport a [`Connection`] drives.
pub use channel::Channel;
/// Negotiated TLS session details.
pub use channel::SslInfo;
/// Channel bound to its owning context.
pub use connection::Connection;
/// Process-unique connection identifier.
pub use connection::ConnectionId;
/// Callback for [`Connection::send`].
pub use connection::WriteHandler;
/// Opaque per-connection metrics value.
pub use metrics::MetricHandle;
/// Network event sink.
pub use metrics::NetworkMetrics;
/// [`NetworkMetrics`] backed by the runtime's metriken counters.
pub use metrics::RuntimeMetrics;

// ── Re-exports: Pooling ─────────────────────────────────────────────────

/// Routes connection requests to per-endpoint pools.
pub use pool::ConnectionManager;
/// Identity of one physical destination.
pub use pool::EndpointKey;
/// Snapshot of one endpoint pool.
pub use pool::PoolStats;
/// Connection type the pool can manage.
pub use pool::Pooled;
/// Pending request for a connection.
pub use pool::Waiter;
/// Process-unique waiter identifier.
pub use pool::WaiterId;
/// Opens and closes pooled connections.
pub use transport::ConnectionProvider;
/// In-memory [`Channel`].
pub use transport::memory::MemoryChannel;
/// In-memory [`ConnectionProvider`].
pub use transport::memory::MemoryProvider;

// ── Re-exports: Shared types ────────────────────────────────────────────

/// Runtime configuration.
pub use config::Config;
/// Builder for [`Config`] with discoverable methods and `build()` validation.
pub use config::ConfigBuilder;
/// Execution context group configuration.
pub use config::EventLoopConfig;
/// Per-endpoint pool limits.
pub use config::PoolOptions;
/// Runtime errors.
pub use error::Error;

// ── Re-exports: TLS (feature-gated) ────────────────────────────────────

/// rustls session wrapper that captures [`SslInfo`].
#[cfg(feature = "tls")]
pub use tls::TlsSession;
