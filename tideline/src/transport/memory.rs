//! In-process transport.
//!
//! [`MemoryChannel`] records what a connection writes and flushes instead of
//! touching a socket. [`MemoryProvider`] hands out connections over such
//! channels and can be told to fail or hold back connect attempts.

use std::collections::VecDeque;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, ThreadId};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::channel::{Channel, SslInfo};
use crate::connection::Connection;
use crate::error::Error;
use crate::metrics::NetworkMetrics;
use crate::pool::EndpointKey;
use crate::runtime::context::Context;
use crate::runtime::result::AsyncResult;
use crate::transport::ConnectionProvider;

const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024;
const DEFAULT_LOW_WATER_MARK: usize = 32 * 1024;

struct ChannelState {
    pending: Vec<(Bytes, AsyncResult<()>)>,
    buffered: usize,
    flushed: Vec<Bytes>,
    flush_threads: Vec<ThreadId>,
    high: usize,
    low: usize,
    writable: bool,
    auto_read: bool,
    open: bool,
}

/// A [`Channel`] that keeps written data in memory.
pub struct MemoryChannel {
    state: Mutex<ChannelState>,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
    ssl: Option<SslInfo>,
}

impl Default for MemoryChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryChannel {
    pub fn new() -> Self {
        MemoryChannel {
            state: Mutex::new(ChannelState {
                pending: Vec::new(),
                buffered: 0,
                flushed: Vec::new(),
                flush_threads: Vec::new(),
                high: DEFAULT_HIGH_WATER_MARK,
                low: DEFAULT_LOW_WATER_MARK,
                writable: true,
                auto_read: true,
                open: true,
            }),
            local: None,
            remote: None,
            ssl: None,
        }
    }

    pub fn with_addresses(mut self, local: SocketAddr, remote: SocketAddr) -> Self {
        self.local = Some(local);
        self.remote = Some(remote);
        self
    }

    /// Present the channel as a TLS session.
    pub fn with_ssl(mut self, info: SslInfo) -> Self {
        self.ssl = Some(info);
        self
    }

    /// Take everything flushed so far.
    pub fn drain(&self) -> Vec<Bytes> {
        std::mem::take(&mut self.state.lock().flushed)
    }

    /// Number of messages written but not yet flushed.
    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Number of flushes that pushed at least one message.
    pub fn flush_count(&self) -> usize {
        self.state.lock().flush_threads.len()
    }

    /// Thread that performed each non-empty flush, in order.
    pub fn flush_threads(&self) -> Vec<ThreadId> {
        self.state.lock().flush_threads.clone()
    }

    pub fn write_buffer_low_water_mark(&self) -> usize {
        self.state.lock().low
    }
}

impl Channel for MemoryChannel {
    fn write(&self, msg: Bytes) -> AsyncResult<()> {
        let mut state = self.state.lock();
        if !state.open {
            return AsyncResult::failed(Error::ConnectionClosed);
        }
        let res = AsyncResult::pending();
        state.buffered += msg.len();
        state.pending.push((msg, res.clone()));
        if state.buffered > state.high {
            state.writable = false;
        }
        res
    }

    fn flush(&self) {
        let completed = {
            let mut state = self.state.lock();
            if state.pending.is_empty() {
                return;
            }
            let pending = std::mem::take(&mut state.pending);
            state.buffered = 0;
            state.writable = true;
            state.flush_threads.push(thread::current().id());
            let mut results = Vec::with_capacity(pending.len());
            for (msg, res) in pending {
                state.flushed.push(msg);
                results.push(res);
            }
            results
        };
        for res in completed {
            let _ = res.complete(());
        }
    }

    fn is_writable(&self) -> bool {
        self.state.lock().writable
    }

    fn set_auto_read(&self, auto_read: bool) {
        self.state.lock().auto_read = auto_read;
    }

    fn is_auto_read(&self) -> bool {
        self.state.lock().auto_read
    }

    fn write_buffer_high_water_mark(&self) -> usize {
        self.state.lock().high
    }

    fn set_write_buffer_high_water_mark(&self, high: usize) -> Result<(), Error> {
        let mut state = self.state.lock();
        if high < state.low {
            return Err(Error::InvalidWaterMark {
                low: state.low,
                high,
            });
        }
        state.high = high;
        state.writable = state.buffered <= high;
        Ok(())
    }

    fn set_write_buffer_low_water_mark(&self, low: usize) -> Result<(), Error> {
        let mut state = self.state.lock();
        if low > state.high {
            return Err(Error::InvalidWaterMark {
                low,
                high: state.high,
            });
        }
        state.low = low;
        Ok(())
    }

    fn close(&self) -> AsyncResult<()> {
        let dropped = {
            let mut state = self.state.lock();
            state.open = false;
            state.buffered = 0;
            std::mem::take(&mut state.pending)
        };
        for (_, res) in dropped {
            let _ = res.fail(Error::ConnectionClosed);
        }
        AsyncResult::succeeded(())
    }

    fn is_open(&self) -> bool {
        self.state.lock().open
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        self.remote
    }

    fn local_address(&self) -> Option<SocketAddr> {
        self.local
    }

    fn ssl_info(&self) -> Option<SslInfo> {
        self.ssl.clone()
    }
}

struct HeldConnect {
    key: EndpointKey,
    context: Context,
    result: AsyncResult<Connection>,
}

/// [`ConnectionProvider`] backed by [`MemoryChannel`]s.
///
/// By default each connect succeeds asynchronously on the requesting context.
/// [`fail_next`](Self::fail_next) makes upcoming attempts fail, and
/// [`hold`](Self::hold) parks attempts until [`release`](Self::release) or
/// [`refuse`](Self::refuse) is called.
#[derive(Default)]
pub struct MemoryProvider {
    metrics: Option<Arc<dyn NetworkMetrics>>,
    attempts: AtomicUsize,
    fail_next: AtomicUsize,
    hold: AtomicBool,
    held: Mutex<VecDeque<HeldConnect>>,
    channels: Mutex<Vec<(Connection, Arc<MemoryChannel>)>>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `metrics` to every connection created from now on.
    pub fn with_metrics(mut self, metrics: Arc<dyn NetworkMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Fail the next `n` connect attempts.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Park connect attempts instead of completing them.
    pub fn hold(&self, hold: bool) {
        self.hold.store(hold, Ordering::SeqCst);
    }

    /// Number of parked connect attempts.
    pub fn held(&self) -> usize {
        self.held.lock().len()
    }

    /// Complete the oldest parked attempt. Returns `false` if none is parked.
    pub fn release(&self) -> bool {
        let Some(held) = self.held.lock().pop_front() else {
            return false;
        };
        self.establish(&held.key, &held.context, held.result);
        true
    }

    /// Fail the oldest parked attempt. Returns `false` if none is parked.
    pub fn refuse(&self) -> bool {
        let Some(held) = self.held.lock().pop_front() else {
            return false;
        };
        Self::refuse_on(&held.context, held.result);
        true
    }

    /// Total connect attempts seen.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Channel behind `conn`, if this provider created it.
    pub fn channel(&self, conn: &Connection) -> Option<Arc<MemoryChannel>> {
        self.channels
            .lock()
            .iter()
            .find(|(c, _)| c.id() == conn.id())
            .map(|(_, ch)| Arc::clone(ch))
    }

    /// Connections created by this provider that are still tracked.
    ///
    /// Entries go away when the provider closes the connection, and closed
    /// channels are pruned whenever a new connection is made.
    pub fn connections(&self) -> Vec<Connection> {
        self.channels.lock().iter().map(|(c, _)| c.clone()).collect()
    }

    fn establish(&self, key: &EndpointKey, context: &Context, result: AsyncResult<Connection>) {
        let remote = SocketAddr::from((Ipv4Addr::LOCALHOST, key.port));
        let local = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
        let mut channel = MemoryChannel::new().with_addresses(local, remote);
        if key.secure {
            channel = channel.with_ssl(SslInfo {
                server_name: Some(key.host.clone()),
                ..SslInfo::default()
            });
        }
        let channel = Arc::new(channel);
        let conn = Connection::new(channel.clone(), context.clone(), self.metrics.clone());
        {
            let mut channels = self.channels.lock();
            channels.retain(|(_, ch)| ch.is_open());
            channels.push((conn.clone(), channel));
        }
        context.run_on_context(move || {
            let _ = result.complete(conn);
        });
    }

    fn refuse_on(context: &Context, result: AsyncResult<Connection>) {
        context.run_on_context(move || {
            let _ = result.fail(Error::connect(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "connection refused",
            )));
        });
    }
}

impl ConnectionProvider<Connection> for MemoryProvider {
    fn connect(&self, key: &EndpointKey, context: &Context) -> AsyncResult<Connection> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let result = AsyncResult::pending();
        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            Self::refuse_on(context, result.clone());
        } else if self.hold.load(Ordering::SeqCst) {
            self.held.lock().push_back(HeldConnect {
                key: key.clone(),
                context: context.clone(),
                result: result.clone(),
            });
        } else {
            self.establish(key, context, result.clone());
        }
        result
    }

    fn close(&self, conn: &Connection) {
        self.channels.lock().retain(|(c, _)| c.id() != conn.id());
        let _ = conn.close();
    }
}
