use std::fmt;
use std::mem;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::channel::{Channel, SslInfo};
use crate::error::Error;
use crate::metrics::{self, MetricHandle, NetworkMetrics};
use crate::pool::Pooled;
use crate::runtime::context::Context;
use crate::runtime::result::AsyncResult;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

type ExceptionHandler = Arc<dyn Fn(&Error) + Send + Sync + 'static>;
type CloseHandler = Box<dyn FnOnce() + Send + 'static>;
type EvictHook = Box<dyn FnOnce() + Send + 'static>;
/// Callback for [`Connection::send`].
pub type WriteHandler = Box<dyn FnOnce(Result<(), Error>) + Send + 'static>;

/// How the writes batched during a read get flushed.
enum Flush {
    /// Nothing was queued.
    Idle,
    Inline,
    /// A write came from another thread; flush on the owning context.
    OnContext,
}

/// Per-connection state. Only mutated under `Inner::state`.
#[derive(Default)]
struct State {
    /// Inside a read callback (`start_read` .. `end_read_and_flush`).
    read: bool,
    /// Writes were queued without a flush.
    needs_flush: bool,
    /// A queued write came from off the owning context. Cleared at flush.
    needs_async_flush: bool,
    exception_handler: Option<ExceptionHandler>,
    close_handler: Option<CloseHandler>,
    evict_hook: Option<EvictHook>,
    metric: Option<MetricHandle>,
    close_result: Option<AsyncResult<()>>,
    closed: bool,
}

struct Inner {
    id: ConnectionId,
    channel: Arc<dyn Channel>,
    context: Context,
    metrics: Option<Arc<dyn NetworkMetrics>>,
    state: Mutex<State>,
}

/// A channel bound to the execution context that owns it.
///
/// Reads and handler callbacks happen on the owning context. Writes may come
/// from any thread: while a read callback is running they are queued and
/// flushed once at [`end_read_and_flush`](Self::end_read_and_flush), on the
/// owning context if any of them came from elsewhere.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    pub fn new(
        channel: Arc<dyn Channel>,
        context: Context,
        metrics: Option<Arc<dyn NetworkMetrics>>,
    ) -> Self {
        Connection {
            inner: Arc::new(Inner {
                id: ConnectionId(NEXT_ID.fetch_add(1, Ordering::Relaxed)),
                channel,
                context,
                metrics,
                state: Mutex::new(State::default()),
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn context(&self) -> &Context {
        &self.inner.context
    }

    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.inner.channel
    }

    // ── Reads and writes ─────────────────────────────────────────────

    /// Enter a read callback. Writes are batched until
    /// [`end_read_and_flush`](Self::end_read_and_flush).
    pub fn start_read(&self) -> Result<(), Error> {
        self.inner.context.check()?;
        self.inner.state.lock().read = true;
        Ok(())
    }

    /// Leave the read callback and flush whatever was queued during it.
    pub fn end_read_and_flush(&self) {
        match self.take_flush() {
            Flush::Idle => {}
            Flush::Inline => self.inner.channel.flush(),
            Flush::OnContext => {
                let channel = Arc::clone(&self.inner.channel);
                if !self.inner.context.run_on_context(move || channel.flush()) {
                    self.inner.channel.flush();
                }
            }
        }
    }

    /// Clear the read flag and decide how the pending batch gets flushed.
    fn take_flush(&self) -> Flush {
        let mut state = self.inner.state.lock();
        state.read = false;
        if !mem::take(&mut state.needs_flush) {
            Flush::Idle
        } else if mem::take(&mut state.needs_async_flush) {
            Flush::OnContext
        } else {
            Flush::Inline
        }
    }

    /// Buffer `msg` on the channel without flushing.
    pub fn queue_for_write(&self, msg: Bytes) -> AsyncResult<()> {
        let mut state = self.inner.state.lock();
        self.queue_locked(&mut state, msg)
    }

    fn queue_locked(&self, state: &mut State, msg: Bytes) -> AsyncResult<()> {
        let res = self.inner.channel.write(msg);
        state.needs_flush = true;
        if !self.inner.context.is_current() {
            state.needs_async_flush = true;
        }
        res
    }

    /// Write `msg`, batching it if a read is in progress and flushing
    /// straight away otherwise.
    pub fn write_to_channel(&self, msg: Bytes) -> AsyncResult<()> {
        let res = {
            let mut state = self.inner.state.lock();
            if state.read {
                return self.queue_locked(&mut state, msg);
            }
            self.inner.channel.write(msg)
        };
        self.inner.channel.flush();
        res
    }

    /// Write `msg` and hand the outcome to `handler` on the owning context.
    ///
    /// Without a handler a failed write goes to the exception handler.
    pub fn send(&self, msg: Bytes, handler: Option<WriteHandler>) {
        let conn = self.clone();
        self.write_to_channel(msg).on_complete(move |res| {
            let res = res.map(|_| ()).map_err(Clone::clone);
            let ctx = conn.inner.context.clone();
            ctx.execute(move || match (handler, res) {
                (Some(handler), res) => handler(res),
                (None, Err(err)) => conn.handle_exception(err),
                (None, Ok(())) => {}
            });
        });
    }

    // ── Backpressure ─────────────────────────────────────────────────

    pub fn is_not_writable(&self) -> bool {
        !self.inner.channel.is_writable()
    }

    /// Stop reading from the channel.
    pub fn do_pause(&self) {
        self.inner.channel.set_auto_read(false);
    }

    pub fn do_resume(&self) {
        self.inner.channel.set_auto_read(true);
    }

    /// Set the high water mark to `size` and the low water mark to `size / 2`.
    pub fn do_set_write_queue_max_size(&self, size: usize) -> Result<(), Error> {
        let channel = &self.inner.channel;
        let (high, low) = (size, size / 2);
        // Order the updates so low <= high holds after each one.
        if low > channel.write_buffer_high_water_mark() {
            channel.set_write_buffer_high_water_mark(high)?;
            channel.set_write_buffer_low_water_mark(low)
        } else {
            channel.set_write_buffer_low_water_mark(low)?;
            channel.set_write_buffer_high_water_mark(high)
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Flush queued writes and close the channel.
    ///
    /// Every call returns the same result; only the first closes.
    pub fn close(&self) -> AsyncResult<()> {
        let result = {
            let mut state = self.inner.state.lock();
            if let Some(existing) = &state.close_result {
                return existing.clone();
            }
            let result = AsyncResult::pending();
            state.close_result = Some(result.clone());
            result
        };
        match self.take_flush() {
            Flush::Idle => {}
            Flush::Inline => self.inner.channel.flush(),
            Flush::OnContext => {
                // The close queues behind the flush so the batch goes out first.
                let conn = self.clone();
                let out = result.clone();
                let scheduled = self.inner.context.run_on_context(move || {
                    conn.inner.channel.flush();
                    conn.close_channel(out);
                });
                if scheduled {
                    return result;
                }
                self.inner.channel.flush();
            }
        }
        self.close_channel(result.clone());
        result
    }

    fn close_channel(&self, out: AsyncResult<()>) {
        let conn = self.clone();
        self.inner.channel.close().on_complete(move |res| {
            conn.handle_closed();
            out.completer()(res);
        });
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Report `err` to metrics and then to the exception handler, or log it.
    pub fn handle_exception(&self, err: Error) {
        let (metric, handler) = {
            let state = self.inner.state.lock();
            (state.metric.clone(), state.exception_handler.clone())
        };
        if let Some(sink) = &self.inner.metrics {
            let remote = self.remote_address();
            metrics::report("exception_occurred", || {
                sink.exception_occurred(metric.as_ref(), remote, &err)
            });
        }
        match handler {
            Some(handler) => handler(&err),
            None => tracing::error!(conn = %self.inner.id, error = %err, "unhandled exception"),
        }
    }

    /// The channel closed. Runs once however often it is called.
    pub fn handle_closed(&self) {
        let (metric, evict, close_handler) = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            (
                state.metric.clone(),
                state.evict_hook.take(),
                state.close_handler.take(),
            )
        };
        if let Some(sink) = &self.inner.metrics {
            let remote = self.remote_address();
            metrics::report("disconnected", || sink.disconnected(metric.as_ref(), remote));
        }
        if let Some(evict) = evict {
            evict();
        }
        if let Some(handler) = close_handler {
            self.inner.context.execute(handler);
        }
        tracing::trace!(conn = %self.inner.id, "connection closed");
    }

    pub fn exception_handler<F>(&self, handler: F)
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.inner.state.lock().exception_handler = Some(Arc::new(handler));
    }

    pub fn close_handler<F>(&self, handler: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.state.lock().close_handler = Some(Box::new(handler));
    }

    // ── Metrics ──────────────────────────────────────────────────────

    pub fn set_metric(&self, metric: MetricHandle) {
        self.inner.state.lock().metric = Some(metric);
    }

    pub fn metric(&self) -> Option<MetricHandle> {
        self.inner.state.lock().metric.clone()
    }

    pub fn report_bytes_read(&self, n: u64) {
        if let Some(sink) = &self.inner.metrics {
            let metric = self.metric();
            let remote = self.remote_address();
            metrics::report("bytes_read", || sink.bytes_read(metric.as_ref(), remote, n));
        }
    }

    pub fn report_bytes_written(&self, n: u64) {
        if let Some(sink) = &self.inner.metrics {
            let metric = self.metric();
            let remote = self.remote_address();
            metrics::report("bytes_written", || {
                sink.bytes_written(metric.as_ref(), remote, n)
            });
        }
    }

    // ── Addresses and TLS ────────────────────────────────────────────

    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.inner.channel.remote_address()
    }

    pub fn local_address(&self) -> Option<SocketAddr> {
        self.inner.channel.local_address()
    }

    /// Host string of the remote address.
    pub fn remote_name(&self) -> Option<String> {
        self.remote_address().map(|addr| addr.ip().to_string())
    }

    pub fn is_ssl(&self) -> bool {
        self.inner.channel.ssl_info().is_some()
    }

    pub fn ssl_session(&self) -> Option<SslInfo> {
        self.inner.channel.ssl_info()
    }

    /// The verified peer chain, leaf first.
    pub fn peer_certificate_chain(&self) -> Result<Vec<Bytes>, Error> {
        self.inner
            .channel
            .ssl_info()
            .and_then(|info| info.peer_certificates)
            .ok_or(Error::PeerUnverified)
    }

    /// SNI name the client sent, if this is a TLS server connection.
    pub fn indicated_server_name(&self) -> Option<String> {
        self.inner.channel.ssl_info().and_then(|info| info.server_name)
    }
}

impl Pooled for Connection {
    fn id(&self) -> ConnectionId {
        Connection::id(self)
    }

    fn context(&self) -> &Context {
        Connection::context(self)
    }

    fn on_evict(&self, hook: Box<dyn FnOnce() + Send + 'static>) {
        let mut state = self.inner.state.lock();
        if state.closed {
            drop(state);
            hook();
        } else {
            state.evict_hook = Some(hook);
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("context", &self.inner.context)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EventLoopConfig;
    use crate::transport::memory::MemoryChannel;
    use crate::worker::EventLoopGroup;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn group() -> EventLoopGroup {
        EventLoopGroup::new(&EventLoopConfig {
            threads: 1,
            thread_name: "conn-test".to_string(),
        })
        .unwrap()
    }

    fn connection(group: &EventLoopGroup) -> (Connection, Arc<MemoryChannel>) {
        let channel = Arc::new(MemoryChannel::new());
        let conn = Connection::new(channel.clone(), group.next(), None);
        (conn, channel)
    }

    /// Run `f` on the connection's context and wait for it.
    fn on_context<R: Send + 'static>(
        conn: &Connection,
        f: impl FnOnce(&Connection) -> R + Send + 'static,
    ) -> R {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let c = conn.clone();
        conn.context().run_on_context(move || {
            let _ = tx.send(f(&c));
        });
        rx.recv_timeout(TIMEOUT).unwrap()
    }

    #[test]
    fn start_read_requires_owning_context() {
        let g = group();
        let (conn, _channel) = connection(&g);
        assert!(matches!(conn.start_read(), Err(Error::WrongContext)));
        assert!(on_context(&conn, |c| c.start_read().is_ok()));
        g.join().unwrap();
    }

    #[test]
    fn writes_during_read_flush_once() {
        let g = group();
        let (conn, channel) = connection(&g);
        let flushes = on_context(&conn, |c| {
            c.start_read().unwrap();
            let _ = c.write_to_channel(Bytes::from_static(b"a"));
            let _ = c.write_to_channel(Bytes::from_static(b"b"));
            c.end_read_and_flush();
            c.channel().is_writable()
        });
        assert!(flushes);
        assert_eq!(channel.flush_count(), 1);
        assert_eq!(
            channel.drain(),
            vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]
        );
        g.join().unwrap();
    }

    #[test]
    fn write_outside_read_flushes_immediately() {
        let g = group();
        let (conn, channel) = connection(&g);
        let res = conn.write_to_channel(Bytes::from_static(b"x"));
        assert!(res.is_succeeded());
        assert_eq!(channel.flush_count(), 1);
        g.join().unwrap();
    }

    #[test]
    fn water_marks_never_invert() {
        let g = group();
        let (conn, channel) = connection(&g);
        conn.do_set_write_queue_max_size(1_000_000).unwrap();
        assert_eq!(channel.write_buffer_high_water_mark(), 1_000_000);
        assert_eq!(channel.write_buffer_low_water_mark(), 500_000);
        conn.do_set_write_queue_max_size(10).unwrap();
        assert_eq!(channel.write_buffer_high_water_mark(), 10);
        assert_eq!(channel.write_buffer_low_water_mark(), 5);
        g.join().unwrap();
    }

    #[test]
    fn pause_and_resume_toggle_auto_read() {
        let g = group();
        let (conn, channel) = connection(&g);
        conn.do_pause();
        assert!(!channel.is_auto_read());
        conn.do_resume();
        assert!(channel.is_auto_read());
        g.join().unwrap();
    }

    #[test]
    fn backpressure_follows_channel() {
        let g = group();
        let (conn, _channel) = connection(&g);
        conn.do_set_write_queue_max_size(4).unwrap();
        on_context(&conn, |c| {
            c.start_read().unwrap();
            let _ = c.write_to_channel(Bytes::from_static(b"0123456789"));
        });
        assert!(conn.is_not_writable());
        on_context(&conn, |c| c.end_read_and_flush());
        assert!(!conn.is_not_writable());
        g.join().unwrap();
    }

    #[test]
    fn send_without_handler_reports_failure() {
        let g = group();
        let (conn, channel) = connection(&g);
        let (tx, rx) = crossbeam_channel::unbounded();
        conn.exception_handler(move |err| {
            let _ = tx.send(err.to_string());
        });
        channel.close();
        conn.send(Bytes::from_static(b"late"), None);
        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), "connection closed");
        g.join().unwrap();
    }

    #[test]
    fn send_delivers_outcome_on_context() {
        let g = group();
        let (conn, _channel) = connection(&g);
        let (tx, rx) = crossbeam_channel::unbounded();
        let ctx = conn.context().clone();
        conn.send(
            Bytes::from_static(b"hi"),
            Some(Box::new(move |res| {
                let _ = tx.send((res.is_ok(), ctx.is_current()));
            })),
        );
        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), (true, true));
        g.join().unwrap();
    }

    #[test]
    fn close_is_idempotent() {
        let g = group();
        let (conn, channel) = connection(&g);
        let closes = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&closes);
        let (tx, rx) = crossbeam_channel::unbounded();
        conn.close_handler(move || {
            c.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(());
        });
        let first = conn.close();
        let second = conn.close();
        conn.handle_closed();
        rx.recv_timeout(TIMEOUT).unwrap();
        assert!(first.is_succeeded());
        assert!(second.is_succeeded());
        assert!(!channel.is_open());
        assert!(conn.is_closed());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        g.join().unwrap();
    }

    #[test]
    fn close_flushes_queued_writes() {
        let g = group();
        let (conn, channel) = connection(&g);
        on_context(&conn, |c| {
            c.start_read().unwrap();
            let _ = c.write_to_channel(Bytes::from_static(b"bye"));
        });
        let _ = conn.close();
        assert_eq!(channel.drain(), vec![Bytes::from_static(b"bye")]);
        g.join().unwrap();
    }

    #[test]
    fn unverified_peer() {
        let g = group();
        let (conn, _channel) = connection(&g);
        assert!(!conn.is_ssl());
        assert!(matches!(
            conn.peer_certificate_chain(),
            Err(Error::PeerUnverified)
        ));
        g.join().unwrap();
    }

    #[test]
    fn ssl_views_come_from_channel() {
        let g = group();
        let channel = Arc::new(MemoryChannel::new().with_ssl(SslInfo {
            server_name: Some("example.com".to_string()),
            peer_certificates: Some(vec![Bytes::from_static(b"leaf")]),
            ..SslInfo::default()
        }));
        let conn = Connection::new(channel, g.next(), None);
        assert!(conn.is_ssl());
        assert_eq!(conn.indicated_server_name().as_deref(), Some("example.com"));
        assert_eq!(conn.peer_certificate_chain().unwrap().len(), 1);
        g.join().unwrap();
    }

    #[test]
    fn metrics_see_exceptions_and_disconnect() {
        #[derive(Default)]
        struct Recorder {
            exceptions: AtomicUsize,
            disconnects: AtomicUsize,
            bytes: AtomicUsize,
        }
        impl NetworkMetrics for Recorder {
            fn bytes_read(&self, metric: Option<&MetricHandle>, _: Option<SocketAddr>, n: u64) {
                assert_eq!(metric.and_then(|m| m.downcast_ref::<&str>()), Some(&"tag"));
                self.bytes.fetch_add(n as usize, Ordering::SeqCst);
            }
            fn exception_occurred(&self, _: Option<&MetricHandle>, _: Option<SocketAddr>, _: &Error) {
                self.exceptions.fetch_add(1, Ordering::SeqCst);
            }
            fn disconnected(&self, _: Option<&MetricHandle>, _: Option<SocketAddr>) {
                self.disconnects.fetch_add(1, Ordering::SeqCst);
            }
        }

        let g = group();
        let sink = Arc::new(Recorder::default());
        let conn = Connection::new(
            Arc::new(MemoryChannel::new()),
            g.next(),
            Some(sink.clone() as Arc<dyn NetworkMetrics>),
        );
        conn.set_metric(MetricHandle::new("tag"));
        conn.report_bytes_read(12);
        conn.handle_exception(Error::ConnectionClosed);
        conn.handle_closed();
        conn.handle_closed();
        assert_eq!(sink.bytes.load(Ordering::SeqCst), 12);
        assert_eq!(sink.exceptions.load(Ordering::SeqCst), 1);
        assert_eq!(sink.disconnects.load(Ordering::SeqCst), 1);
        g.join().unwrap();
    }
}
