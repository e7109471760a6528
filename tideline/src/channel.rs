use std::net::SocketAddr;

use bytes::Bytes;

use crate::error::Error;
use crate::runtime::result::AsyncResult;

/// Information about a negotiated TLS session.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SslInfo {
    pub protocol_version: Option<String>,
    pub cipher_suite: Option<String>,
    pub alpn_protocol: Option<Vec<u8>>,
    /// SNI host name the client indicated.
    pub server_name: Option<String>,
    /// DER-encoded peer chain, leaf first. `None` when the peer was not verified.
    pub peer_certificates: Option<Vec<Bytes>>,
}

/// The transport a [`Connection`](crate::Connection) drives.
///
/// `write` only buffers; the returned result completes during a later
/// `flush` (or fails straight away if the channel is closed). Write results
/// must not be completed from inside `write` itself, since the connection
/// calls it while holding its state lock.
pub trait Channel: Send + Sync + 'static {
    /// Buffer `msg` without flushing it.
    fn write(&self, msg: Bytes) -> AsyncResult<()>;

    /// Push every buffered message to the peer.
    fn flush(&self);

    fn write_and_flush(&self, msg: Bytes) -> AsyncResult<()> {
        let res = self.write(msg);
        self.flush();
        res
    }

    /// `false` once buffered bytes pass the high water mark, until they
    /// drain below the low water mark.
    fn is_writable(&self) -> bool;

    fn set_auto_read(&self, auto_read: bool);

    fn is_auto_read(&self) -> bool;

    fn write_buffer_high_water_mark(&self) -> usize;

    /// Rejects a value below the current low water mark.
    fn set_write_buffer_high_water_mark(&self, high: usize) -> Result<(), Error>;

    /// Rejects a value above the current high water mark.
    fn set_write_buffer_low_water_mark(&self, low: usize) -> Result<(), Error>;

    fn close(&self) -> AsyncResult<()>;

    fn is_open(&self) -> bool;

    fn remote_address(&self) -> Option<SocketAddr>;

    fn local_address(&self) -> Option<SocketAddr>;

    /// TLS session details; `None` for plaintext channels.
    fn ssl_info(&self) -> Option<SslInfo> {
        None
    }
}
