//! Session capture from rustls connections.
//!
//! A TLS-capable [`Channel`](crate::Channel) keeps its rustls state; once the
//! handshake completes it snapshots the session with [`TlsSession::info`] and
//! returns that from `ssl_info()`.

use bytes::Bytes;
use rustls::{ClientConnection, ServerConnection};

use crate::channel::SslInfo;

/// TLS connection kind: server (inbound) or client (outbound).
pub enum TlsSession {
    Server(ServerConnection),
    Client(ClientConnection),
}

impl TlsSession {
    pub fn is_handshaking(&self) -> bool {
        match self {
            TlsSession::Server(c) => c.is_handshaking(),
            TlsSession::Client(c) => c.is_handshaking(),
        }
    }

    pub fn alpn_protocol(&self) -> Option<&[u8]> {
        match self {
            TlsSession::Server(c) => c.alpn_protocol(),
            TlsSession::Client(c) => c.alpn_protocol(),
        }
    }

    pub fn negotiated_cipher_suite(&self) -> Option<rustls::SupportedCipherSuite> {
        match self {
            TlsSession::Server(c) => c.negotiated_cipher_suite(),
            TlsSession::Client(c) => c.negotiated_cipher_suite(),
        }
    }

    pub fn protocol_version(&self) -> Option<rustls::ProtocolVersion> {
        match self {
            TlsSession::Server(c) => c.protocol_version(),
            TlsSession::Client(c) => c.protocol_version(),
        }
    }

    /// SNI name sent by the client. Only known on the server side.
    pub fn server_name(&self) -> Option<&str> {
        match self {
            TlsSession::Server(c) => c.server_name(),
            TlsSession::Client(_) => None,
        }
    }

    pub fn peer_certificates(&self) -> Option<Vec<Bytes>> {
        let certs = match self {
            TlsSession::Server(c) => c.peer_certificates(),
            TlsSession::Client(c) => c.peer_certificates(),
        }?;
        if certs.is_empty() {
            return None;
        }
        Some(
            certs
                .iter()
                .map(|cert| Bytes::copy_from_slice(cert.as_ref()))
                .collect(),
        )
    }

    /// Snapshot of the negotiated session. `None` while still handshaking.
    pub fn info(&self) -> Option<SslInfo> {
        if self.is_handshaking() {
            return None;
        }
        Some(SslInfo {
            protocol_version: self.protocol_version().map(|v| format!("{v:?}")),
            cipher_suite: self
                .negotiated_cipher_suite()
                .map(|s| format!("{:?}", s.suite())),
            alpn_protocol: self.alpn_protocol().map(<[u8]>::to_vec),
            server_name: self.server_name().map(str::to_string),
            peer_certificates: self.peer_certificates(),
        })
    }
}

impl From<ServerConnection> for TlsSession {
    fn from(conn: ServerConnection) -> Self {
        TlsSession::Server(conn)
    }
}

impl From<ClientConnection> for TlsSession {
    fn from(conn: ClientConnection) -> Self {
        TlsSession::Client(conn)
    }
}
