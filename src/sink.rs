//! Injection points between the protocol core and its host application.

use std::net::SocketAddr;

use bytes::Bytes;

use crate::conn::SendError;

/// Where encoded datagrams go.
///
/// The core never touches a socket; everything outbound funnels through
/// this trait. Implementations must not block: fire the datagram off (or
/// drop it) and return. UDP semantics apply, so a dropped datagram is
/// indistinguishable from wire loss and the ARQ layer recovers it.
pub trait OutputSink: Send + Sync {
    fn send_datagram(&self, datagram: Bytes, peer: SocketAddr);
}

/// Callbacks for session-level happenings, invoked on the worker that owns
/// the session. Keep them short; they run on the protocol hot path.
pub trait SessionEvents: Send + Sync {
    /// A fully reassembled application message arrived.
    fn on_message(&self, peer: SocketAddr, conv: u32, message: Bytes);

    /// The session left the registry: closed, dead link, or idle eviction.
    fn on_closed(&self, _peer: SocketAddr, _conv: u32) {}

    /// A queued application send was refused by the session.
    fn on_send_error(&self, _peer: SocketAddr, _conv: u32, _err: SendError) {}
}
