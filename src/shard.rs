//! Worker-owned session registry.
//!
//! A [`Shard`] holds every session whose peer address hashes onto its
//! worker. Exactly one task owns each shard, so session state needs no
//! locks: all mutation happens on the owning worker's thread of
//! execution.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::config::ProtocolConfig;
use crate::conn::{ConnState, Connection, InputError};
use crate::segment::read_conv;
use crate::sink::{OutputSink, SessionEvents};
use crate::telemetry;

/// Sessions are keyed by peer address plus conversation id, so one peer
/// can run several independent streams.
pub type SessionKey = (SocketAddr, u32);

pub struct Shard {
    id: usize,
    cfg: ProtocolConfig,
    conns: HashMap<SessionKey, Connection>,
    sink: Arc<dyn OutputSink>,
    events: Arc<dyn SessionEvents>,
}

impl Shard {
    pub fn new(
        id: usize,
        cfg: ProtocolConfig,
        sink: Arc<dyn OutputSink>,
        events: Arc<dyn SessionEvents>,
    ) -> Self {
        Self {
            id,
            cfg,
            conns: HashMap::new(),
            sink,
            events,
        }
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Feed one inbound datagram to the session it addresses, creating the
    /// session on first valid contact. Reassembled messages surface through
    /// the event hooks before this returns.
    pub fn route(&mut self, datagram: Bytes, from: SocketAddr, now: u32) {
        telemetry::record_datagram_in(datagram.len());
        trace!(
            target: "ruda::datagram_dump",
            direction = "rx",
            peer = %from,
            len = datagram.len(),
            hex = %hex::encode(&datagram),
            "rx"
        );
        let Some(conv) = read_conv(&datagram) else {
            telemetry::record_malformed();
            debug!(shard = self.id, peer = %from, "datagram too short for a conversation id");
            return;
        };
        let conn = self.conns.entry((from, conv)).or_insert_with(|| {
            debug!(shard = self.id, peer = %from, conv, "new session");
            telemetry::record_session_open();
            Connection::new(conv, from, self.cfg.clone(), self.sink.clone(), now)
        });
        match conn.input(datagram, now) {
            Ok(()) => {}
            Err(InputError::WrongConversationId { expected, got }) => {
                // keyed by conv, so this only fires on a mixed datagram
                warn!(shard = self.id, peer = %from, expected, got, "conversation id mismatch");
            }
            Err(InputError::Malformed(e)) => {
                debug!(shard = self.id, peer = %from, conv, error = %e, "malformed segment");
            }
            Err(InputError::Closed) => return,
        }
        while let Some(msg) = conn.recv() {
            self.events.on_message(from, conv, msg);
        }
        if self.cfg.nodelay {
            // push acks and ready data out without waiting for the tick
            conn.update(now);
        }
    }

    /// Queue an application message, creating the session if needed so a
    /// client can talk first.
    pub fn send(&mut self, peer: SocketAddr, conv: u32, data: Bytes, now: u32) {
        let conn = self.open(peer, conv, now);
        if let Err(err) = conn.send(data) {
            debug!(peer = %peer, conv, error = %err, "send refused");
            self.events.on_send_error(peer, conv, err);
            return;
        }
        if self.cfg.nodelay {
            if let Some(conn) = self.conns.get_mut(&(peer, conv)) {
                conn.update(now);
            }
        }
    }

    /// Ensure a session exists and is established.
    pub fn open(&mut self, peer: SocketAddr, conv: u32, now: u32) -> &mut Connection {
        let conn = self.conns.entry((peer, conv)).or_insert_with(|| {
            debug!(shard = self.id, peer = %peer, conv, "opening session");
            telemetry::record_session_open();
            Connection::new(conv, peer, self.cfg.clone(), self.sink.clone(), now)
        });
        conn.open();
        conn
    }

    /// Request a graceful close; the session lingers through its ack grace
    /// period and leaves the registry on a later tick.
    pub fn close(&mut self, peer: SocketAddr, conv: u32) {
        if let Some(conn) = self.conns.get_mut(&(peer, conv)) {
            conn.close();
        }
    }

    /// Drive every session's clock, dropping the ones that finished
    /// closing or declared their link dead.
    pub fn tick(&mut self, now: u32) {
        let events = self.events.clone();
        self.conns.retain(|&(peer, conv), conn| {
            conn.update(now);
            if conn.is_dead() {
                warn!(peer = %peer, conv, "dead link, dropping session");
                telemetry::record_session_close();
                events.on_closed(peer, conv);
                return false;
            }
            if conn.state() == ConnState::Closed {
                telemetry::record_session_close();
                events.on_closed(peer, conv);
                return false;
            }
            true
        });
    }

    /// Drop sessions with no inbound traffic for `timeout_ms`.
    pub fn evict_idle(&mut self, now: u32, timeout_ms: u32) {
        let events = self.events.clone();
        self.conns.retain(|&(peer, conv), conn| {
            if conn.idle_for(now) < timeout_ms {
                return true;
            }
            debug!(peer = %peer, conv, idle_ms = conn.idle_for(now), "evicting idle session");
            telemetry::record_evicted();
            telemetry::record_session_close();
            events.on_closed(peer, conv);
            false
        });
    }

    /// Shutdown path: flush what we can, then drop everything.
    pub fn close_all(&mut self, now: u32) {
        for ((peer, conv), mut conn) in self.conns.drain() {
            conn.close();
            conn.update(now);
            telemetry::record_session_close();
            self.events.on_closed(peer, conv);
        }
    }
}
