//! Shared test harness: a pair of connections wired back to back through
//! collecting sinks, with optional loss injection between them.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use ruda::{Connection, OutputSink, ProtocolConfig};

pub fn addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{port}").parse().unwrap()
}

/// Sink that stashes every datagram for the harness to shuttle across.
#[derive(Default)]
pub struct CollectSink {
    sent: Mutex<Vec<(Bytes, SocketAddr)>>,
}

impl CollectSink {
    pub fn drain(&self) -> Vec<(Bytes, SocketAddr)> {
        std::mem::take(&mut self.sent.lock().unwrap())
    }
}

impl OutputSink for CollectSink {
    fn send_datagram(&self, datagram: Bytes, peer: SocketAddr) {
        self.sent.lock().unwrap().push((datagram, peer));
    }
}

/// Two connections on the same conversation, each holding the other's
/// "wire" in a [`CollectSink`].
pub struct Pair {
    pub a: Connection,
    pub b: Connection,
    pub a_out: Arc<CollectSink>,
    pub b_out: Arc<CollectSink>,
}

impl Pair {
    pub fn new(cfg: ProtocolConfig) -> Self {
        let a_out = Arc::new(CollectSink::default());
        let b_out = Arc::new(CollectSink::default());
        let mut a = Connection::new(77, addr(1000), cfg.clone(), a_out.clone(), 0);
        let mut b = Connection::new(77, addr(2000), cfg, b_out.clone(), 0);
        a.open();
        b.open();
        Self { a, b, a_out, b_out }
    }

    /// Tick both sides and deliver every emitted datagram to the other.
    pub fn exchange(&mut self, now: u32) {
        self.exchange_lossy(now, &mut |_| false);
    }

    /// Like [`exchange`], but `drop_fn` decides per datagram whether the
    /// wire eats it.
    ///
    /// [`exchange`]: Pair::exchange
    pub fn exchange_lossy(&mut self, now: u32, drop_fn: &mut dyn FnMut(&Bytes) -> bool) {
        self.a.update(now);
        self.b.update(now);
        for (dgram, _) in self.a_out.drain() {
            if !drop_fn(&dgram) {
                let _ = self.b.input(dgram, now);
            }
        }
        for (dgram, _) in self.b_out.drain() {
            if !drop_fn(&dgram) {
                let _ = self.a.input(dgram, now);
            }
        }
    }
}
