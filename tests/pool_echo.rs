//! Full-pool integration: two worker pools cross-wired in memory, one
//! echoing everything back to the other.

mod support;

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use ruda::{
    EndpointConfig, OutputSink, RouteError, SessionEvents, WorkerPool,
};
use support::harness::addr;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// In-memory wire: datagrams emitted by one pool arrive at the other,
/// stamped with the emitting side's address.
struct LinkSink {
    dest: OnceLock<Arc<WorkerPool>>,
    src: SocketAddr,
}

impl LinkSink {
    fn new(src: SocketAddr) -> Self {
        Self {
            dest: OnceLock::new(),
            src,
        }
    }

    fn connect(&self, pool: Arc<WorkerPool>) {
        let _ = self.dest.set(pool);
    }
}

impl OutputSink for LinkSink {
    fn send_datagram(&self, datagram: Bytes, _peer: SocketAddr) {
        if let Some(pool) = self.dest.get() {
            let _ = pool.route(datagram, self.src);
        }
    }
}

/// Server side: echo every message straight back on the same session.
struct EchoEvents {
    pool: OnceLock<Arc<WorkerPool>>,
}

impl SessionEvents for EchoEvents {
    fn on_message(&self, peer: SocketAddr, conv: u32, message: Bytes) {
        if let Some(pool) = self.pool.get() {
            let _ = pool.send(peer, conv, message);
        }
    }
}

/// Client side: forward replies to the test body.
struct ForwardEvents {
    tx: mpsc::UnboundedSender<(u32, Bytes)>,
}

impl SessionEvents for ForwardEvents {
    fn on_message(&self, _peer: SocketAddr, conv: u32, message: Bytes) {
        let _ = self.tx.send((conv, message));
    }
}

fn fast_config(workers: usize) -> EndpointConfig {
    let mut cfg = EndpointConfig::default();
    cfg.protocol.nodelay = true;
    cfg.protocol.interval_ms = 10;
    cfg.protocol.resend = 2;
    cfg.pool.workers = workers;
    cfg
}

struct EchoRig {
    client: Arc<WorkerPool>,
    server: Arc<WorkerPool>,
    server_addr: SocketAddr,
    replies: mpsc::UnboundedReceiver<(u32, Bytes)>,
}

fn rig(client_port: u16, server_port: u16) -> EchoRig {
    let client_addr = addr(client_port);
    let server_addr = addr(server_port);

    let client_sink = Arc::new(LinkSink::new(client_addr));
    let server_sink = Arc::new(LinkSink::new(server_addr));

    let echo_events = Arc::new(EchoEvents {
        pool: OnceLock::new(),
    });
    let (tx, replies) = mpsc::unbounded_channel();
    let forward_events = Arc::new(ForwardEvents { tx });

    let client = Arc::new(
        WorkerPool::new(fast_config(1), client_sink.clone(), forward_events).unwrap(),
    );
    let server = Arc::new(
        WorkerPool::new(fast_config(2), server_sink.clone(), echo_events.clone()).unwrap(),
    );

    client_sink.connect(server.clone());
    server_sink.connect(client.clone());
    echo_events.pool.set(server.clone()).ok().unwrap();

    EchoRig {
        client,
        server,
        server_addr,
        replies,
    }
}

#[tokio::test]
async fn message_echoes_back_through_both_pools() {
    let mut rig = rig(40_001, 40_002);
    let conv = 11;

    rig.client.open(rig.server_addr, conv).unwrap();
    rig.client
        .send(rig.server_addr, conv, Bytes::from_static(b"ping"))
        .unwrap();

    let (got_conv, reply) = timeout(Duration::from_secs(5), rig.replies.recv())
        .await
        .expect("echo timed out")
        .expect("reply channel closed");
    assert_eq!(got_conv, conv);
    assert_eq!(reply, Bytes::from_static(b"ping"));

    rig.client.shutdown().await;
    rig.server.shutdown().await;
}

#[tokio::test]
async fn conversations_echo_independently() {
    let mut rig = rig(40_003, 40_004);

    for conv in [1u32, 2, 3] {
        rig.client.open(rig.server_addr, conv).unwrap();
        rig.client
            .send(rig.server_addr, conv, Bytes::from(format!("hello {conv}")))
            .unwrap();
    }

    let mut seen = Vec::new();
    for _ in 0..3 {
        let (conv, reply) = timeout(Duration::from_secs(5), rig.replies.recv())
            .await
            .expect("echo timed out")
            .expect("reply channel closed");
        assert_eq!(reply, Bytes::from(format!("hello {conv}")));
        seen.push(conv);
    }
    seen.sort_unstable();
    assert_eq!(seen, vec![1, 2, 3]);

    rig.client.shutdown().await;
    rig.server.shutdown().await;
}

#[tokio::test]
async fn shutdown_stops_accepting_work() {
    let rig = rig(40_005, 40_006);
    rig.client.shutdown().await;

    let err = rig
        .client
        .send(rig.server_addr, 9, Bytes::from_static(b"late"))
        .unwrap_err();
    assert_eq!(err, RouteError::ShutDown);

    rig.server.shutdown().await;
}
