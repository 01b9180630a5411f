//! UDP echo example.
//!
//! Runs a server pool and a client pool on real UDP sockets in one
//! process: the client sends a line, the server echoes it back over the
//! same reliable session.
//!
//! To run:
//! cargo run --example echo

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use ruda::{rand_conv, EndpointConfig, OutputSink, SessionEvents, WorkerPool};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// Outbound side of a pool, writing straight to a UDP socket.
///
/// `try_send_to` never blocks; a full socket buffer drops the datagram,
/// which the protocol treats as wire loss and retransmits.
struct UdpSink {
    socket: Arc<UdpSocket>,
}

impl OutputSink for UdpSink {
    fn send_datagram(&self, datagram: Bytes, peer: SocketAddr) {
        if let Err(e) = self.socket.try_send_to(&datagram, peer) {
            eprintln!("[sink] send to {peer} failed: {e}");
        }
    }
}

/// Server behavior: echo every message back on its own session.
struct EchoEvents {
    pool: OnceLock<Arc<WorkerPool>>,
}

impl SessionEvents for EchoEvents {
    fn on_message(&self, peer: SocketAddr, conv: u32, message: Bytes) {
        println!("[server] {} byte(s) from {peer} conv {conv}", message.len());
        if let Some(pool) = self.pool.get() {
            let _ = pool.send(peer, conv, message);
        }
    }

    fn on_closed(&self, peer: SocketAddr, conv: u32) {
        println!("[server] session {peer}/{conv} closed");
    }
}

/// Client behavior: hand replies to the main task.
struct ReplyEvents {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl SessionEvents for ReplyEvents {
    fn on_message(&self, _peer: SocketAddr, _conv: u32, message: Bytes) {
        let _ = self.tx.send(message);
    }
}

/// Bind a socket, spawn its recv loop, and return the pool plus address.
async fn start_endpoint(
    cfg: EndpointConfig,
    events: Arc<dyn SessionEvents>,
) -> Result<(Arc<WorkerPool>, SocketAddr), Box<dyn std::error::Error + Send + Sync>> {
    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await?);
    let local_addr = socket.local_addr()?;
    let sink = Arc::new(UdpSink {
        socket: socket.clone(),
    });
    let pool = Arc::new(WorkerPool::new(cfg, sink, events)?);

    let recv_pool = pool.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((n, from)) => {
                    let _ = recv_pool.route(Bytes::copy_from_slice(&buf[..n]), from);
                }
                Err(e) => {
                    eprintln!("[recv] {e}");
                    break;
                }
            }
        }
    });

    Ok((pool, local_addr))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut cfg = EndpointConfig::default();
    cfg.protocol.nodelay = true;
    cfg.protocol.interval_ms = 10;
    cfg.protocol.resend = 2;

    // server
    let echo_events = Arc::new(EchoEvents {
        pool: OnceLock::new(),
    });
    let (server, server_addr) = start_endpoint(cfg.clone(), echo_events.clone()).await?;
    echo_events.pool.set(server.clone()).ok();
    println!("Echo server listening on {server_addr}");

    // client
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (client, client_addr) = start_endpoint(cfg, Arc::new(ReplyEvents { tx })).await?;
    println!("Client bound to {client_addr}");

    let conv = rand_conv();
    client.open(server_addr, conv)?;

    let message = Bytes::from_static(b"Hello over reliable UDP!");
    println!("[client] sending: {:?}", String::from_utf8_lossy(&message));
    client.send(server_addr, conv, message.clone())?;

    let reply = rx.recv().await.ok_or("reply channel closed")?;
    println!("[client] received: {:?}", String::from_utf8_lossy(&reply));
    assert_eq!(reply, message);
    println!("[client] echo verified!");

    client.close(server_addr, conv)?;
    client.shutdown().await;
    server.shutdown().await;
    Ok(())
}
