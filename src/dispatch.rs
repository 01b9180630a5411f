//! Dispatcher and worker pool.
//!
//! Inbound datagrams are hashed by peer address onto a fixed set of worker
//! tasks. Each worker owns one [`Shard`] outright and serializes every
//! operation on its sessions through a bounded inbox, so the hot path takes
//! no locks and a given peer's traffic is always handled in arrival order.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use rand::Rng;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{ConfigError, EndpointConfig};
use crate::shard::Shard;
use crate::sink::{OutputSink, SessionEvents};
use crate::telemetry;

/// Pick the worker that owns `peer`. Stable for the pool's lifetime, so a
/// peer's sessions never migrate between workers.
pub fn shard_for(peer: &SocketAddr, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    peer.hash(&mut hasher);
    (hasher.finish() % workers as u64) as usize
}

/// Fresh random conversation id for a client-side session.
pub fn rand_conv() -> u32 {
    rand::thread_rng().gen()
}

enum ShardMsg {
    Datagram { data: Bytes, from: SocketAddr },
    Send { peer: SocketAddr, conv: u32, data: Bytes },
    Open { peer: SocketAddr, conv: u32 },
    Close { peer: SocketAddr, conv: u32 },
}

/// Error types for handing work to the pool.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    /// The owning worker's inbox is full; the item was dropped, which for
    /// datagrams is ordinary wire loss as far as the peer can tell.
    #[error("worker {shard} backlogged")]
    Backlogged { shard: usize },

    #[error("pool shut down")]
    ShutDown,
}

/// A running set of worker shards behind bounded inboxes.
///
/// Datagram I/O stays outside: the host reads its socket and calls
/// [`route`], and everything outbound leaves through the [`OutputSink`]
/// given at construction.
///
/// [`route`]: WorkerPool::route
pub struct WorkerPool {
    inboxes: Vec<mpsc::Sender<ShardMsg>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl WorkerPool {
    /// Validate the config and spawn one worker task per shard.
    pub fn new(
        cfg: EndpointConfig,
        sink: Arc<dyn OutputSink>,
        events: Arc<dyn SessionEvents>,
    ) -> Result<Self, ConfigError> {
        use crate::config::FileConfig;
        cfg.validate()?;
        telemetry::start_logger();

        let epoch = Instant::now();
        let shutdown = CancellationToken::new();
        let mut inboxes = Vec::with_capacity(cfg.pool.workers);
        let mut tasks = Vec::with_capacity(cfg.pool.workers);
        for id in 0..cfg.pool.workers {
            let (tx, rx) = mpsc::channel(cfg.pool.inbound_queue);
            let shard = Shard::new(id, cfg.protocol.clone(), sink.clone(), events.clone());
            let task = tokio::spawn(run_shard(
                id,
                shard,
                rx,
                cfg.clone(),
                epoch,
                shutdown.child_token(),
            ));
            inboxes.push(tx);
            tasks.push(task);
        }
        info!(workers = cfg.pool.workers, "worker pool started");
        Ok(Self {
            inboxes,
            tasks: Mutex::new(tasks),
            shutdown,
        })
    }

    /// Hand one inbound datagram to the worker owning its sender.
    pub fn route(&self, datagram: Bytes, from: SocketAddr) -> Result<(), RouteError> {
        self.dispatch(&from, ShardMsg::Datagram {
            data: datagram,
            from,
        })
    }

    /// Queue an application message on the session for `(peer, conv)`,
    /// creating it if needed.
    pub fn send(&self, peer: SocketAddr, conv: u32, data: Bytes) -> Result<(), RouteError> {
        self.dispatch(&peer, ShardMsg::Send { peer, conv, data })
    }

    /// Proactively establish a client-side session.
    pub fn open(&self, peer: SocketAddr, conv: u32) -> Result<(), RouteError> {
        self.dispatch(&peer, ShardMsg::Open { peer, conv })
    }

    /// Request a graceful close of one session.
    pub fn close(&self, peer: SocketAddr, conv: u32) -> Result<(), RouteError> {
        self.dispatch(&peer, ShardMsg::Close { peer, conv })
    }

    fn dispatch(&self, peer: &SocketAddr, msg: ShardMsg) -> Result<(), RouteError> {
        let shard = shard_for(peer, self.inboxes.len());
        match self.inboxes[shard].try_send(msg) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                telemetry::record_queue_drop();
                Err(RouteError::Backlogged { shard })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(RouteError::ShutDown),
        }
    }

    /// Stop every worker and wait for them to drain. Idempotent.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
        info!("worker pool stopped");
    }
}

fn now_ms(epoch: Instant) -> u32 {
    epoch.elapsed().as_millis() as u32
}

async fn run_shard(
    id: usize,
    mut shard: Shard,
    mut inbox: mpsc::Receiver<ShardMsg>,
    cfg: EndpointConfig,
    epoch: Instant,
    shutdown: CancellationToken,
) {
    let mut ticker =
        tokio::time::interval(std::time::Duration::from_millis(cfg.protocol.interval_ms as u64));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut ticks: u32 = 0;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            msg = inbox.recv() => {
                let Some(msg) = msg else { break };
                let now = now_ms(epoch);
                match msg {
                    ShardMsg::Datagram { data, from } => shard.route(data, from, now),
                    ShardMsg::Send { peer, conv, data } => shard.send(peer, conv, data, now),
                    ShardMsg::Open { peer, conv } => {
                        shard.open(peer, conv, now);
                    }
                    ShardMsg::Close { peer, conv } => shard.close(peer, conv),
                }
            }
            _ = ticker.tick() => {
                let now = now_ms(epoch);
                shard.tick(now);
                ticks = ticks.wrapping_add(1);
                if ticks % cfg.pool.evict_every_ticks == 0 {
                    shard.evict_idle(now, cfg.pool.idle_timeout_ms);
                }
            }
        }
    }
    shard.close_all(now_ms(epoch));
    debug!(shard = id, "worker stopped");
}
