//! TCP transport for the gossip engine.
//!
//! Inbound connections are read line by line and every `ping`/`meet` is
//! answered on the same connection. Outbound traffic opens one short
//! connection per exchange, bounded by `io_timeout`; a slow peer costs one
//! detached task, never the tick loop.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::gossip::{GossipConfig, GossipEngine, GossipEvent};
use crate::message::{read_line_limited, GossipMessage, MAX_MESSAGE_LEN};
use crate::topology::{NodeId, NodeState};
use crate::{ClusterError, ClusterRegistry};

/// Runs the gossip listener, the ping loop and the liveness loop.
pub struct GossipService {
    engine: Mutex<GossipEngine>,
    registry: Arc<ClusterRegistry>,
    config: GossipConfig,
    bind_addr: SocketAddr,
    events: mpsc::Sender<GossipEvent>,
    started: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl std::fmt::Debug for GossipService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GossipService")
            .field("bind_addr", &self.bind_addr)
            .field("local_addr", &self.local_addr())
            .finish_non_exhaustive()
    }
}

impl GossipService {
    /// Creates a stopped service. Membership events are sent on `events`.
    pub fn new(
        registry: Arc<ClusterRegistry>,
        bind_addr: SocketAddr,
        config: GossipConfig,
        events: mpsc::Sender<GossipEvent>,
    ) -> Self {
        Self {
            engine: Mutex::new(GossipEngine::new(Arc::clone(&registry), config.clone())),
            registry,
            config,
            bind_addr,
            events,
            started: AtomicBool::new(false),
            local_addr: Mutex::new(None),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    fn engine(&self) -> MutexGuard<'_, GossipEngine> {
        self.engine.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The bound listener address once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Binds the listener and spawns the background loops.
    ///
    /// The local node is marked online and its gossip port is set to the
    /// bound port, which matters when binding port 0.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr, ClusterError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ClusterError::Configuration(
                "gossip service already started".into(),
            ));
        }

        let listener = TcpListener::bind(self.bind_addr).await?;
        let addr = listener.local_addr()?;
        {
            let mut state = self.registry.write();
            let local = state.local_id().clone();
            if let Some(node) = state.node_mut(&local) {
                node.gossip_port = addr.port();
                node.state = NodeState::Online;
                node.last_seen = Instant::now();
            }
        }
        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner()) = Some(addr);
        info!("gossip listening on {addr}");

        self.tracker.spawn(Arc::clone(self).accept_loop(listener));
        self.tracker.spawn(Arc::clone(self).tick_loop());
        self.tracker.spawn(Arc::clone(self).liveness_loop());
        Ok(addr)
    }

    /// Introduces this node to the gossip endpoint `host:port`.
    ///
    /// Unlike periodic pings this waits for the exchange so the caller
    /// learns whether the peer answered.
    pub async fn meet(&self, host: &str, port: u16) -> Result<(), ClusterError> {
        let endpoint = format!("{host}:{port}");
        let msg = {
            let mut engine = self.engine();
            engine.add_peer(endpoint.clone(), None);
            engine.meet_message()
        };
        info!("meeting {endpoint}");
        self.exchange(&endpoint, msg).await
    }

    /// Sends a `fail` for `target` to every peer.
    pub fn broadcast_fail(self: &Arc<Self>, target: &NodeId) {
        let outgoing = self.engine().fail_broadcast(target);
        for (endpoint, msg) in outgoing {
            self.send_detached(endpoint, msg);
        }
    }

    /// Stops every loop and waits for in-flight exchanges. Idempotent.
    pub async fn shutdown(&self) {
        if !self.cancel.is_cancelled() {
            info!("gossip shutting down");
        }
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,

                result = listener.accept() => match result {
                    Ok((stream, peer)) => {
                        let svc = Arc::clone(&self);
                        self.tracker.spawn(async move { svc.serve_connection(stream, peer).await });
                    }
                    Err(e) => warn!("gossip accept error: {e}"),
                },
            }
        }
        debug!("gossip listener stopped");
    }

    async fn serve_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();

        loop {
            line.clear();
            let read = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                read = read_line_limited(&mut reader, &mut line, MAX_MESSAGE_LEN) => read,
            };
            match read {
                Ok(0) => return,
                Ok(_) => {}
                Err(e) => {
                    debug!("gossip read error from {peer}: {e}");
                    return;
                }
            }
            if line.trim().is_empty() {
                continue;
            }

            let msg = match GossipMessage::decode(&line) {
                Ok(msg) => msg,
                Err(e) => {
                    debug!("dropping gossip line from {peer}: {e}");
                    continue;
                }
            };

            let Some(reply) = self.dispatch(msg).await else {
                continue;
            };
            let bytes = match reply.encode() {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("failed to encode gossip reply: {e}");
                    continue;
                }
            };
            match timeout(self.config.io_timeout, writer.write_all(&bytes)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!("gossip reply to {peer} failed: {e}");
                    return;
                }
                Err(_) => {
                    debug!("gossip reply to {peer} timed out");
                    return;
                }
            }
        }
    }

    /// Feeds a message to the engine and forwards the resulting events.
    async fn dispatch(&self, msg: GossipMessage) -> Option<GossipMessage> {
        let (reply, events) = {
            let mut engine = self.engine();
            let reply = engine.handle_message(msg);
            (reply, engine.drain_events())
        };
        self.emit(events).await;
        reply
    }

    async fn emit(&self, events: Vec<GossipEvent>) {
        for event in events {
            if self.events.send(event).await.is_err() {
                warn!("gossip event channel closed, dropping event");
                return;
            }
        }
    }

    /// One connect/write/read round trip, bounded by `io_timeout`.
    async fn exchange(&self, endpoint: &str, msg: GossipMessage) -> Result<(), ClusterError> {
        let expects_reply = msg.expects_reply();
        let bytes = msg.encode()?;

        let io = async {
            let mut stream = TcpStream::connect(endpoint).await?;
            stream.write_all(&bytes).await?;
            if !expects_reply {
                stream.shutdown().await?;
                return Ok::<_, std::io::Error>(None);
            }
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            let n = read_line_limited(&mut reader, &mut line, MAX_MESSAGE_LEN).await?;
            Ok((n > 0).then_some(line))
        };

        let reply = match timeout(self.config.io_timeout, io).await {
            Ok(result) => result?,
            Err(_) => return Err(ClusterError::Timeout),
        };

        match reply {
            Some(line) => {
                let msg = GossipMessage::decode(&line)?;
                self.dispatch(msg).await;
                Ok(())
            }
            None if expects_reply => Err(ClusterError::Network(format!(
                "{endpoint} closed the connection without replying"
            ))),
            None => Ok(()),
        }
    }

    fn send_detached(self: &Arc<Self>, endpoint: String, msg: GossipMessage) {
        if self.cancel.is_cancelled() {
            return;
        }
        let svc = Arc::clone(self);
        self.tracker.spawn(async move {
            let kind = msg.kind.as_str();
            tokio::select! {
                biased;
                _ = svc.cancel.cancelled() => {}
                result = svc.exchange(&endpoint, msg) => {
                    if let Err(e) = result {
                        debug!("gossip {kind} to {endpoint} failed: {e}");
                    }
                }
            }
        });
    }

    async fn tick_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            let outgoing = self.engine().tick();
            for (endpoint, msg) in outgoing {
                self.send_detached(endpoint, msg);
            }
        }
    }

    async fn liveness_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            let (broadcasts, events) = {
                let mut engine = self.engine();
                let now = Instant::now();
                let failed = engine.detect_failures(now);
                engine.prune_peers(now);
                let broadcasts: Vec<_> = failed
                    .iter()
                    .flat_map(|id| engine.fail_broadcast(id))
                    .collect();
                (broadcasts, engine.drain_events())
            };
            self.emit(events).await;
            for (endpoint, msg) in broadcasts {
                self.send_detached(endpoint, msg);
            }
        }
    }
}
