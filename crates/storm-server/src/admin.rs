//! Line-oriented admin protocol.
//!
//! One command per line, whitespace separated, case-insensitive verbs.
//! Every command gets exactly one JSON line back:
//!
//! ```text
//! > MIGRATE START node-a node-b 100-199 250
//! < {"ok":true,"result":null}
//! > VOTE node-c node-x
//! < {"ok":false,"error":"vote for node-x does not match the current candidate r1"}
//! ```

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use storm_cluster::{
    read_line_limited, ClusterError, FailoverError, MigrationError, NodeId, SlotRange,
    SLOT_COUNT,
};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::coordinator::ClusterCoordinator;
use crate::metrics;

/// Longest accepted command line.
const MAX_LINE: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("usage: {0}")]
    Usage(&'static str),

    #[error("invalid argument '{arg}': {reason}")]
    InvalidArgument { arg: String, reason: String },

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Failover(#[from] FailoverError),

    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error("line exceeds {0} bytes")]
    LineTooLong(usize),

    #[error("failed to encode reply: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A parsed admin command.
#[derive(Debug, Clone, PartialEq)]
pub enum AdminCommand {
    Ping,
    MyId,
    Nodes,
    Node(NodeId),
    Assign { node: NodeId, ranges: Vec<SlotRange> },
    Balance,
    Rebalance,
    Failover(NodeId),
    FailoverStatus,
    FailoverAbort,
    Vote { voter: NodeId, candidate: NodeId },
    MigrateStart {
        source: NodeId,
        target: NodeId,
        slots: Vec<u16>,
    },
    MigrateProgress { progress: f64, bytes: u64 },
    MigrateComplete,
    MigrateCancel,
    MigrateStatus,
    Health,
    Stats,
    Meet { host: String, port: u16 },
    Forget(NodeId),
    KeySlot(String),
    Offset { node: NodeId, offset: u64 },
    Slots,
    Distribution,
}

impl AdminCommand {
    /// Verb used as the metrics label.
    pub fn name(&self) -> &'static str {
        match self {
            AdminCommand::Ping => "PING",
            AdminCommand::MyId => "MYID",
            AdminCommand::Nodes => "NODES",
            AdminCommand::Node(_) => "NODE",
            AdminCommand::Assign { .. } => "ASSIGN",
            AdminCommand::Balance => "BALANCE",
            AdminCommand::Rebalance => "REBALANCE",
            AdminCommand::Failover(_) | AdminCommand::FailoverStatus | AdminCommand::FailoverAbort => {
                "FAILOVER"
            }
            AdminCommand::Vote { .. } => "VOTE",
            AdminCommand::MigrateStart { .. }
            | AdminCommand::MigrateProgress { .. }
            | AdminCommand::MigrateComplete
            | AdminCommand::MigrateCancel
            | AdminCommand::MigrateStatus => "MIGRATE",
            AdminCommand::Health => "HEALTH",
            AdminCommand::Stats => "STATS",
            AdminCommand::Meet { .. } => "MEET",
            AdminCommand::Forget(_) => "FORGET",
            AdminCommand::KeySlot(_) => "KEYSLOT",
            AdminCommand::Offset { .. } => "OFFSET",
            AdminCommand::Slots => "SLOTS",
            AdminCommand::Distribution => "DISTRIBUTION",
        }
    }

    pub fn parse(line: &str) -> Result<Self, AdminError> {
        let mut parts = line.split_whitespace();
        let verb = parts.next().unwrap_or_default().to_ascii_uppercase();
        let args: Vec<&str> = parts.collect();

        let cmd = match (verb.as_str(), args.as_slice()) {
            ("PING", []) => AdminCommand::Ping,
            ("MYID", []) => AdminCommand::MyId,
            ("NODES", []) => AdminCommand::Nodes,
            ("NODE", [id]) => AdminCommand::Node(NodeId::from(*id)),
            ("NODE", _) => return Err(AdminError::Usage("NODE <id>")),
            ("ASSIGN", [node, ranges @ ..]) if !ranges.is_empty() => AdminCommand::Assign {
                node: NodeId::from(*node),
                ranges: ranges.iter().map(|r| parse_arg(r)).collect::<Result<_, _>>()?,
            },
            ("ASSIGN", _) => return Err(AdminError::Usage("ASSIGN <node> <start-end|slot>...")),
            ("BALANCE", []) => AdminCommand::Balance,
            ("REBALANCE", []) => AdminCommand::Rebalance,
            ("FAILOVER", [sub]) if sub.eq_ignore_ascii_case("status") => {
                AdminCommand::FailoverStatus
            }
            ("FAILOVER", [sub]) if sub.eq_ignore_ascii_case("abort") => AdminCommand::FailoverAbort,
            ("FAILOVER", [id]) => AdminCommand::Failover(NodeId::from(*id)),
            ("FAILOVER", _) => return Err(AdminError::Usage("FAILOVER <node>|STATUS|ABORT")),
            ("VOTE", [voter, candidate]) => AdminCommand::Vote {
                voter: NodeId::from(*voter),
                candidate: NodeId::from(*candidate),
            },
            ("VOTE", _) => return Err(AdminError::Usage("VOTE <voter> <candidate>")),
            ("MIGRATE", [sub, rest @ ..]) => parse_migrate(sub, rest)?,
            ("MIGRATE", []) => return Err(AdminError::Usage(MIGRATE_USAGE)),
            ("HEALTH", []) => AdminCommand::Health,
            ("STATS", []) => AdminCommand::Stats,
            ("MEET", [host, port]) => AdminCommand::Meet {
                host: (*host).to_string(),
                port: parse_arg(port)?,
            },
            ("MEET", _) => return Err(AdminError::Usage("MEET <host> <gossip-port>")),
            ("FORGET", [id]) => AdminCommand::Forget(NodeId::from(*id)),
            ("FORGET", _) => return Err(AdminError::Usage("FORGET <node>")),
            ("KEYSLOT", [key]) => AdminCommand::KeySlot((*key).to_string()),
            ("KEYSLOT", _) => return Err(AdminError::Usage("KEYSLOT <key>")),
            ("OFFSET", [node, offset]) => AdminCommand::Offset {
                node: NodeId::from(*node),
                offset: parse_arg(offset)?,
            },
            ("OFFSET", _) => return Err(AdminError::Usage("OFFSET <node> <offset>")),
            ("SLOTS", []) => AdminCommand::Slots,
            ("DISTRIBUTION", []) => AdminCommand::Distribution,
            (
                "PING" | "MYID" | "NODES" | "BALANCE" | "REBALANCE" | "HEALTH" | "STATS" | "SLOTS"
                | "DISTRIBUTION",
                _,
            ) => return Err(AdminError::Usage("command takes no arguments")),
            _ => return Err(AdminError::UnknownCommand(verb.clone())),
        };
        Ok(cmd)
    }
}

const MIGRATE_USAGE: &str =
    "MIGRATE START <source> <target> <slots>... | PROGRESS <pct> <bytes> | COMPLETE | CANCEL | STATUS";

fn parse_migrate(sub: &str, rest: &[&str]) -> Result<AdminCommand, AdminError> {
    let cmd = match (sub.to_ascii_uppercase().as_str(), rest) {
        ("START", [source, target, specs @ ..]) if !specs.is_empty() => {
            let mut slots = Vec::new();
            for spec in specs {
                let range: SlotRange = parse_arg(spec)?;
                slots.extend(range.iter());
            }
            AdminCommand::MigrateStart {
                source: NodeId::from(*source),
                target: NodeId::from(*target),
                slots,
            }
        }
        ("PROGRESS", [pct, bytes]) => AdminCommand::MigrateProgress {
            progress: parse_arg(pct)?,
            bytes: parse_arg(bytes)?,
        },
        ("COMPLETE", []) => AdminCommand::MigrateComplete,
        ("CANCEL", []) => AdminCommand::MigrateCancel,
        ("STATUS", []) => AdminCommand::MigrateStatus,
        _ => return Err(AdminError::Usage(MIGRATE_USAGE)),
    };
    Ok(cmd)
}

fn parse_arg<T>(arg: &str) -> Result<T, AdminError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    arg.parse().map_err(|e: T::Err| AdminError::InvalidArgument {
        arg: arg.to_string(),
        reason: e.to_string(),
    })
}

/// Runs one command against the coordinator.
pub async fn execute(
    coordinator: &ClusterCoordinator,
    cmd: AdminCommand,
) -> Result<Value, AdminError> {
    let registry = coordinator.registry();
    let value = match cmd {
        AdminCommand::Ping => json!("PONG"),
        AdminCommand::MyId => json!(coordinator.local_id()),
        AdminCommand::Nodes => serde_json::to_value(registry.node_reports())?,
        AdminCommand::Node(id) => match registry.node_report(&id) {
            Some(report) => serde_json::to_value(report)?,
            None => return Err(ClusterError::NodeNotFound(id).into()),
        },
        AdminCommand::Assign { node, ranges } => {
            registry.assign_slots_to(&node, &ranges)?;
            info!("assigned {} ranges to {}", ranges.len(), node);
            serde_json::to_value(registry.node_report(&node))?
        }
        AdminCommand::Balance => {
            registry.balance_slots();
            serde_json::to_value(registry.slot_distribution())?
        }
        AdminCommand::Rebalance => serde_json::to_value(registry.rebalance()?)?,
        AdminCommand::Failover(id) => {
            let generation = coordinator.failover().trigger(&id)?;
            json!({ "generation": generation })
        }
        AdminCommand::FailoverStatus => serde_json::to_value(coordinator.failover().status())?,
        AdminCommand::FailoverAbort => json!({ "aborted": coordinator.failover().abort() }),
        AdminCommand::Vote { voter, candidate } => {
            serde_json::to_value(coordinator.failover().vote(voter, &candidate)?)?
        }
        AdminCommand::MigrateStart {
            source,
            target,
            slots,
        } => {
            coordinator
                .migrator()
                .start_migration(&source, &target, slots)?;
            serde_json::to_value(coordinator.migrator().status())?
        }
        AdminCommand::MigrateProgress { progress, bytes } => {
            coordinator.migrator().update_progress(progress, bytes);
            Value::Null
        }
        AdminCommand::MigrateComplete => serde_json::to_value(coordinator.migrator().complete()?)?,
        AdminCommand::MigrateCancel => {
            coordinator.migrator().cancel();
            Value::Null
        }
        AdminCommand::MigrateStatus => serde_json::to_value(coordinator.migrator().status())?,
        AdminCommand::Health => serde_json::to_value(registry.health())?,
        AdminCommand::Stats => serde_json::to_value(registry.stats())?,
        AdminCommand::Meet { host, port } => {
            coordinator.meet(&host, port).await?;
            json!({ "nodes": registry.node_count() })
        }
        AdminCommand::Forget(id) => {
            coordinator.forget(&id)?;
            Value::Null
        }
        AdminCommand::KeySlot(key) => serde_json::to_value(
            coordinator.router().redirect_info(key.as_bytes()),
        )?,
        AdminCommand::Offset { node, offset } => {
            registry.set_replication_offset(&node, offset)?;
            Value::Null
        }
        AdminCommand::Slots => slots_table(coordinator),
        AdminCommand::Distribution => serde_json::to_value(registry.slot_distribution())?,
    };
    Ok(value)
}

/// Owned ranges with their owner's address, in slot order.
fn slots_table(coordinator: &ClusterCoordinator) -> Value {
    let state = coordinator.registry().read();
    let mut rows: Vec<(SlotRange, Value)> = Vec::new();
    for node in state.nodes() {
        for range in state.slot_map().slots_for_node(&node.id) {
            rows.push((
                range,
                json!({
                    "start": range.start,
                    "end": range.end,
                    "node": node.id,
                    "addr": node.addr,
                    "port": node.port,
                }),
            ));
        }
    }
    rows.sort_by_key(|(range, _)| *range);
    let covered: usize = rows.iter().map(|(r, _)| r.len()).sum();
    json!({
        "ranges": rows.into_iter().map(|(_, row)| row).collect::<Vec<_>>(),
        "covered": covered,
        "total": SLOT_COUNT,
    })
}

/// Renders a command result as one reply line.
pub fn render_reply(result: Result<Value, AdminError>) -> String {
    let reply = match result {
        Ok(result) => json!({ "ok": true, "result": result }),
        Err(e) => json!({ "ok": false, "error": e.to_string() }),
    };
    let mut line = reply.to_string();
    line.push('\n');
    line
}

/// TCP listener serving the admin protocol.
pub struct AdminServer {
    coordinator: Arc<ClusterCoordinator>,
    local_addr: Mutex<Option<SocketAddr>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl std::fmt::Debug for AdminServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminServer")
            .field("local_addr", &self.local_addr())
            .finish_non_exhaustive()
    }
}

impl AdminServer {
    pub fn new(coordinator: Arc<ClusterCoordinator>) -> Self {
        Self {
            coordinator,
            local_addr: Mutex::new(None),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Binds `addr` and starts accepting connections.
    pub async fn start(self: &Arc<Self>, addr: SocketAddr) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let bound = listener.local_addr()?;
        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner()) = Some(bound);
        info!("admin commands on {bound}");
        self.tracker.spawn(Arc::clone(self).accept_loop(listener));
        Ok(bound)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,

                result = listener.accept() => match result {
                    Ok((stream, peer)) => {
                        debug!("admin connection from {peer}");
                        let server = Arc::clone(&self);
                        self.tracker.spawn(async move { server.serve(stream, peer).await });
                    }
                    Err(e) => warn!("admin accept error: {e}"),
                },
            }
        }
    }

    async fn serve(&self, stream: TcpStream, peer: SocketAddr) {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();

        loop {
            line.clear();
            let read = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                read = read_line_limited(&mut reader, &mut line, MAX_LINE) => read,
            };
            match read {
                Ok(0) => return,
                Ok(_) => {}
                Err(_) if line.len() > MAX_LINE => {
                    warn!("admin client {peer} sent more than {MAX_LINE} bytes without a newline");
                    let _ = writer
                        .write_all(render_reply(Err(AdminError::LineTooLong(MAX_LINE))).as_bytes())
                        .await;
                    return;
                }
                Err(e) => {
                    debug!("admin read error from {peer}: {e}");
                    return;
                }
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let result = match AdminCommand::parse(trimmed) {
                Ok(cmd) => {
                    let name = cmd.name();
                    let result = execute(&self.coordinator, cmd).await;
                    metrics::record_command(name, result.is_err());
                    result
                }
                Err(e) => Err(e),
            };
            if let Err(e) = writer.write_all(render_reply(result).as_bytes()).await {
                debug!("admin write error to {peer}: {e}");
                return;
            }
        }
    }

    /// Stops accepting and closes open connections. Idempotent.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}
