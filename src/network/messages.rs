//! Message catalogue exchanged with clients, peers and the monitor.

use crate::error::OpError;
use crate::map::{Incremental, OsdMap};
use crate::pg::{LogEntry, PgInfo, PgStats, ScrubMap};
use crate::types::{ConnectionId, EntityName, Epoch, Eversion, OsdId, PgId, Tid};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An inbound message together with its origin.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Who sent the message.
    pub from: EntityName,

    /// Connection the message arrived on.
    pub conn: ConnectionId,

    pub msg: Message,
}

impl Envelope {
    pub fn new(from: EntityName, conn: ConnectionId, msg: Message) -> Self {
        Self { from, conn, msg }
    }
}

/// Every message the node sends or receives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    OsdOp(OsdOp),
    OsdOpReply(OsdOpReply),
    SubOp(SubOp),
    SubOpReply(SubOpReply),
    PgNotify(PgNotify),
    PgQuery(PgQuery),
    PgLog(PgLogMsg),
    PgRemove(PgRemove),
    PgCreate(PgCreate),
    RepScrub(RepScrub),
    RepScrubMap(RepScrubMap),
    Ping(Ping),
    OsdMap(MapUpdate),
    /// Ask the monitor for maps starting at `start`.
    MapSubscribe { start: Epoch },
    Command(CommandRequest),
    CommandReply(CommandReply),
    PgStats(PgStatsReport),
    PgStatsAck { tid: Tid },
    Failure(FailureReport),
    /// Ask the monitor to raise this node's `up_thru`.
    Alive { want: Epoch },
    Boot(BootRequest),
    WatchNotify(WatchNotify),
}

/// Routing class of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageClass {
    ClientOp,
    SubOp,
    PeeringControl,
    Heartbeat,
    MapUpdate,
    Command,
    MonitorControl,
    /// Messages this node only ever sends.
    Outbound,
}

impl MessageClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageClass::ClientOp => "client_op",
            MessageClass::SubOp => "sub_op",
            MessageClass::PeeringControl => "peering",
            MessageClass::Heartbeat => "heartbeat",
            MessageClass::MapUpdate => "map",
            MessageClass::Command => "command",
            MessageClass::MonitorControl => "monitor",
            MessageClass::Outbound => "outbound",
        }
    }
}

impl Message {
    /// Classify the message for dispatch.
    pub fn class(&self) -> MessageClass {
        match self {
            Message::OsdOp(_) => MessageClass::ClientOp,
            Message::SubOp(_) | Message::SubOpReply(_) => MessageClass::SubOp,
            Message::PgNotify(_)
            | Message::PgQuery(_)
            | Message::PgLog(_)
            | Message::PgRemove(_)
            | Message::RepScrub(_)
            | Message::RepScrubMap(_) => MessageClass::PeeringControl,
            Message::Ping(_) => MessageClass::Heartbeat,
            Message::OsdMap(_) => MessageClass::MapUpdate,
            Message::Command(_) => MessageClass::Command,
            Message::PgCreate(_) | Message::PgStatsAck { .. } => MessageClass::MonitorControl,
            Message::OsdOpReply(_)
            | Message::MapSubscribe { .. }
            | Message::CommandReply(_)
            | Message::PgStats(_)
            | Message::Failure(_)
            | Message::Alive { .. }
            | Message::Boot(_)
            | Message::WatchNotify(_) => MessageClass::Outbound,
        }
    }

    /// Epoch the sender had when it sent the message, if it carries one.
    pub fn epoch(&self) -> Option<Epoch> {
        match self {
            Message::OsdOp(m) => Some(m.epoch),
            Message::SubOp(m) => Some(m.epoch),
            Message::SubOpReply(m) => Some(m.epoch),
            Message::PgNotify(m) => Some(m.epoch),
            Message::PgQuery(m) => Some(m.epoch),
            Message::PgLog(m) => Some(m.epoch),
            Message::PgRemove(m) => Some(m.epoch),
            Message::RepScrub(m) => Some(m.epoch),
            Message::RepScrubMap(m) => Some(m.epoch),
            Message::Ping(m) => Some(m.epoch),
            _ => None,
        }
    }
}

/// Client operation on one object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    Read,
    Stat,
    Write { data: Bytes },
    Delete,
    Watch { cookie: u64 },
    Unwatch { cookie: u64 },
    Notify { payload: Bytes },
    NotifyAck { notify_id: u64, cookie: u64 },
}

impl OpKind {
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            OpKind::Write { .. } | OpKind::Delete | OpKind::Watch { .. } | OpKind::Unwatch { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Read => "read",
            OpKind::Stat => "stat",
            OpKind::Write { .. } => "write",
            OpKind::Delete => "delete",
            OpKind::Watch { .. } => "watch",
            OpKind::Unwatch { .. } => "unwatch",
            OpKind::Notify { .. } => "notify",
            OpKind::NotifyAck { .. } => "notify-ack",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OsdOp {
    pub tid: Tid,
    pub pgid: PgId,
    pub oid: String,
    /// Map epoch the client computed the target with.
    pub epoch: Epoch,
    pub kind: OpKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpOutput {
    pub version: Eversion,
    pub data: Option<Bytes>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OsdOpReply {
    pub tid: Tid,
    pub pgid: PgId,
    /// The replying node's current epoch.
    pub epoch: Epoch,
    pub result: Result<OpOutput, OpError>,
}

/// Primary-to-replica operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SubOpKind {
    /// Apply a replicated client mutation.
    Modify { entry: LogEntry, data: Option<Bytes> },
    /// Install this version of an object (recovery push).
    Push {
        oid: String,
        version: Eversion,
        data: Option<Bytes>,
    },
    /// Send back the current version of an object (recovery pull).
    Pull { oid: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubOp {
    pub tid: Tid,
    pub pgid: PgId,
    pub epoch: Epoch,
    pub kind: SubOpKind,
}

/// Object contents returned for a pull. `data` is `None` for a deleted object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PulledObject {
    pub oid: String,
    pub version: Eversion,
    pub data: Option<Bytes>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubOpReply {
    pub tid: Tid,
    pub pgid: PgId,
    pub epoch: Epoch,
    pub result: Result<Option<PulledObject>, OpError>,
}

/// Non-primary to primary: "this is what I have".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PgNotify {
    pub epoch: Epoch,
    pub infos: Vec<PgInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryKind {
    Info,
    /// Send log entries newer than `since`.
    Log { since: Eversion },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PgQuery {
    pub epoch: Epoch,
    pub queries: Vec<(PgId, QueryKind)>,
}

/// Log transfer: a reply to a log query, or the primary's activation message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PgLogMsg {
    pub epoch: Epoch,
    pub info: PgInfo,
    pub entries: Vec<LogEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PgRemove {
    pub epoch: Epoch,
    pub pgs: Vec<PgId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PgCreate {
    pub epoch: Epoch,
    /// PGs to create with the epoch their pool created them in.
    pub pgs: BTreeMap<PgId, Epoch>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepScrub {
    pub pgid: PgId,
    pub epoch: Epoch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepScrubMap {
    pub pgid: PgId,
    pub epoch: Epoch,
    pub map: ScrubMap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PingOp {
    Ping,
    Reply,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ping {
    pub op: PingOp,
    pub epoch: Epoch,
}

/// A batch of maps. `full` and `incrementals` are keyed by epoch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MapUpdate {
    pub full: BTreeMap<Epoch, OsdMap>,
    pub incrementals: BTreeMap<Epoch, Incremental>,
}

impl MapUpdate {
    pub fn first(&self) -> Option<Epoch> {
        let f = self.full.keys().next().copied();
        let i = self.incrementals.keys().next().copied();
        match (f, i) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn last(&self) -> Option<Epoch> {
        let f = self.full.keys().next_back().copied();
        let i = self.incrementals.keys().next_back().copied();
        f.max(i)
    }

    pub fn is_empty(&self) -> bool {
        self.full.is_empty() && self.incrementals.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    pub tid: Tid,
    pub tokens: Vec<String>,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandReply {
    pub tid: Tid,
    /// Zero on success, a negative errno otherwise.
    pub code: i32,
    pub output: String,
}

/// Per-PG stats as reported to the monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PgStatEntry {
    pub state: String,
    pub last_update: Eversion,
    pub reported_epoch: Epoch,
    pub stats: PgStats,
}

/// Node-wide usage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OsdStat {
    pub num_pgs: u64,
    pub num_objects: u64,
    pub num_bytes: u64,
    pub heartbeat_peers: Vec<OsdId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PgStatsReport {
    pub tid: Tid,
    pub epoch: Epoch,
    pub pgs: BTreeMap<PgId, PgStatEntry>,
    pub osd_stat: OsdStat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    pub target: OsdId,
    pub epoch: Epoch,
    pub failed_for_secs: u64,
    /// Cancels an earlier report: the peer answered again.
    pub still_alive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootRequest {
    pub osd: OsdId,
    pub osd_fsid: uuid::Uuid,
    /// Newest map this node has.
    pub epoch: Epoch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchNotify {
    pub pgid: PgId,
    pub oid: String,
    pub notify_id: u64,
    pub cookie: u64,
    pub payload: Bytes,
}
