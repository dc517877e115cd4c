//! Persisted per-PG metadata: info, history, stats and the op log.

use crate::types::{Epoch, Eversion, PgId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Interval bookkeeping used to judge message freshness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PgHistory {
    /// Epoch the pool created this PG in.
    pub epoch_created: Epoch,
    /// Epoch of the last successful activation.
    pub last_epoch_started: Epoch,
    /// Epoch the PG was last fully recovered in.
    pub last_epoch_clean: Epoch,
    /// First epoch of the current up/acting interval.
    pub same_interval_since: Epoch,
    /// First epoch with the current primary.
    pub same_primary_since: Epoch,
    /// Unix seconds of the last completed scrub.
    pub last_scrub_stamp: u64,
}

impl PgHistory {
    /// Fold in history learned from a peer.
    pub fn merge(&mut self, other: &PgHistory) {
        self.epoch_created = self.epoch_created.max(other.epoch_created);
        self.last_epoch_started = self.last_epoch_started.max(other.last_epoch_started);
        self.last_epoch_clean = self.last_epoch_clean.max(other.last_epoch_clean);
        self.last_scrub_stamp = self.last_scrub_stamp.max(other.last_scrub_stamp);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PgStats {
    pub num_objects: u64,
    pub num_bytes: u64,
    pub num_scrub_errors: u64,
}

/// What a node knows about its copy of a PG.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PgInfo {
    pub pgid: PgId,
    /// Newest applied update.
    pub last_update: Eversion,
    /// Every update up to here is present locally.
    pub last_complete: Eversion,
    /// Oldest update still covered by the log.
    pub log_tail: Eversion,
    pub history: PgHistory,
    pub stats: PgStats,
    /// Snapshots whose clones have been trimmed.
    pub purged_snaps: BTreeSet<u64>,
}

impl PgInfo {
    pub fn new(pgid: PgId) -> Self {
        Self {
            pgid,
            last_update: Eversion::default(),
            last_complete: Eversion::default(),
            log_tail: Eversion::default(),
            history: PgHistory::default(),
            stats: PgStats::default(),
            purged_snaps: BTreeSet::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.last_update == Eversion::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogOp {
    Modify,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub version: Eversion,
    pub oid: String,
    pub op: LogOp,
}

/// Ordered record of recent updates, `(tail, head]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PgLog {
    entries: Vec<LogEntry>,
    tail: Eversion,
    head: Eversion,
}

impl PgLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty log positioned at `at`.
    pub fn starting_at(at: Eversion) -> Self {
        Self {
            entries: Vec::new(),
            tail: at,
            head: at,
        }
    }

    pub fn head(&self) -> Eversion {
        self.head
    }

    pub fn tail(&self) -> Eversion {
        self.tail
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append an entry. Versions must increase.
    pub fn append(&mut self, entry: LogEntry) {
        assert!(
            entry.version > self.head,
            "log entry {} not after head {}",
            entry.version,
            self.head
        );
        self.head = entry.version;
        self.entries.push(entry);
    }

    /// Entries newer than `since`.
    pub fn entries_after(&self, since: Eversion) -> Vec<LogEntry> {
        let start = self.entries.partition_point(|e| e.version <= since);
        self.entries[start..].to_vec()
    }

    /// Whether `since` is recent enough to catch up from this log alone.
    pub fn covers(&self, since: Eversion) -> bool {
        since >= self.tail
    }

    /// Keep only the newest `keep` entries. Returns the number dropped.
    pub fn trim_to_len(&mut self, keep: usize) -> usize {
        let drop = self.entries.len().saturating_sub(keep);
        if drop == 0 {
            return 0;
        }
        self.tail = self.entries[drop - 1].version;
        self.entries.drain(..drop);
        drop
    }

    /// Latest needed version per object for entries newer than `since`.
    pub fn missing_since(&self, since: Eversion) -> MissingSet {
        let mut missing = MissingSet::new();
        for entry in self.entries_after(since) {
            missing.insert(entry.oid, entry.version);
        }
        missing
    }
}

/// Objects a node lacks, with the version it needs.
pub type MissingSet = BTreeMap<String, Eversion>;

/// Size and checksum of one object as seen by a scrub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectDigest {
    pub size: u64,
    pub crc: u32,
}

/// Digests of every user object in a PG.
pub type ScrubMap = BTreeMap<String, ObjectDigest>;

/// Count objects whose digests disagree with the authoritative map.
pub fn compare_scrub_maps(authoritative: &ScrubMap, replicas: &[&ScrubMap]) -> usize {
    let mut names: BTreeSet<&String> = authoritative.keys().collect();
    for map in replicas {
        names.extend(map.keys());
    }
    names
        .into_iter()
        .filter(|name| {
            let expected = authoritative.get(*name);
            replicas.iter().any(|map| map.get(*name) != expected)
        })
        .count()
}
