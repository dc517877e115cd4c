//! Per-connection sessions.

use crate::types::{ConnectionId, EntityName, Epoch, PgId};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;

/// What a session may do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OsdCaps {
    pub read: bool,
    pub write: bool,
}

impl OsdCaps {
    pub const fn all() -> Self {
        Self {
            read: true,
            write: true,
        }
    }

    pub const fn read_only() -> Self {
        Self {
            read: true,
            write: false,
        }
    }

    pub fn allows(&self, is_write: bool) -> bool {
        if is_write {
            self.write
        } else {
            self.read
        }
    }
}

/// A watch registered through this session.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct WatchRef {
    pub pgid: PgId,
    pub oid: String,
    pub cookie: u64,
}

#[derive(Debug, Default)]
struct SessionState {
    last_sent_epoch: Epoch,
    watches: BTreeSet<WatchRef>,
    closed: bool,
}

/// State of one connected entity.
#[derive(Debug)]
pub struct Session {
    pub entity: EntityName,
    pub conn: ConnectionId,
    pub caps: OsdCaps,
    state: Mutex<SessionState>,
}

impl Session {
    pub fn new(entity: EntityName, conn: ConnectionId, caps: OsdCaps) -> Self {
        Self {
            entity,
            conn,
            caps,
            state: Mutex::new(SessionState::default()),
        }
    }

    pub fn last_sent_epoch(&self) -> Epoch {
        self.state.lock().last_sent_epoch
    }

    /// Record that maps through `epoch` were sent. Returns the previous value.
    pub fn set_last_sent_epoch(&self, epoch: Epoch) -> Epoch {
        let mut state = self.state.lock();
        let prev = state.last_sent_epoch;
        state.last_sent_epoch = prev.max(epoch);
        prev
    }

    /// Register a watch. Fails once the session has been closed.
    pub fn add_watch(&self, watch: WatchRef) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.watches.insert(watch);
        true
    }

    pub fn remove_watch(&self, watch: &WatchRef) {
        self.state.lock().watches.remove(watch);
    }

    /// Close the session and hand back its watches.
    pub fn close(&self) -> BTreeSet<WatchRef> {
        let mut state = self.state.lock();
        state.closed = true;
        std::mem::take(&mut state.watches)
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

/// Sessions by connection.
#[derive(Debug, Default)]
pub struct SessionMap {
    sessions: DashMap<ConnectionId, Arc<Session>>,
}

impl SessionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Session) -> Arc<Session> {
        let session = Arc::new(session);
        self.sessions.insert(session.conn, session.clone());
        session
    }

    pub fn get(&self, conn: ConnectionId) -> Option<Arc<Session>> {
        self.sessions.get(&conn).map(|s| s.value().clone())
    }

    pub fn contains(&self, conn: ConnectionId) -> bool {
        self.sessions.contains_key(&conn)
    }

    pub fn remove(&self, conn: ConnectionId) -> Option<Arc<Session>> {
        self.sessions.remove(&conn).map(|(_, s)| s)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
