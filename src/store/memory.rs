//! In-memory object store.

use super::{ObjectStore, Transaction, TxOp};
use crate::error::StorageError;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

#[derive(Debug, Clone, Default)]
struct Object {
    data: Bytes,
    attrs: BTreeMap<String, Bytes>,
}

type Collections = BTreeMap<String, BTreeMap<String, Object>>;

/// Object store backed by ordered maps.
///
/// Commits are atomic: ops are applied to a copy of the collections and the
/// copy is swapped in only when every op succeeded. Failures can be injected
/// with [`MemStore::fail_next_commits`].
#[derive(Debug, Default)]
pub struct MemStore {
    collections: RwLock<Collections>,

    /// Successfully committed transactions.
    commits: AtomicU64,

    /// Number of upcoming commits to reject.
    fail_commits: AtomicUsize,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` commits fail with `StorageError::CommitFailed`.
    pub fn fail_next_commits(&self, n: usize) {
        self.fail_commits.store(n, Ordering::SeqCst);
    }

    /// Number of transactions committed so far.
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    fn take_injected_failure(&self) -> bool {
        self.fail_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn apply(colls: &mut Collections, op: TxOp) -> Result<(), StorageError> {
        match op {
            TxOp::CreateCollection { cid } => {
                if colls.contains_key(&cid) {
                    return Err(StorageError::CollectionExists(cid));
                }
                colls.insert(cid, BTreeMap::new());
            }
            TxOp::RemoveCollection { cid } => {
                colls
                    .remove(&cid)
                    .ok_or(StorageError::CollectionNotFound(cid))?;
            }
            TxOp::Write { cid, oid, data } => {
                let coll = colls
                    .get_mut(&cid)
                    .ok_or(StorageError::CollectionNotFound(cid))?;
                coll.entry(oid).or_default().data = data;
            }
            TxOp::Remove { cid, oid } => {
                let coll = colls
                    .get_mut(&cid)
                    .ok_or(StorageError::CollectionNotFound(cid))?;
                coll.remove(&oid);
            }
            TxOp::SetAttr {
                cid,
                oid,
                key,
                value,
            } => {
                let coll = colls
                    .get_mut(&cid)
                    .ok_or(StorageError::CollectionNotFound(cid))?;
                coll.entry(oid).or_default().attrs.insert(key, value);
            }
            TxOp::Move { from, to, oid } => {
                if !colls.contains_key(&to) {
                    return Err(StorageError::CollectionNotFound(to));
                }
                let obj = colls
                    .get_mut(&from)
                    .ok_or_else(|| StorageError::CollectionNotFound(from.clone()))?
                    .remove(&oid);
                if let (Some(obj), Some(dest)) = (obj, colls.get_mut(&to)) {
                    dest.insert(oid, obj);
                }
            }
        }
        Ok(())
    }
}

impl ObjectStore for MemStore {
    fn commit(&self, tx: Transaction) -> Result<(), StorageError> {
        if self.take_injected_failure() {
            tracing::debug!(ops = tx.len(), "injected commit failure");
            return Err(StorageError::CommitFailed("injected failure".to_string()));
        }

        let mut colls = self.collections.write();
        let mut staged = colls.clone();
        for op in tx.ops {
            Self::apply(&mut staged, op)?;
        }
        *colls = staged;
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn read(&self, cid: &str, oid: &str) -> Option<Bytes> {
        self.collections
            .read()
            .get(cid)
            .and_then(|c| c.get(oid))
            .map(|o| o.data.clone())
    }

    fn get_attr(&self, cid: &str, oid: &str, key: &str) -> Option<Bytes> {
        self.collections
            .read()
            .get(cid)
            .and_then(|c| c.get(oid))
            .and_then(|o| o.attrs.get(key).cloned())
    }

    fn exists(&self, cid: &str, oid: &str) -> bool {
        self.collections
            .read()
            .get(cid)
            .is_some_and(|c| c.contains_key(oid))
    }

    fn collection_exists(&self, cid: &str) -> bool {
        self.collections.read().contains_key(cid)
    }

    fn list_collections(&self) -> Vec<String> {
        self.collections.read().keys().cloned().collect()
    }

    fn list_objects(&self, cid: &str) -> Vec<String> {
        self.collections
            .read()
            .get(cid)
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default()
    }
}
