//! Object storage collaborator.
//!
//! The scheduling core never touches disk directly. Everything it persists
//! (maps, the superblock, PG metadata, object data written by client ops)
//! goes through an [`ObjectStore`] as a [`Transaction`] that either commits
//! as a whole or not at all.

mod memory;

pub use memory::MemStore;

use crate::error::StorageError;
use crate::types::PgId;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Collection holding node metadata: maps, superblock.
pub const META_COLLECTION: &str = "meta";

/// Object in a PG collection holding the encoded `PgInfo`.
pub const PGINFO_OID: &str = "_pginfo";

/// Object in a PG collection holding the encoded PG log.
pub const PGLOG_OID: &str = "_pglog";

/// Collection id of a PG's head objects.
pub fn pg_collection(pgid: PgId) -> String {
    format!("{}_head", pgid)
}

/// Inverse of [`pg_collection`].
pub fn parse_pg_collection(cid: &str) -> Option<PgId> {
    cid.strip_suffix("_head")?.parse().ok()
}

/// Whether an object name is PG metadata rather than user data.
pub fn is_pg_meta(oid: &str) -> bool {
    oid.starts_with('_')
}

/// A single mutation inside a transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum TxOp {
    CreateCollection { cid: String },
    /// Removes the collection with every object in it.
    RemoveCollection { cid: String },
    Write { cid: String, oid: String, data: Bytes },
    Remove { cid: String, oid: String },
    SetAttr {
        cid: String,
        oid: String,
        key: String,
        value: Bytes,
    },
    /// Moves an object between collections, keeping its data and attributes.
    Move { from: String, to: String, oid: String },
}

/// An ordered batch of mutations applied atomically.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transaction {
    ops: Vec<TxOp>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_collection(&mut self, cid: impl Into<String>) -> &mut Self {
        self.ops.push(TxOp::CreateCollection { cid: cid.into() });
        self
    }

    pub fn remove_collection(&mut self, cid: impl Into<String>) -> &mut Self {
        self.ops.push(TxOp::RemoveCollection { cid: cid.into() });
        self
    }

    pub fn write(
        &mut self,
        cid: impl Into<String>,
        oid: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> &mut Self {
        self.ops.push(TxOp::Write {
            cid: cid.into(),
            oid: oid.into(),
            data: data.into(),
        });
        self
    }

    /// Write a bincode-encoded value.
    pub fn write_encoded<T: Serialize>(
        &mut self,
        cid: impl Into<String>,
        oid: impl Into<String>,
        value: &T,
    ) -> crate::Result<&mut Self> {
        let data = bincode::serialize(value)?;
        Ok(self.write(cid, oid, data))
    }

    pub fn remove(&mut self, cid: impl Into<String>, oid: impl Into<String>) -> &mut Self {
        self.ops.push(TxOp::Remove {
            cid: cid.into(),
            oid: oid.into(),
        });
        self
    }

    pub fn set_attr(
        &mut self,
        cid: impl Into<String>,
        oid: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<Bytes>,
    ) -> &mut Self {
        self.ops.push(TxOp::SetAttr {
            cid: cid.into(),
            oid: oid.into(),
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn move_object(
        &mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        oid: impl Into<String>,
    ) -> &mut Self {
        self.ops.push(TxOp::Move {
            from: from.into(),
            to: to.into(),
            oid: oid.into(),
        });
        self
    }

    pub fn ops(&self) -> &[TxOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// The storage engine beneath each PG.
pub trait ObjectStore: Send + Sync + 'static {
    fn begin_transaction(&self) -> Transaction {
        Transaction::new()
    }

    /// Apply every op of `tx` or none of them.
    fn commit(&self, tx: Transaction) -> Result<(), StorageError>;

    fn read(&self, cid: &str, oid: &str) -> Option<Bytes>;

    fn get_attr(&self, cid: &str, oid: &str, key: &str) -> Option<Bytes>;

    fn exists(&self, cid: &str, oid: &str) -> bool;

    fn collection_exists(&self, cid: &str) -> bool;

    fn list_collections(&self) -> Vec<String>;

    /// Object names in `cid`, sorted.
    fn list_objects(&self, cid: &str) -> Vec<String>;
}

/// Read and decode a bincode-encoded object. `Ok(None)` if it does not exist.
pub fn read_decoded<T: DeserializeOwned>(
    store: &dyn ObjectStore,
    cid: &str,
    oid: &str,
) -> Result<Option<T>, StorageError> {
    let Some(data) = store.read(cid, oid) else {
        return Ok(None);
    };
    bincode::deserialize(&data)
        .map(Some)
        .map_err(|e| StorageError::Corrupt {
            cid: cid.to_string(),
            oid: oid.to_string(),
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pg_collection_names() {
        let pgid = PgId::new(2, 0xa);
        let cid = pg_collection(pgid);
        assert_eq!(cid, "2.a_head");
        assert_eq!(parse_pg_collection(&cid), Some(pgid));
        assert_eq!(parse_pg_collection(META_COLLECTION), None);
    }

    #[test]
    fn test_transaction_builder() {
        let mut tx = Transaction::new();
        tx.create_collection("c")
            .write("c", "obj", Bytes::from_static(b"x"))
            .set_attr("c", "obj", "k", Bytes::from_static(b"v"));
        assert_eq!(tx.len(), 3);
        assert!(matches!(tx.ops()[0], TxOp::CreateCollection { .. }));
    }
}
