//! Persisted node superblock.
//!
//! # Format
//!
//! ```text
//! ┌──────────────────────────────┐
//! │ MAGIC: [u8; 4] = "OSDS"      │
//! ├──────────────────────────────┤
//! │ VERSION: u32                 │
//! ├──────────────────────────────┤
//! │ BODY: bincode(Superblock)    │
//! ├──────────────────────────────┤
//! │ CRC32: u32 (magic..body)     │
//! └──────────────────────────────┘
//! ```

use crate::error::SuperblockError;
use crate::types::{Epoch, OsdId};
use crc::{Crc, CRC_32_ISCSI};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// CRC-32 calculator (iSCSI polynomial)
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const MAGIC: [u8; 4] = [b'O', b'S', b'D', b'S'];

const VERSION: u32 = 1;

const HEADER_SIZE: usize = 8;

/// Object name of the superblock in the meta collection.
pub const SUPERBLOCK_OID: &str = "osd_superblock";

/// Feature bits understood by this build.
pub mod features {
    pub const BASE: u64 = 1;
    pub const PGINFO: u64 = 2;
    pub const OLOC: u64 = 3;
    pub const LEC: u64 = 4;
    pub const CATEGORIES: u64 = 5;
    pub const SNAPMAPPER: u64 = 6;
}

/// Three-tier feature set.
///
/// A reader must understand every `incompat` feature to use the data and
/// every `ro_compat` feature to write it. `compat` features can be ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompatSet {
    pub compat: BTreeMap<u64, String>,
    pub ro_compat: BTreeMap<u64, String>,
    pub incompat: BTreeMap<u64, String>,
}

impl CompatSet {
    /// The features this build writes and understands.
    pub fn supported() -> Self {
        let mut set = CompatSet::default();
        set.incompat
            .insert(features::BASE, "initial feature set".to_string());
        set.incompat
            .insert(features::PGINFO, "pginfo object".to_string());
        set.incompat
            .insert(features::OLOC, "object locator".to_string());
        set.incompat.insert(features::LEC, "last_epoch_clean".to_string());
        set.ro_compat
            .insert(features::CATEGORIES, "categories".to_string());
        set.compat
            .insert(features::SNAPMAPPER, "snap clone naming".to_string());
        set
    }

    /// Whether data written with `other` can be read and written by us.
    pub fn writeable(&self, other: &CompatSet) -> bool {
        self.readable(other)
            && other
                .ro_compat
                .keys()
                .all(|k| self.ro_compat.contains_key(k))
    }

    /// Whether data written with `other` can be read by us.
    pub fn readable(&self, other: &CompatSet) -> bool {
        other.incompat.keys().all(|k| self.incompat.contains_key(k))
    }

    /// Features in `other` we do not understand well enough to write.
    pub fn unsupported(&self, other: &CompatSet) -> Vec<String> {
        let incompat = other
            .incompat
            .iter()
            .filter(|(k, _)| !self.incompat.contains_key(k));
        let ro = other
            .ro_compat
            .iter()
            .filter(|(k, _)| !self.ro_compat.contains_key(k));
        incompat.chain(ro).map(|(_, name)| name.clone()).collect()
    }

    /// Add every feature of `other` to this set.
    pub fn merge(&mut self, other: &CompatSet) {
        self.compat.extend(other.compat.clone());
        self.ro_compat.extend(other.ro_compat.clone());
        self.incompat.extend(other.incompat.clone());
    }
}

/// Node identity and map bookkeeping, rewritten on every epoch advance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub cluster_fsid: uuid::Uuid,
    pub osd_fsid: uuid::Uuid,
    pub whoami: OsdId,
    /// Epoch of the map the node is operating at.
    pub current_epoch: Epoch,
    /// Oldest map still stored.
    pub oldest_map: Epoch,
    /// Newest map stored.
    pub newest_map: Epoch,
    /// Every PG was clean through this epoch.
    pub clean_thru: Epoch,
    /// Epoch at which the store was last mounted.
    pub mounted: Epoch,
    pub compat_features: CompatSet,
}

impl Superblock {
    /// A fresh superblock for a newly created store.
    pub fn new(whoami: OsdId) -> Self {
        Self {
            cluster_fsid: uuid::Uuid::nil(),
            osd_fsid: uuid::Uuid::new_v4(),
            whoami,
            current_epoch: 0,
            oldest_map: 0,
            newest_map: 0,
            clean_thru: 0,
            mounted: 0,
            compat_features: CompatSet::supported(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, SuperblockError> {
        let body = bincode::serialize(self).map_err(|e| SuperblockError::Decode(e.to_string()))?;
        let mut out = Vec::with_capacity(HEADER_SIZE + body.len() + 4);
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&VERSION.to_le_bytes());
        out.extend_from_slice(&body);

        let mut digest = CRC32.digest();
        digest.update(&out);
        let crc = digest.finalize();
        out.extend_from_slice(&crc.to_le_bytes());
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<Self, SuperblockError> {
        if data.len() < HEADER_SIZE + 4 {
            return Err(SuperblockError::Decode(format!(
                "superblock too short: {} bytes",
                data.len()
            )));
        }
        if data[0..4] != MAGIC {
            return Err(SuperblockError::BadMagic);
        }

        let crc_offset = data.len() - 4;
        let mut stored = [0u8; 4];
        stored.copy_from_slice(&data[crc_offset..]);
        let stored_crc = u32::from_le_bytes(stored);

        let mut digest = CRC32.digest();
        digest.update(&data[..crc_offset]);
        let computed_crc = digest.finalize();
        if stored_crc != computed_crc {
            return Err(SuperblockError::ChecksumMismatch {
                expected: stored_crc,
                actual: computed_crc,
            });
        }

        let mut version = [0u8; 4];
        version.copy_from_slice(&data[4..8]);
        let version = u32::from_le_bytes(version);
        if version != VERSION {
            return Err(SuperblockError::UnsupportedVersion(version));
        }

        bincode::deserialize(&data[HEADER_SIZE..crc_offset])
            .map_err(|e| SuperblockError::Decode(e.to_string()))
    }

    /// Check that this build can mount the store as `whoami`.
    pub fn check_mountable(&self, whoami: OsdId) -> Result<(), SuperblockError> {
        if self.whoami != whoami {
            return Err(SuperblockError::WrongOsd {
                expected: whoami,
                found: self.whoami,
            });
        }
        let supported = CompatSet::supported();
        if !supported.writeable(&self.compat_features) {
            return Err(SuperblockError::IncompatibleFeatures(
                supported.unsupported(&self.compat_features),
            ));
        }
        Ok(())
    }
}
