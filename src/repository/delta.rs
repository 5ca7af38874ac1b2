// src/repository/delta.rs

//! Differential repository updates (EAPI 3)
//!
//! A delta moves a store from the snapshot with checksum `base` to the one
//! with checksum `target`. It travels as zstd-compressed JSON. Applying a
//! delta to a store already at `target` does nothing, so applying twice is
//! the same as applying once.

use crate::db::models::{Notice, Package, PackageSet, StoreMetadata};
use crate::error::{Error, Result};
use crate::store::{self, PackageRecord, StoreSnapshot};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Delta wire format version
pub const DELTA_FORMAT: u32 = 1;

/// zstd level used for published metadata
pub const COMPRESSION_LEVEL: i32 = 19;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    pub format: u32,
    pub base: String,
    pub target: String,
    /// Qualified atoms absent from the target
    pub removed: Vec<String>,
    /// New or changed packages
    pub upserted: Vec<PackageRecord>,
    /// New or changed notices
    pub notices: Vec<Notice>,
    pub removed_notices: Vec<i64>,
    /// Replacement package sets, when they changed
    #[serde(default)]
    pub sets: Option<BTreeMap<String, Vec<String>>>,
}

/// What applying a delta did
#[derive(Debug, Clone, Default)]
pub struct ApplyOutcome {
    /// False when the store already was at the target
    pub applied: bool,
    /// Packages removed by the delta
    pub dropped: Vec<Package>,
}

impl Delta {
    /// Compute the delta turning `base` into `target`
    pub fn between(base: &StoreSnapshot, target: &StoreSnapshot) -> Self {
        let mut base = base.clone();
        base.canonicalize();
        let mut target = target.clone();
        target.canonicalize();

        let old: BTreeMap<&str, &PackageRecord> =
            base.packages.iter().map(|p| (p.atom.as_str(), p)).collect();
        let new: BTreeSet<&str> = target.packages.iter().map(|p| p.atom.as_str()).collect();

        let removed = old
            .keys()
            .filter(|atom| !new.contains(*atom))
            .map(|atom| atom.to_string())
            .collect();
        let upserted = target
            .packages
            .iter()
            .filter(|p| old.get(p.atom.as_str()).copied() != Some(*p))
            .cloned()
            .collect();

        let old_notices: BTreeMap<Option<i64>, &Notice> =
            base.notices.iter().map(|n| (n.id, n)).collect();
        let new_ids: BTreeSet<Option<i64>> = target.notices.iter().map(|n| n.id).collect();
        let notices = target
            .notices
            .iter()
            .filter(|n| old_notices.get(&n.id).copied() != Some(*n))
            .cloned()
            .collect();
        let removed_notices = base
            .notices
            .iter()
            .filter(|n| !new_ids.contains(&n.id))
            .filter_map(|n| n.id)
            .collect();

        Self {
            format: DELTA_FORMAT,
            base: base.checksum(),
            target: target.checksum(),
            removed,
            upserted,
            notices,
            removed_notices,
            sets: (base.sets != target.sets).then(|| target.sets.clone()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.removed.is_empty()
            && self.upserted.is_empty()
            && self.notices.is_empty()
            && self.removed_notices.is_empty()
            && self.sets.is_none()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(self)
            .map_err(|e| Error::ParseError(format!("Cannot serialize delta: {}", e)))?;
        Ok(zstd::encode_all(json.as_slice(), COMPRESSION_LEVEL)?)
    }

    /// Decode a published delta; anything unreadable is a corrupt repository
    pub fn decode(repository: &str, bytes: &[u8]) -> Result<Self> {
        let corrupt = |reason: String| Error::CorruptRepository {
            repository: repository.to_string(),
            reason,
        };
        let json = zstd::decode_all(bytes).map_err(|e| corrupt(format!("delta: {}", e)))?;
        let delta: Delta =
            serde_json::from_slice(&json).map_err(|e| corrupt(format!("delta: {}", e)))?;
        if delta.format != DELTA_FORMAT {
            return Err(corrupt(format!("unsupported delta format {}", delta.format)));
        }
        Ok(delta)
    }

    /// Apply to a store; run inside a transaction so failures roll back
    ///
    /// Fails with `CorruptRepository` when the store is neither at `base`
    /// nor at `target`, or when the result does not hash to `target`.
    pub fn apply(&self, conn: &Connection, repository: &str, branch: &str) -> Result<ApplyOutcome> {
        let corrupt = |reason: String| Error::CorruptRepository {
            repository: repository.to_string(),
            reason,
        };

        let current = store::recorded_checksum(conn)?;
        if current.as_deref() == Some(self.target.as_str()) {
            debug!("{} already at {}", repository, self.target);
            return Ok(ApplyOutcome::default());
        }
        if current.as_deref() != Some(self.base.as_str()) {
            return Err(corrupt(format!(
                "delta base {} does not match local {}",
                self.base,
                current.as_deref().unwrap_or("<none>")
            )));
        }

        let mut dropped = Vec::new();
        for atom in &self.removed {
            if let Some(package) = store::remove_by_atom(conn, atom)? {
                dropped.push(package);
            }
        }
        for record in &self.upserted {
            store::upsert_package(conn, branch, record)?;
        }
        for id in &self.removed_notices {
            Notice::delete(conn, *id)?;
        }
        for notice in &self.notices {
            notice.upsert(conn)?;
        }
        if let Some(sets) = &self.sets {
            PackageSet::delete_all(conn)?;
            for (name, members) in sets {
                for spec in members {
                    PackageSet::new(name.clone(), spec.clone()).insert(conn)?;
                }
            }
        }

        let actual = store::snapshot(conn)?.checksum();
        if actual != self.target {
            return Err(corrupt(format!(
                "delta result {} does not match target {}",
                actual, self.target
            )));
        }

        StoreMetadata::set(conn, StoreMetadata::CHECKSUM, &self.target)?;
        StoreMetadata::set(conn, StoreMetadata::BRANCH, branch)?;
        info!(
            "Applied delta to {}: -{} +{} packages",
            repository,
            self.removed.len(),
            self.upserted.len()
        );
        Ok(ApplyOutcome {
            applied: true,
            dropped,
        })
    }
}
