// src/repository/mirror.rs

//! Publishing a store as a mirror directory
//!
//! Writes the remote layout clients sync from. Previously published
//! snapshots are kept under `history/` so every publish can regenerate the
//! deltas leading from them to the new snapshot. The checksum file is
//! written last: a client that sees the new checksum finds the data too.

use super::delta::{COMPRESSION_LEVEL, Delta};
use super::{CHECKSUM_FILE, DELTA_DIR, SNAPSHOT_FILE, SNAPSHOT_ZST_FILE, delta_file};
use crate::error::{Error, Result};
use crate::store::{self, StoreSnapshot};
use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const HISTORY_DIR: &str = "history";

/// Snapshots kept to build deltas from
pub const MAX_HISTORY: usize = 8;

#[derive(Debug, Clone)]
pub struct PublishOutcome {
    pub checksum: String,
    pub packages: usize,
    pub deltas: usize,
}

/// Write through a temporary sibling and rename into place
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let temp = path.with_extension("tmp");
    fs::write(&temp, bytes)?;
    fs::rename(&temp, path)?;
    Ok(())
}

fn encode_snapshot(snapshot: &StoreSnapshot) -> Result<Vec<u8>> {
    serde_json::to_vec(snapshot)
        .map_err(|e| Error::ParseError(format!("Cannot serialize snapshot: {}", e)))
}

/// Published snapshots in `history/`, newest first
fn load_history(dir: &Path) -> Result<Vec<(PathBuf, StoreSnapshot)>> {
    let history = dir.join(HISTORY_DIR);
    if !history.is_dir() {
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    for entry in fs::read_dir(&history)? {
        let entry = entry?;
        let modified = entry.metadata()?.modified()?;
        entries.push((modified, entry.path()));
    }
    entries.sort_by(|a, b| b.0.cmp(&a.0));

    let mut snapshots = Vec::new();
    for (_, path) in entries {
        let bytes = zstd::decode_all(fs::read(&path)?.as_slice())?;
        let snapshot: StoreSnapshot = serde_json::from_slice(&bytes)
            .map_err(|e| Error::ParseError(format!("{}: {}", path.display(), e)))?;
        snapshots.push((path, snapshot));
    }
    Ok(snapshots)
}

/// Publish the content of `conn` under `<dest>/<product>/<branch>/`
pub fn publish(conn: &Connection, dest: &Path, product: &str, branch: &str) -> Result<PublishOutcome> {
    let dir = dest.join(product).join(branch);
    let snapshot = store::snapshot(conn)?;
    let checksum = snapshot.checksum();
    let json = encode_snapshot(&snapshot)?;

    write_atomic(&dir.join(SNAPSHOT_FILE), &json)?;
    write_atomic(
        &dir.join(SNAPSHOT_ZST_FILE),
        &zstd::encode_all(json.as_slice(), COMPRESSION_LEVEL)?,
    )?;

    let history = load_history(&dir)?;
    let delta_dir = dir.join(DELTA_DIR);
    if delta_dir.is_dir() {
        fs::remove_dir_all(&delta_dir)?;
    }

    let mut deltas = 0;
    for (index, (path, base)) in history.iter().enumerate() {
        if index >= MAX_HISTORY {
            debug!("Pruning old snapshot {}", path.display());
            fs::remove_file(path)?;
            continue;
        }
        let delta = Delta::between(base, &snapshot);
        if delta.base == checksum {
            continue;
        }
        write_atomic(&dir.join(delta_file(&delta.base)), &delta.encode()?)?;
        deltas += 1;
    }

    write_atomic(
        &dir.join(HISTORY_DIR).join(format!("{}.json.zst", checksum)),
        &zstd::encode_all(json.as_slice(), COMPRESSION_LEVEL)?,
    )?;
    write_atomic(&dir.join(CHECKSUM_FILE), format!("{}\n", checksum).as_bytes())?;

    info!(
        "Published {} packages to {} ({} deltas)",
        snapshot.packages.len(),
        dir.display(),
        deltas
    );
    Ok(PublishOutcome {
        checksum,
        packages: snapshot.packages.len(),
        deltas,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema;
    use crate::store::{PackageRecord, add_package};
    use tempfile::TempDir;

    fn memory_store() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute("PRAGMA foreign_keys = ON", []).unwrap();
        schema::migrate(&conn).unwrap();
        conn
    }

    #[test]
    fn test_publish_layout_and_deltas() {
        let mirror = TempDir::new().unwrap();
        let conn = memory_store();
        add_package(&conn, "5", &PackageRecord::new("app-misc/a-1")).unwrap();

        let first = publish(&conn, mirror.path(), "standard", "5").unwrap();
        assert_eq!(first.deltas, 0);

        let dir = mirror.path().join("standard/5");
        let published = fs::read_to_string(dir.join(CHECKSUM_FILE)).unwrap();
        assert_eq!(published.trim(), first.checksum);

        let plain: StoreSnapshot =
            serde_json::from_slice(&fs::read(dir.join(SNAPSHOT_FILE)).unwrap()).unwrap();
        assert_eq!(plain.checksum(), first.checksum);

        add_package(&conn, "5", &PackageRecord::new("app-misc/b-1")).unwrap();
        let second = publish(&conn, mirror.path(), "standard", "5").unwrap();
        assert_eq!(second.deltas, 1);

        let bytes = fs::read(dir.join(delta_file(&first.checksum))).unwrap();
        let delta = Delta::decode("main", &bytes).unwrap();
        assert_eq!(delta.base, first.checksum);
        assert_eq!(delta.target, second.checksum);
        assert_eq!(delta.upserted.len(), 1);
    }
}
