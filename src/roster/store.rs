//! Durable storage for rosters and the sticky quiesce marker.
//!
//! The roster is the only operator state this subsystem must not lose: it
//! fences ownership in strong-consistency mode, so a wrong roster is worse
//! than no roster. Files are written whole to a temp path and renamed into
//! place, and carry a CRC-32 trailer; a file that fails validation on load
//! surfaces as [`Error::Corrupt`], which callers treat as fatal rather
//! than silently continuing.

use crate::error::{Error, Result};
use crate::types::RosterNode;
use crc::{Crc, CRC_32_ISCSI};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const ROSTER_MAGIC: u32 = 0x5253_5452; // "RSTR"

/// What is durably recorded per namespace: the staged roster. It becomes
/// the active roster only through a rebalance, never at load time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterRecord {
    magic: u32,
    /// Staged (pending) roster nodes.
    pub nodes: Vec<RosterNode>,
}

impl RosterRecord {
    /// Wrap a node list for persistence.
    pub fn new(nodes: Vec<RosterNode>) -> Self {
        Self {
            magic: ROSTER_MAGIC,
            nodes,
        }
    }
}

/// Durable roster persistence.
#[async_trait::async_trait]
pub trait RosterPersistence: Send + Sync + std::fmt::Debug {
    /// Persist the staged roster for a namespace.
    async fn save(&self, namespace: &str, record: &RosterRecord) -> Result<()>;

    /// Load the staged roster for a namespace, `None` if never set.
    async fn load(&self, namespace: &str) -> Result<Option<RosterRecord>>;

    /// Persist or clear the node-wide sticky quiesce marker.
    async fn set_sticky_quiesce(&self, sticky: bool) -> Result<()>;

    /// Whether the sticky quiesce marker is present.
    async fn sticky_quiesce(&self) -> Result<bool>;
}

/// File-backed roster store. One file per namespace under the state
/// directory, plus a marker file for sticky quiesce.
#[derive(Debug)]
pub struct FileRosterStore {
    dir: PathBuf,
}

impl FileRosterStore {
    /// Open (creating the directory if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn roster_path(&self, namespace: &str) -> PathBuf {
        self.dir.join(format!("roster-{}.bin", namespace))
    }

    fn sticky_path(&self) -> PathBuf {
        self.dir.join("quiesce.sticky")
    }

    fn write_atomic(path: &Path, payload: &[u8]) -> Result<()> {
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, payload)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl RosterPersistence for FileRosterStore {
    async fn save(&self, namespace: &str, record: &RosterRecord) -> Result<()> {
        let mut payload = bincode::serialize(record)?;
        let crc = CASTAGNOLI.checksum(&payload);
        payload.extend_from_slice(&crc.to_be_bytes());

        Self::write_atomic(&self.roster_path(namespace), &payload)?;
        info!(namespace, nodes = record.nodes.len(), "roster persisted");
        Ok(())
    }

    async fn load(&self, namespace: &str) -> Result<Option<RosterRecord>> {
        let path = self.roster_path(namespace);
        let payload = match fs::read(&path) {
            Ok(p) => p,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if payload.len() < 4 {
            return Err(Error::Corrupt(format!("roster file {:?} truncated", path)));
        }
        let (body, trailer) = payload.split_at(payload.len() - 4);
        let expect = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        if CASTAGNOLI.checksum(body) != expect {
            return Err(Error::Corrupt(format!(
                "roster file {:?} checksum mismatch",
                path
            )));
        }

        let record: RosterRecord = bincode::deserialize(body)
            .map_err(|e| Error::Corrupt(format!("roster file {:?}: {}", path, e)))?;
        if record.magic != ROSTER_MAGIC {
            return Err(Error::Corrupt(format!("roster file {:?} bad magic", path)));
        }

        debug!(namespace, nodes = record.nodes.len(), "roster loaded");
        Ok(Some(record))
    }

    async fn set_sticky_quiesce(&self, sticky: bool) -> Result<()> {
        let path = self.sticky_path();
        if sticky {
            Self::write_atomic(&path, b"quiesced\n")?;
        } else if let Err(e) = fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(e.into());
            }
        }
        Ok(())
    }

    async fn sticky_quiesce(&self) -> Result<bool> {
        Ok(self.sticky_path().exists())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use std::io::Write;

    #[tokio::test]
    async fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRosterStore::open(dir.path()).unwrap();

        assert!(store.load("test").await.unwrap().is_none());

        let record = RosterRecord::new(vec![RosterNode::new(0xa1, 0), RosterNode::new(0xb2, 2)]);
        store.save("test", &record).await.unwrap();

        let loaded = store.load("test").await.unwrap().unwrap();
        assert_eq!(loaded, record);
    }

    #[tokio::test]
    async fn test_corruption_is_fatal_not_silent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRosterStore::open(dir.path()).unwrap();

        let record = RosterRecord::new(vec![RosterNode::new(0xa1, 0)]);
        store.save("test", &record).await.unwrap();

        // Flip a byte in the middle of the file.
        let path = dir.path().join("roster-test.bin");
        let mut payload = fs::read(&path).unwrap();
        payload[2] ^= 0xff;
        let mut f = OpenOptions::new().write(true).open(&path).unwrap();
        f.write_all(&payload).unwrap();

        assert!(matches!(
            store.load("test").await,
            Err(Error::Corrupt(_))
        ));
    }

    #[tokio::test]
    async fn test_sticky_quiesce_marker() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRosterStore::open(dir.path()).unwrap();

        assert!(!store.sticky_quiesce().await.unwrap());
        store.set_sticky_quiesce(true).await.unwrap();
        assert!(store.sticky_quiesce().await.unwrap());

        // Clearing twice is fine.
        store.set_sticky_quiesce(false).await.unwrap();
        store.set_sticky_quiesce(false).await.unwrap();
        assert!(!store.sticky_quiesce().await.unwrap());
    }
}
