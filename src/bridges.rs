//! The supervisor's external collaborators.
//!
//! The fork loop only decides *when* a handover happens. What actually
//! moves across it -- the persistent-storage position, the deferred boot
//! configuration, the fork notification -- belongs to the embedding server
//! and reaches the supervisor through these traits. A failure in any of
//! them is not handled specially: it propagates and crashes the invoking
//! process, which the parent then observes as a boot crash.

use anyhow::{bail, Context, Result};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use slog_scope::info;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;

/// Save/restore access to the persistent-storage position pointer that is
/// handed from a dying child to its replacement.
pub trait StorageIndex: Send + Sync {
    /// Runs once in every freshly forked child, before the boot hook.
    fn restore(&self) -> Result<()>;

    /// Runs in the dying process, right before it terminates.
    fn save(&self) -> Result<()>;
}

/// One-time deferred setup, run in the child after [`StorageIndex::restore`].
pub trait BootHook: Send + Sync {
    fn on_child_boot(&self) -> Result<()>;
}

/// Receives the "new child forked" notification: exactly once per
/// successful fork, only in the new child, after the boot hook.
pub trait Notifier: Send + Sync {
    fn child_forked(&self, pid: Pid, generation: u64);
}

/// The collaborator set handed to [`crate::Supervisor::new`].
pub struct Bridges {
    pub index: Arc<dyn StorageIndex>,
    pub boot_hook: Arc<dyn BootHook>,
    pub notifier: Arc<dyn Notifier>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct IndexRecord {
    position: u64,
}

/// A [`StorageIndex`] over a single append-only data file: `save` records
/// the data file's current length, `restore` checks the recorded position
/// against the file a fresh child finds on disk. Backs the harness binary
/// and the tests.
pub struct FileIndex {
    data_path: PathBuf,
    index_path: PathBuf,
}

impl FileIndex {
    pub fn new(data_path: PathBuf, index_path: PathBuf) -> FileIndex {
        FileIndex {
            data_path,
            index_path,
        }
    }

    /// Current length of the data file; a file that does not exist yet
    /// counts as empty.
    fn position(&self) -> Result<u64> {
        match fs::metadata(&self.data_path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e).context("inspecting the data file"),
        }
    }

    /// The position recorded by the last `save`, if any.
    pub fn saved_position(&self) -> Result<Option<u64>> {
        match fs::read(&self.index_path) {
            Ok(bytes) => {
                let record: IndexRecord =
                    serde_json::from_slice(&bytes).context("parsing the index file")?;
                Ok(Some(record.position))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).context("reading the index file"),
        }
    }
}

impl StorageIndex for FileIndex {
    fn restore(&self) -> Result<()> {
        let position = self.position()?;
        match self.saved_position()? {
            Some(saved) if saved > position => {
                bail!(
                    "index records position {} but the data file only holds {} bytes",
                    saved,
                    position
                );
            }
            saved => {
                info!("restored storage index";
                      "resume_at" => saved.unwrap_or(0),
                      "data_len" => position);
            }
        }
        Ok(())
    }

    fn save(&self) -> Result<()> {
        let record = IndexRecord {
            position: self.position()?,
        };
        let bytes = serde_json::to_vec(&record).context("serializing the index record")?;
        fs::write(&self.index_path, &bytes).context("writing the index file")?;
        info!("saved storage index"; "position" => record.position);
        Ok(())
    }
}
