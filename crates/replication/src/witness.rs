//! Witness arbitration.
//!
//! A node may become Primary only while it holds the witness claim (or its
//! peer explicitly confirms the role). The witness is external to both
//! members: a shared folder both can reach, or a standalone arbiter
//! service. Either way the claim is exclusive, so two members can never
//! both believe they won an election.

use fs2::FileExt;
use helio_core::error::{CommunicationKind, Error, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// The arbiter a local-write election consults.
pub trait Witness: Send + Sync {
    /// Try to take the exclusive claim for `node`. Returns false when
    /// another node holds it.
    fn try_claim(&self, node: &str) -> Result<bool>;

    /// Release this node's claim, if held.
    fn release(&self, node: &str) -> Result<()>;

    /// The current holder, if readable.
    fn holder(&self) -> Result<Option<String>>;

    /// Whether the witness answers within its configured bound.
    fn is_reachable(&self) -> bool {
        self.holder().is_ok()
    }
}

/// A witness backed by a lock file in a folder both members mount.
///
/// The claim is an OS-level exclusive lock held for as long as the claim
/// stands; a crashed holder's lock dies with its process, so the survivor
/// can claim without manual cleanup. File operations run under the
/// configured remote-file timeout, since the folder is typically a network
/// mount.
pub struct SharedFolderWitness {
    lock_path: PathBuf,
    remote_file_timeout: Duration,
    held: Mutex<Option<File>>,
}

impl SharedFolderWitness {
    /// A witness over `path`; the folder must exist on both members.
    pub fn new(path: &Path, remote_file_timeout: Duration) -> Self {
        SharedFolderWitness {
            lock_path: path.join("helio-witness.lock"),
            remote_file_timeout,
            held: Mutex::new(None),
        }
    }

    /// Run a file operation with the remote-file bound. A hung network
    /// mount must not wedge the election thread forever.
    fn bounded<T: Send + 'static>(
        &self,
        op: impl FnOnce() -> std::io::Result<T> + Send + 'static,
    ) -> Result<T> {
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let _ = tx.send(op());
        });
        match rx.recv_timeout(self.remote_file_timeout) {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(Error::Communication(CommunicationKind::Timeout)),
        }
    }
}

impl Witness for SharedFolderWitness {
    fn try_claim(&self, node: &str) -> Result<bool> {
        let mut held = self.held.lock();
        if held.is_some() {
            return Ok(true);
        }
        let path = self.lock_path.clone();
        let node = node.to_string();
        let claimed = self.bounded(move || {
            let mut file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&path)?;
            if file.try_lock_exclusive().is_err() {
                return Ok(None);
            }
            file.set_len(0)?;
            file.write_all(node.as_bytes())?;
            file.sync_all()?;
            Ok(Some(file))
        })?;
        match claimed {
            Some(file) => {
                debug!(path = %self.lock_path.display(), "witness claimed");
                *held = Some(file);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn release(&self, _node: &str) -> Result<()> {
        let mut held = self.held.lock();
        if let Some(file) = held.take() {
            let path = self.lock_path.clone();
            self.bounded(move || {
                fs2::FileExt::unlock(&file)?;
                // Best effort: clear the holder name for observers.
                if let Ok(mut f) = OpenOptions::new().write(true).open(&path) {
                    let _ = f.set_len(0);
                }
                Ok(())
            })?;
            debug!(path = %self.lock_path.display(), "witness released");
        }
        Ok(())
    }

    fn holder(&self) -> Result<Option<String>> {
        let path = self.lock_path.clone();
        self.bounded(move || {
            let mut file = match File::open(&path) {
                Ok(f) => f,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e),
            };
            file.seek(SeekFrom::Start(0))?;
            let mut name = String::new();
            file.read_to_string(&mut name)?;
            Ok((!name.is_empty()).then_some(name))
        })
    }
}
