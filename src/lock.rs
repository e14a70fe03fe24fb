//! Mutual exclusion for shared server state
//!
//! Two layers:
//! - [`FileLock`]: a `<path>.lock` marker guarding a configuration file
//!   against every process on the host. Contention fails immediately; it
//!   never waits. A crash before release leaves a stale marker that an
//!   operator must remove.
//! - [`LockRegistry`]: in-process async mutexes. One global mutex
//!   serializes all PKI work, and one lazily-created mutex per identity
//!   serializes WireGuard and Xray work for the same user.

use dashmap::DashMap;
use std::ffi::OsString;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::error::{ProvisionError, ProvisionResult};
use crate::identity::ClientIdentity;

/// Marker path guarding `path`
pub fn lock_path_for(path: &Path) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

/// Held marker file; removed on drop
#[derive(Debug)]
pub struct FileLock {
    lock_path: PathBuf,
}

impl FileLock {
    /// Create `<path>.lock` holding our pid, or fail if it already exists
    pub async fn acquire(path: &Path) -> ProvisionResult<Self> {
        let lock_path = lock_path_for(path);
        let marker = lock_path.clone();

        tokio::task::spawn_blocking(move || -> ProvisionResult<()> {
            let mut file = match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&marker)
            {
                Ok(file) => file,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    return Err(ProvisionError::Contention { lock: marker });
                }
                Err(e) => return Err(e.into()),
            };
            write!(file, "{}", std::process::id())?;
            Ok(())
        })
        .await??;

        debug!("Acquired lock {:?}", lock_path);
        Ok(Self { lock_path })
    }

    pub fn path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.lock_path) {
            Ok(()) => debug!("Released lock {:?}", self.lock_path),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove lock {:?}: {}", self.lock_path, e),
        }
    }
}

/// In-process lock set shared by the orchestrator
#[derive(Debug, Default)]
pub struct LockRegistry {
    openvpn: Arc<Mutex<()>>,
    users: DashMap<String, Arc<Mutex<()>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Global PKI lock; easyrsa is not safe for concurrent use
    pub async fn openvpn(&self) -> OwnedMutexGuard<()> {
        self.openvpn.clone().lock_owned().await
    }

    /// Per-identity lock for WireGuard and Xray work
    pub async fn user(&self, identity: &ClientIdentity) -> OwnedMutexGuard<()> {
        // Clone out of the map before awaiting so no shard lock is held
        let mutex = self
            .users
            .entry(identity.as_str().to_string())
            .or_default()
            .clone();
        mutex.lock_owned().await
    }

    /// Number of identities that have had a lock created
    pub fn tracked_users(&self) -> usize {
        self.users.len()
    }
}
