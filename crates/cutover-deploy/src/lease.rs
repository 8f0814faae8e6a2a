//! Environment leases and cancellation.
//!
//! At most one deployment or rollback runs per environment. A [`Lease`] is
//! held for the whole operation and released on drop. Each lease carries
//! a cancel flag that the orchestrator checks at step boundaries.
//!
//! With a lock directory, a lease also holds an exclusive advisory lock
//! on `{dir}/{environment}.lock`, which keeps other processes sharing the
//! same state file off the environment. The OS drops the lock with the
//! file handle, so a crashed process never leaves a stale lease behind.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use fs2::FileExt;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::{DeployError, DeployResult};

/// Map of held environment leases, optionally backed by lock files.
#[derive(Clone, Default)]
pub struct LeaseRegistry {
    held: Arc<Mutex<HashMap<String, CancelHandle>>>,
    lock_dir: Option<Arc<PathBuf>>,
}

impl LeaseRegistry {
    /// Leases that exclude operations within this process only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Leases that also exclude other processes through lock files in `dir`.
    pub fn with_lock_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            held: Arc::default(),
            lock_dir: Some(Arc::new(dir.into())),
        }
    }

    /// Take the lease for `environment`, failing with
    /// [`DeployError::DeploymentInProgress`] if it is held here or by
    /// another process.
    pub fn acquire(&self, environment: &str) -> DeployResult<Lease> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if held.contains_key(environment) {
            return Err(DeployError::DeploymentInProgress(environment.to_string()));
        }
        let lock = match &self.lock_dir {
            Some(dir) => Some(lock_environment(dir, environment)?),
            None => None,
        };
        let (tx, rx) = watch::channel(false);
        let handle = CancelHandle { tx: Arc::new(tx) };
        held.insert(environment.to_string(), handle.clone());
        debug!(%environment, "lease acquired");
        Ok(Lease {
            environment: environment.to_string(),
            registry: self.clone(),
            handle,
            token: CancelToken { rx },
            _lock: lock,
        })
    }

    /// Request cancellation of the operation holding `environment`'s lease.
    /// Returns false if nothing holds it.
    pub fn cancel(&self, environment: &str) -> bool {
        let held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        match held.get(environment) {
            Some(handle) => {
                handle.cancel();
                info!(%environment, "cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Whether an operation holds `environment`, here or in another process.
    pub fn is_held(&self, environment: &str) -> bool {
        let held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if held.contains_key(environment) {
            return true;
        }
        match &self.lock_dir {
            Some(dir) => locked_elsewhere(dir, environment),
            None => false,
        }
    }

    fn release(&self, environment: &str) {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        held.remove(environment);
        debug!(%environment, "lease released");
    }
}

fn lock_path(dir: &Path, environment: &str) -> PathBuf {
    dir.join(format!("{environment}.lock"))
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn lock_environment(dir: &Path, environment: &str) -> DeployResult<File> {
    let path = lock_path(dir, environment);
    let lease_error = |e: io::Error| DeployError::Lease(format!("{}: {e}", path.display()));
    std::fs::create_dir_all(dir).map_err(lease_error)?;
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .map_err(lease_error)?;
    // Through the trait: newer std has inherent `File` lock methods of the same names.
    match FileExt::try_lock_exclusive(&file) {
        Ok(()) => {
            debug!(%environment, path = %path.display(), "lock file taken");
            Ok(file)
        }
        Err(e) if is_contended(&e) => {
            Err(DeployError::DeploymentInProgress(environment.to_string()))
        }
        Err(e) => Err(lease_error(e)),
    }
}

/// Briefly tries the lock file; a missing file means nobody ever held it.
fn locked_elsewhere(dir: &Path, environment: &str) -> bool {
    let Ok(file) = File::open(lock_path(dir, environment)) else {
        return false;
    };
    match FileExt::try_lock_shared(&file) {
        Ok(()) => false,
        Err(e) => is_contended(&e),
    }
}

/// Exclusive right to operate on one environment.
pub struct Lease {
    environment: String,
    registry: LeaseRegistry,
    handle: CancelHandle,
    token: CancelToken,
    /// Released by the OS when the handle closes.
    _lock: Option<File>,
}

impl Lease {
    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Handle that cancels this lease's operation.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.handle.clone()
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.registry.release(&self.environment);
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("environment", &self.environment)
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

/// Sets the cancel flag of one operation.
#[derive(Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Read side of the cancel flag.
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }
}
