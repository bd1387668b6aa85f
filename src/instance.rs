// =============================================================================
// Active-Instance Registry — one strategy instance per (account, contract)
// =============================================================================
//
// A lock file per (account, execution_instrument) under `state/instances/`.
// Acquisition creates the file exclusively; a second process hitting an
// existing file must stand down. The guard removes the file on release (and
// best-effort on drop).
// =============================================================================

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Contents of a lock file, for diagnostics on conflict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceClaim {
    pub account: String,
    pub execution_instrument: String,
    pub run_id: String,
    pub pid: u32,
    pub acquired_at_utc: DateTime<Utc>,
}

/// Outcome of an acquisition attempt.
#[derive(Debug)]
pub enum AcquireOutcome {
    Acquired(InstanceGuard),
    /// Another instance holds the lock; its claim, when readable.
    Conflict(Option<InstanceClaim>),
}

/// Registry rooted at `state/instances/`.
#[derive(Debug, Clone)]
pub struct InstanceRegistry {
    dir: PathBuf,
}

impl InstanceRegistry {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create instance dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn lock_path(&self, account: &str, execution_instrument: &str) -> PathBuf {
        self.dir
            .join(format!("{account}_{execution_instrument}.lock"))
    }

    /// Try to claim (account, execution_instrument) for this process.
    pub fn acquire(
        &self,
        account: &str,
        execution_instrument: &str,
        run_id: &str,
    ) -> Result<AcquireOutcome> {
        let path = self.lock_path(account, execution_instrument);

        let claim = InstanceClaim {
            account: account.to_string(),
            execution_instrument: execution_instrument.to_string(),
            run_id: run_id.to_string(),
            pid: std::process::id(),
            acquired_at_utc: Utc::now(),
        };
        let content =
            serde_json::to_string_pretty(&claim).context("failed to serialize instance claim")?;

        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                use std::io::Write;
                file.write_all(content.as_bytes())
                    .with_context(|| format!("failed to write claim to {}", path.display()))?;
                info!(
                    account,
                    execution_instrument,
                    path = %path.display(),
                    "instance lock acquired"
                );
                Ok(AcquireOutcome::Acquired(InstanceGuard {
                    path,
                    released: false,
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let existing = std::fs::read_to_string(&path)
                    .ok()
                    .and_then(|c| serde_json::from_str(&c).ok());
                warn!(
                    account,
                    execution_instrument,
                    path = %path.display(),
                    "instance lock already held"
                );
                Ok(AcquireOutcome::Conflict(existing))
            }
            Err(e) => Err(e).with_context(|| {
                format!("failed to create instance lock {}", path.display())
            }),
        }
    }
}

/// Held claim; releasing removes the lock file.
#[derive(Debug)]
pub struct InstanceGuard {
    path: PathBuf,
    released: bool,
}

impl InstanceGuard {
    /// Explicit release at shutdown.
    pub fn release(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove instance lock");
        } else {
            info!(path = %self.path.display(), "instance lock released");
        }
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        self.remove();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_then_conflict_then_release() {
        let dir = tempfile::tempdir().unwrap();
        let registry = InstanceRegistry::open(dir.path().join("instances")).unwrap();

        let guard = match registry.acquire("SIM-001", "MES", "run-1").unwrap() {
            AcquireOutcome::Acquired(g) => g,
            AcquireOutcome::Conflict(_) => panic!("first acquire must succeed"),
        };

        // Second instance for the same key must stand down.
        match registry.acquire("SIM-001", "MES", "run-2").unwrap() {
            AcquireOutcome::Conflict(Some(claim)) => {
                assert_eq!(claim.run_id, "run-1");
                assert_eq!(claim.execution_instrument, "MES");
            }
            other => panic!("expected conflict, got {other:?}"),
        }

        // A different contract on the same account is independent.
        match registry.acquire("SIM-001", "MNQ", "run-2").unwrap() {
            AcquireOutcome::Acquired(_) => {}
            other => panic!("expected acquire, got {other:?}"),
        }

        guard.release();
        match registry.acquire("SIM-001", "MES", "run-3").unwrap() {
            AcquireOutcome::Acquired(_) => {}
            other => panic!("expected acquire after release, got {other:?}"),
        }
    }

    #[test]
    fn drop_releases_the_lock() {
        let dir = tempfile::tempdir().unwrap();
        let registry = InstanceRegistry::open(dir.path().join("instances")).unwrap();
        {
            let _guard = match registry.acquire("SIM-001", "MES", "run-1").unwrap() {
                AcquireOutcome::Acquired(g) => g,
                _ => panic!(),
            };
        }
        match registry.acquire("SIM-001", "MES", "run-2").unwrap() {
            AcquireOutcome::Acquired(_) => {}
            other => panic!("expected acquire after drop, got {other:?}"),
        }
    }
}
