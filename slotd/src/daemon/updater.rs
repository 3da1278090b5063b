// Self-update with rollback
//
// The daemon's own code lives in the `current` slot. An update first snapshots
// `current` into `previous`, then replaces `current` with the uploaded bundle
// and rebuilds its dependencies. If extraction or the rebuild fails, `current`
// is put back from the snapshot so the running daemon keeps its old code.

use crate::daemon::archive::{ArchiveError, Extractor};
use crate::daemon::package_tool::{Mode, PackageTool};
use crate::daemon::process::{
    ManagedProcess, ProcessError, ProcessEvent, ProcessMessage, ProcessTag, Role,
};
use crate::daemon::slots::{clear_dir, Slot, UpdateSlots};
use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// File name the uploaded bundle is persisted under
pub const BUNDLE_FILE_NAME: &str = "update.tar";

#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("failed to save update bundle: {0}")]
    Persist(#[source] io::Error),
    #[error("failed to back up current slot: {0}")]
    Snapshot(#[source] io::Error),
    #[error("failed to clear current slot: {0}")]
    Clear(#[source] io::Error),
    #[error("failed to extract update: {0}")]
    Extract(#[source] ArchiveError),
    #[error("dependency rebuild could not start: {0}")]
    RebuildSpawn(#[source] ProcessError),
    #[error("dependency rebuild exited with code {0:?}")]
    RebuildFailed(Option<i32>),
    #[error("{0}; previous version restored")]
    Restored(#[source] Box<UpdateError>),
    #[error("{cause}; restoring previous version also failed: {restore}")]
    RestoreFailed {
        cause: Box<UpdateError>,
        restore: io::Error,
    },
}

pub struct RollbackManager {
    slots: UpdateSlots,
    tmp_dir: PathBuf,
    package_tool: PackageTool,
}

impl RollbackManager {
    pub fn new(slots: UpdateSlots, tmp_dir: PathBuf, package_tool: PackageTool) -> Self {
        Self {
            slots,
            tmp_dir,
            package_tool,
        }
    }

    pub fn slots(&self) -> &UpdateSlots {
        &self.slots
    }

    /// Apply an update bundle to the `current` slot.
    ///
    /// Progress and rebuild output go to `console`. On `Ok` the caller is
    /// expected to exit so the launcher starts the new code.
    pub async fn install_update<F>(&self, bundle: &[u8], mut console: F) -> Result<(), UpdateError>
    where
        F: FnMut(String),
    {
        let bundle_path = self.tmp_dir.join(BUNDLE_FILE_NAME);
        tokio::fs::create_dir_all(&self.tmp_dir)
            .await
            .map_err(UpdateError::Persist)?;
        tokio::fs::write(&bundle_path, bundle)
            .await
            .map_err(UpdateError::Persist)?;

        let digest = hex::encode(Sha256::digest(bundle));
        info!(bytes = bundle.len(), sha256 = %digest, "Received update bundle");
        console(format!("Received update bundle ({} bytes)", bundle.len()));

        let slots = self.slots.clone();
        let copied = blocking(move || slots.snapshot_current())
            .await
            .map_err(UpdateError::Snapshot)?;
        info!(files = copied, "Backed up current slot");

        if let Err(e) = self.replace_current(&bundle_path).await {
            return Err(self.restore(e).await);
        }
        console("Update extracted, rebuilding dependencies".to_string());

        if let Err(e) = self.rebuild(&mut console).await {
            return Err(self.restore(e).await);
        }

        info!("Update installed");
        Ok(())
    }

    async fn replace_current(&self, bundle_path: &Path) -> Result<(), UpdateError> {
        let current = self.slots.path(Slot::Current);
        let target = current.clone();
        blocking(move || clear_dir(&target, None))
            .await
            .map_err(UpdateError::Clear)?;

        let extractor = Extractor::discover().map_err(UpdateError::Extract)?;
        extractor
            .extract(bundle_path, &current)
            .await
            .map_err(UpdateError::Extract)
    }

    async fn rebuild<F>(&self, console: &mut F) -> Result<(), UpdateError>
    where
        F: FnMut(String),
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<ProcessMessage>();
        let cmd = self
            .package_tool
            .command(Mode::Rebuild, &self.slots.path(Slot::Current));
        let tag = ProcessTag {
            generation: 0,
            role: Role::Installer,
        };
        let _process = ManagedProcess::spawn(cmd, tag, tx).map_err(UpdateError::RebuildSpawn)?;

        while let Some(msg) = rx.recv().await {
            match msg.event {
                ProcessEvent::Stdout(bytes) | ProcessEvent::Stderr(bytes) => {
                    console(String::from_utf8_lossy(&bytes).into_owned());
                }
                ProcessEvent::Exited { code } => {
                    console(self.package_tool.completion_banner(Mode::Rebuild, code));
                    return match code {
                        Some(0) => Ok(()),
                        other => Err(UpdateError::RebuildFailed(other)),
                    };
                }
                ProcessEvent::Failed(e) => {
                    return Err(UpdateError::RebuildSpawn(ProcessError::Spawn {
                        program: self.package_tool.program().to_string(),
                        source: io::Error::new(io::ErrorKind::Other, e),
                    }));
                }
            }
        }

        Err(UpdateError::RebuildFailed(None))
    }

    /// Put `current` back from `previous`
    async fn restore(&self, cause: UpdateError) -> UpdateError {
        warn!("Update failed, restoring previous version: {}", cause);
        let slots = self.slots.clone();
        match blocking(move || slots.restore_previous()).await {
            Ok(_) => UpdateError::Restored(Box::new(cause)),
            Err(restore) => {
                error!("Restoring previous version failed: {}", restore);
                UpdateError::RestoreFailed {
                    cause: Box::new(cause),
                    restore,
                }
            }
        }
    }
}

async fn blocking<F, R>(f: F) -> io::Result<R>
where
    F: FnOnce() -> io::Result<R> + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::slots::tree_digest;
    use crate::test_utils::{make_tarball, write_script};
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        manager: RollbackManager,
    }

    fn fixture(tool_body: &str) -> Fixture {
        let dir = TempDir::new().unwrap();
        let tool = write_script(dir.path(), "tool.sh", tool_body);

        let slots = UpdateSlots::new(dir.path().join("slots"));
        let current = slots.path(Slot::Current);
        fs::create_dir_all(current.join("lib")).unwrap();
        fs::write(current.join("daemon.js"), "v1").unwrap();
        fs::write(current.join("lib/util.js"), "util v1").unwrap();

        let manager = RollbackManager::new(
            slots,
            dir.path().join("tmp"),
            PackageTool::new(tool.display().to_string()),
        );
        Fixture { dir, manager }
    }

    fn make_bundle(dir: &Path) -> Vec<u8> {
        make_tarball(dir, &[("daemon.js", "v2")])
    }

    #[tokio::test]
    async fn test_successful_update_replaces_current() {
        let fx = fixture("echo rebuilt in $(pwd); exit 0");
        let before = tree_digest(&fx.manager.slots().path(Slot::Current)).unwrap();
        let bundle = make_bundle(fx.dir.path());

        let mut lines = Vec::new();
        fx.manager
            .install_update(&bundle, |line| lines.push(line))
            .await
            .unwrap();

        let current = fx.manager.slots().path(Slot::Current);
        assert_eq!(fs::read_to_string(current.join("daemon.js")).unwrap(), "v2");
        assert!(!current.join("lib").exists());
        assert_eq!(
            tree_digest(&fx.manager.slots().path(Slot::Previous)).unwrap(),
            before
        );
        assert!(lines.iter().any(|l| l.contains("rebuilt in")));
        assert!(fx.dir.path().join("tmp").join(BUNDLE_FILE_NAME).exists());
    }

    #[tokio::test]
    async fn test_extraction_failure_restores_current() {
        let fx = fixture("exit 0");
        let current = fx.manager.slots().path(Slot::Current);
        let before = tree_digest(&current).unwrap();

        let err = fx
            .manager
            .install_update(b"not a tarball at all", |_| {})
            .await
            .unwrap_err();

        assert!(matches!(&err, UpdateError::Restored(cause) if matches!(**cause, UpdateError::Extract(_))));
        assert_eq!(tree_digest(&current).unwrap(), before);
    }

    #[tokio::test]
    async fn test_failed_rebuild_restores_current() {
        let fx = fixture("echo boom >&2; exit 1");
        let current = fx.manager.slots().path(Slot::Current);
        let before = tree_digest(&current).unwrap();
        let bundle = make_bundle(fx.dir.path());

        let err = fx.manager.install_update(&bundle, |_| {}).await.unwrap_err();

        assert!(matches!(
            &err,
            UpdateError::Restored(cause) if matches!(**cause, UpdateError::RebuildFailed(Some(1)))
        ));
        assert_eq!(tree_digest(&current).unwrap(), before);
        assert!(err.to_string().contains("previous version restored"));
    }
}
