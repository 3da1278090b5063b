// Bootstrap chain: start the daemon from the first slot that survives
//
// Slots are tried current, previous, default. A candidate that exits
// abnormally inside the grace window falls through to the next one. When the
// previous slot is the one that starts, current is rebuilt from it so the next
// boot goes straight to known-good code.

use crate::daemon::config::Config;
use crate::daemon::slots::{Slot, UpdateSlots};
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{error, info, warn};

/// Environment variable telling the launched daemon which slot it runs from
pub const SLOT_ENV: &str = "SLOTD_SLOT";

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("no usable slot")]
    NoUsableSlot,
}

/// A daemon that made it through the grace window
#[derive(Debug)]
pub struct Launched {
    pub slot: Slot,
    pub child: Child,
}

#[derive(Debug, Clone)]
pub struct BootstrapChain {
    slots: UpdateSlots,
    entry: PathBuf,
    args: Vec<String>,
    grace: Duration,
}

impl BootstrapChain {
    pub fn new(slots: UpdateSlots, entry: impl Into<PathBuf>, grace: Duration) -> Self {
        Self {
            slots,
            entry: entry.into(),
            args: Vec::new(),
            grace,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            UpdateSlots::new(config.slots_root().clone()),
            &config.launch_entry,
            config.launch_grace,
        )
    }

    /// Extra arguments passed to every candidate
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub async fn launch(&self) -> Result<Launched, BootstrapError> {
        for slot in Slot::BOOT_ORDER {
            let Some(child) = self.try_slot(slot).await else {
                continue;
            };

            info!(slot = %slot, pid = ?child.id(), "Daemon started");
            if slot == Slot::Previous {
                self.repair_current().await;
            }
            return Ok(Launched { slot, child });
        }

        error!("no usable slot");
        Err(BootstrapError::NoUsableSlot)
    }

    /// Start one slot and watch it for the grace window
    async fn try_slot(&self, slot: Slot) -> Option<Child> {
        let dir = self.slots.path(slot);
        let program = dir.join(&self.entry);
        if !program.is_file() {
            warn!(slot = %slot, program = %program.display(), "Slot has no daemon entry");
            return None;
        }

        let mut child = match Command::new(&program)
            .args(&self.args)
            .current_dir(&dir)
            .env(SLOT_ENV, slot.dir_name())
            .stdin(Stdio::null())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                warn!(slot = %slot, "Failed to start: {}", e);
                return None;
            }
        };

        match tokio::time::timeout(self.grace, child.wait()).await {
            Err(_) => Some(child),
            Ok(Ok(status)) if status.success() => {
                info!(slot = %slot, "Daemon exited cleanly during startup");
                Some(child)
            }
            Ok(Ok(status)) => {
                warn!(slot = %slot, code = ?status.code(), "Slot failed during startup");
                None
            }
            Ok(Err(e)) => {
                warn!(slot = %slot, "Failed to wait on slot: {}", e);
                None
            }
        }
    }

    async fn repair_current(&self) {
        warn!("Running from previous slot; restoring current from it");
        let slots = self.slots.clone();
        let result = tokio::task::spawn_blocking(move || slots.restore_previous())
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
            .and_then(|r| r);
        if let Err(e) = result {
            error!("Failed to restore current slot: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::slots::tree_digest;
    use crate::test_utils::write_script;
    use tempfile::TempDir;

    const ENTRY: &str = "bin/slotd";

    fn install(slots: &UpdateSlots, slot: Slot, body: &str) {
        write_script(&slots.path(slot), ENTRY, body);
    }

    fn chain(dir: &TempDir) -> (UpdateSlots, BootstrapChain) {
        let slots = UpdateSlots::new(dir.path());
        let chain = BootstrapChain::new(slots.clone(), ENTRY, Duration::from_millis(300));
        (slots, chain)
    }

    #[tokio::test]
    async fn test_current_wins_when_healthy() {
        let dir = TempDir::new().unwrap();
        let (slots, chain) = chain(&dir);
        install(&slots, Slot::Current, "exec sleep 30");
        install(&slots, Slot::Default, "exec sleep 30");

        let mut launched = chain.launch().await.unwrap();
        assert_eq!(launched.slot, Slot::Current);
        launched.child.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_falls_back_to_previous_and_repairs_current() {
        let dir = TempDir::new().unwrap();
        let (slots, chain) = chain(&dir);
        install(&slots, Slot::Current, "exit 3");
        install(&slots, Slot::Previous, "exec sleep 30");

        let mut launched = chain.launch().await.unwrap();
        assert_eq!(launched.slot, Slot::Previous);
        assert_eq!(
            tree_digest(&slots.path(Slot::Current)).unwrap(),
            tree_digest(&slots.path(Slot::Previous)).unwrap()
        );
        launched.child.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_default_is_last_resort() {
        let dir = TempDir::new().unwrap();
        let (slots, chain) = chain(&dir);
        install(&slots, Slot::Current, "kill -9 $$");
        install(&slots, Slot::Default, "exec sleep 30");

        let mut launched = chain.launch().await.unwrap();
        assert_eq!(launched.slot, Slot::Default);
        launched.child.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_clean_exit_counts_as_started() {
        let dir = TempDir::new().unwrap();
        let (slots, chain) = chain(&dir);
        install(&slots, Slot::Current, "echo \"slot=$SLOTD_SLOT\"; exit 0");

        let mut launched = chain.launch().await.unwrap();
        assert_eq!(launched.slot, Slot::Current);
        assert!(launched.child.wait().await.unwrap().success());
    }

    #[tokio::test]
    async fn test_no_usable_slot() {
        let dir = TempDir::new().unwrap();
        let (slots, chain) = chain(&dir);
        install(&slots, Slot::Current, "exit 1");
        install(&slots, Slot::Previous, "exit 1");

        let err = chain.launch().await.unwrap_err();
        assert_eq!(err.to_string(), "no usable slot");
    }
}
