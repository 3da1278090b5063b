// Persistence helpers for device settings
// Settings live in config.json next to the update slots, written atomically under
// an exclusive lock and reloaded whenever the file's mtime moves

use anyhow::{Context, Result};
use filetime::FileTime;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs::{self, OpenOptions};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Device settings persisted to config.json
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSettings {
    /// Name advertised over mDNS
    #[serde(default)]
    pub name: String,
    /// Client addresses allowed to open the control socket
    #[serde(default)]
    pub whitelist: Vec<String>,
    /// `Some(false)` disables the whitelist entirely
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub whitelist_enabled: Option<bool>,
    /// Keys merged in by clients that the daemon does not interpret
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DeviceSettings {
    /// Load settings from disk, returning defaults if the file doesn't exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file: {}", path.display()))?;

        if contents.trim().is_empty() {
            return Ok(Self::default());
        }

        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse settings file: {}", path.display()))
    }

    /// Save settings with an exclusive lock held on a sidecar lock file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create settings directory: {}", parent.display())
            })?;
        }

        let lock_path = path.with_extension("json.lock");
        let lock_file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .with_context(|| format!("Failed to open lock file: {}", lock_path.display()))?;

        lock_file
            .lock_exclusive()
            .with_context(|| "Failed to acquire exclusive lock on settings file")?;

        let contents =
            serde_json::to_string_pretty(self).with_context(|| "Failed to serialize settings")?;
        atomic_write(path, &contents)?;

        // Lock is released when lock_file is dropped
        Ok(())
    }

    /// Merge client-supplied key/value pairs over the current settings
    pub fn merge(&mut self, patch: &Value) -> Result<()> {
        let patch = patch
            .as_object()
            .with_context(|| format!("Settings patch must be an object, got {}", patch))?;

        let mut current = serde_json::to_value(&*self)?;
        if let Value::Object(map) = &mut current {
            for (key, value) in patch {
                map.insert(key.clone(), value.clone());
            }
        }

        *self = serde_json::from_value(current).with_context(|| "Invalid settings after merge")?;
        Ok(())
    }

    /// Whether a client address may open the control socket.
    ///
    /// Loopback is always allowed; everything else must be whitelisted unless
    /// the whitelist is explicitly disabled.
    pub fn allows(&self, client: &str) -> bool {
        if self.whitelist_enabled == Some(false) {
            return true;
        }

        let client = client.trim();
        if client == "localhost" {
            return true;
        }

        let parsed = client.parse::<IpAddr>().ok().map(|ip| ip.to_canonical());
        if parsed.map(|ip| ip.is_loopback()).unwrap_or(false) {
            return true;
        }

        self.whitelist.iter().any(|entry| {
            let entry = entry.trim();
            entry == client
                || match (entry.parse::<IpAddr>(), parsed) {
                    (Ok(allowed), Some(ip)) => allowed.to_canonical() == ip,
                    _ => false,
                }
        })
    }
}

/// Settings plus the mtime they were loaded at
#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
    settings: DeviceSettings,
    loaded_mtime: Option<FileTime>,
}

impl SettingsStore {
    /// Open the store, falling back to defaults when the file is unreadable
    pub fn open(path: PathBuf) -> Self {
        let mut store = Self {
            path,
            settings: DeviceSettings::default(),
            loaded_mtime: None,
        };
        store.reload();
        store
    }

    fn current_mtime(&self) -> Option<FileTime> {
        fs::metadata(&self.path)
            .ok()
            .map(|meta| FileTime::from_last_modification_time(&meta))
    }

    fn reload(&mut self) {
        self.loaded_mtime = self.current_mtime();
        self.settings = match DeviceSettings::load(&self.path) {
            Ok(settings) => {
                info!(path = %self.path.display(), "Loaded device settings");
                settings
            }
            Err(e) => {
                warn!("{:#}; using defaults", e);
                DeviceSettings::default()
            }
        };
    }

    /// Reload if the file changed on disk since the last load
    pub fn refresh(&mut self) -> &DeviceSettings {
        if self.current_mtime() != self.loaded_mtime {
            self.reload();
        }
        &self.settings
    }

    pub fn settings(&self) -> &DeviceSettings {
        &self.settings
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Merge a patch and persist it
    pub fn apply(&mut self, patch: &Value) -> Result<()> {
        self.refresh();
        let mut updated = self.settings.clone();
        updated.merge(patch)?;
        updated.save(&self.path)?;
        self.settings = updated;
        self.loaded_mtime = self.current_mtime();
        Ok(())
    }
}

/// Atomically save data to a file using write-to-temp + rename
pub fn atomic_write(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("Invalid path: {}", path.display()))?;

    // Temp file in the same directory keeps the rename on one filesystem
    let temp_path = parent.join(format!(
        ".{}.tmp.{}",
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown"),
        std::process::id()
    ));

    fs::write(&temp_path, contents)
        .with_context(|| format!("Failed to write temp file: {}", temp_path.display()))?;

    fs::rename(&temp_path, path).with_context(|| {
        format!(
            "Failed to rename {} to {}",
            temp_path.display(),
            path.display()
        )
    })?;

    Ok(())
}
