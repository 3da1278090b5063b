// Update slots and the directory helpers the updater and launcher share
//
// Three named directories hold versions of the daemon's own code:
// - default: factory image, never written
// - current: live code
// - previous: last-known-good copy, refreshed right before current is replaced

use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// A named slot holding one version of the daemon's code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    Default,
    Current,
    Previous,
}

impl Slot {
    /// Order the launcher tries slots in
    pub const BOOT_ORDER: [Slot; 3] = [Slot::Current, Slot::Previous, Slot::Default];

    pub fn dir_name(&self) -> &'static str {
        match self {
            Slot::Default => "default",
            Slot::Current => "current",
            Slot::Previous => "previous",
        }
    }
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// The three slot directories under one root
#[derive(Debug, Clone)]
pub struct UpdateSlots {
    root: PathBuf,
}

impl UpdateSlots {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self, slot: Slot) -> PathBuf {
        self.root.join(slot.dir_name())
    }

    /// Replace `previous` with a fresh copy of `current`
    pub fn snapshot_current(&self) -> io::Result<u64> {
        let previous = self.path(Slot::Previous);
        clear_dir(&previous, None)?;
        copy_dir(&self.path(Slot::Current), &previous)
    }

    /// Replace `current` with the contents of `previous`
    pub fn restore_previous(&self) -> io::Result<u64> {
        let current = self.path(Slot::Current);
        clear_dir(&current, None)?;
        copy_dir(&self.path(Slot::Previous), &current)
    }
}

/// Remove every entry under `dir` except a top-level entry named `keep`.
///
/// The directory itself is left in place. A missing directory is not an error.
pub fn clear_dir(dir: &Path, keep: Option<&str>) -> io::Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    for entry in entries {
        let entry = entry?;
        if keep.is_some_and(|name| entry.file_name() == name) {
            continue;
        }
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }

    Ok(())
}

/// Recursively copy `src` into `dst`, creating `dst` as needed.
///
/// Returns the number of files copied. Symlinks are recreated, not followed.
pub fn copy_dir(src: &Path, dst: &Path) -> io::Result<u64> {
    fs::create_dir_all(dst)?;
    let mut copied = 0;

    for entry in WalkDir::new(src).min_depth(1).follow_links(false) {
        let entry = entry.map_err(io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let target = dst.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
            copied += 1;
        } else {
            fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }

    Ok(copied)
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> io::Result<()> {
    let link = fs::read_link(src)?;
    if dst.symlink_metadata().is_ok() {
        fs::remove_file(dst)?;
    }
    std::os::unix::fs::symlink(link, dst)
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dst: &Path) -> io::Result<()> {
    fs::copy(src, dst).map(|_| ())
}

/// SHA-256 over the sorted relative paths and file contents of a tree
pub fn tree_digest(dir: &Path) -> io::Result<String> {
    let mut hasher = Sha256::new();

    for entry in WalkDir::new(dir).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(dir)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        hasher.update(relative.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        if entry.file_type().is_file() {
            hasher.update(fs::read(entry.path())?);
        }
        hasher.update([0xffu8]);
    }

    Ok(hex::encode(hasher.finalize()))
}
