// Archive extraction through the system tar
//
// Prefers bsdtar when it is on PATH, otherwise tar. Success or failure is all
// the daemon needs from it.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

const CANDIDATES: [&str; 2] = ["bsdtar", "tar"];

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("no archive tool found on PATH (tried bsdtar, tar)")]
    ToolMissing,
    #[error("failed to run {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{tool} exited with {code:?}: {stderr}")]
    Failed {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },
}

/// Extracts tarballs into slot directories
#[derive(Debug, Clone)]
pub struct Extractor {
    program: PathBuf,
}

impl Extractor {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Find bsdtar or tar on PATH
    pub fn discover() -> Result<Self, ArchiveError> {
        let path = std::env::var_os("PATH").unwrap_or_else(OsString::new);
        Self::discover_in(&path)
    }

    fn discover_in(path: &std::ffi::OsStr) -> Result<Self, ArchiveError> {
        for name in CANDIDATES {
            for dir in std::env::split_paths(path) {
                let candidate = dir.join(name);
                if is_executable(&candidate) {
                    debug!(tool = %candidate.display(), "Using archive tool");
                    return Ok(Self::new(candidate));
                }
            }
        }
        Err(ArchiveError::ToolMissing)
    }

    /// Extract `archive` into `dest`, creating `dest` if needed
    pub async fn extract(&self, archive: &Path, dest: &Path) -> Result<(), ArchiveError> {
        let tool = self.program.display().to_string();
        tokio::fs::create_dir_all(dest)
            .await
            .map_err(|source| ArchiveError::Spawn {
                tool: tool.clone(),
                source,
            })?;

        let output = Command::new(&self.program)
            .arg("-xf")
            .arg(archive)
            .arg("-C")
            .arg(dest)
            .output()
            .await
            .map_err(|source| ArchiveError::Spawn {
                tool: tool.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(ArchiveError::Failed {
                tool,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        info!(
            archive = %archive.display(),
            dest = %dest.display(),
            "Extracted archive"
        );
        Ok(())
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::make_tarball;
    use std::fs;
    use tempfile::TempDir;

    fn make_archive(dir: &Path) -> PathBuf {
        let bytes = make_tarball(dir, &[("main.js", "console.log('hi')"), ("lib/a.js", "a")]);
        let path = dir.join("upload.tar");
        fs::write(&path, bytes).unwrap();
        path
    }

    #[tokio::test]
    async fn test_extracts_into_destination() {
        let temp_dir = TempDir::new().unwrap();
        let tarball = make_archive(temp_dir.path());
        let dest = temp_dir.path().join("slot");

        let extractor = Extractor::discover().unwrap();
        extractor.extract(&tarball, &dest).await.unwrap();

        assert_eq!(
            fs::read_to_string(dest.join("main.js")).unwrap(),
            "console.log('hi')"
        );
        assert!(dest.join("lib/a.js").exists());
    }

    #[tokio::test]
    async fn test_corrupt_archive_fails() {
        let temp_dir = TempDir::new().unwrap();
        let bogus = temp_dir.path().join("bogus.tar");
        fs::write(&bogus, b"definitely not a tarball").unwrap();

        let extractor = Extractor::discover().unwrap();
        let err = extractor
            .extract(&bogus, &temp_dir.path().join("slot"))
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::Failed { .. }));
    }

    #[test]
    fn test_discovery_without_tools() {
        let temp_dir = TempDir::new().unwrap();
        let err = Extractor::discover_in(temp_dir.path().as_os_str()).unwrap_err();
        assert!(matches!(err, ArchiveError::ToolMissing));
    }
}
