//! Test helpers shared by unit and integration tests
//!
//! Polling assertions for asynchronous daemon behavior, plus fixtures that
//! stand in for the external programs the daemon drives (runtime, package
//! tool, debug bridge) and for the archives it receives.

use std::fmt::Display;
use std::fs;
use std::future::Future;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Interval between attempts in the polling assertions
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Poll `f` until it returns `Ok`, panicking with the last error after `timeout`.
///
/// ```rust,ignore
/// let status = assert_eventually("app to stop", Duration::from_secs(3), || async {
///     match client.status().await {
///         Ok(s) if !s.is_running => Ok(s),
///         Ok(_) => Err("still running".to_string()),
///         Err(e) => Err(e.to_string()),
///     }
/// })
/// .await;
/// ```
pub async fn assert_eventually<F, Fut, T, E>(desc: &str, timeout: Duration, mut f: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let start = Instant::now();
    let mut attempts = 0;

    loop {
        attempts += 1;
        let last_error = match f().await {
            Ok(value) => return value,
            Err(e) => e.to_string(),
        };

        if start.elapsed() >= timeout {
            panic!(
                "Timeout waiting for {} after {:?} ({} attempts); last error: {}",
                desc,
                start.elapsed(),
                attempts,
                last_error
            );
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Boolean form of [`assert_eventually`]
pub async fn assert_eventually_bool<F, Fut>(desc: &str, timeout: Duration, mut f: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    assert_eventually(desc, timeout, || {
        let fut = f();
        async move {
            if fut.await {
                Ok(())
            } else {
                Err("condition never became true")
            }
        }
    })
    .await
}

/// Write an executable `#!/bin/sh` script and return its path
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create script directory");
    }
    fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("write script");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod script");
    }
    path
}

/// A port nothing was listening on a moment ago
pub fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .and_then(|l| l.local_addr())
        .map(|a| a.port())
        .expect("bind ephemeral port")
}

/// Build a tar archive holding `files` (relative path, contents) using the system tar
pub fn make_tarball(dir: &Path, files: &[(&str, &str)]) -> Vec<u8> {
    let staging = dir.join(format!("tar-staging-{}", files.len()));
    for (name, contents) in files {
        let path = staging.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create staging dir");
        }
        fs::write(&path, contents).expect("write staged file");
    }
    fs::create_dir_all(&staging).expect("create staging dir");

    let tarball = dir.join("fixture.tar");
    let status = std::process::Command::new("tar")
        .arg("-cf")
        .arg(&tarball)
        .arg("-C")
        .arg(&staging)
        .arg(".")
        .status()
        .expect("run tar");
    assert!(status.success(), "tar failed to build fixture");
    fs::read(&tarball).expect("read tarball")
}
