// Crash recording
//
// A fatal error is written to crash.log synchronously before the process
// exits. The next start reads the text into memory, clears the file, and hands
// it to the first client that connects.

use once_cell::sync::Lazy;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::error;

/// Exit code used after a recorded panic
pub const PANIC_EXIT_CODE: i32 = 70;

/// How long a panicking process waits for the client writer to flush
const NOTIFY_GRACE: Duration = Duration::from_millis(150);

type ClientNotifier = Box<dyn Fn(String) + Send + Sync>;

/// Sink for fatal errors towards the connected client, if any
static LIVE_CLIENT: Lazy<Mutex<Option<ClientNotifier>>> = Lazy::new(|| Mutex::new(None));

/// Durable single-slot crash record
#[derive(Debug, Clone)]
pub struct CrashRecorder {
    path: PathBuf,
}

impl CrashRecorder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the pending record and clear the file.
    ///
    /// Returns `None` when there is no file or it is empty.
    pub fn take_pending(&self) -> io::Result<Option<String>> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        fs::write(&self.path, "")?;

        let text = text.trim().to_string();
        Ok(Some(text).filter(|t| !t.is_empty()))
    }

    /// Overwrite the record and flush it to disk
    pub fn record(&self, message: &str) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)?;
        writeln!(
            file,
            "[{}] {}",
            chrono::Utc::now().to_rfc3339(),
            message.trim_end()
        )?;
        file.sync_all()
    }
}

/// Route fatal errors to the current client, or clear the route with `None`
pub fn set_client_notifier(notifier: Option<ClientNotifier>) {
    let mut slot = LIVE_CLIENT.lock().unwrap_or_else(|e| e.into_inner());
    *slot = notifier;
}

/// Best-effort delivery of a fatal error to the connected client
pub fn notify_client(message: &str) -> bool {
    // try_lock: the panic may have happened while the slot was held
    match LIVE_CLIENT.try_lock() {
        Ok(slot) => match slot.as_ref() {
            Some(notify) => {
                notify(message.to_string());
                true
            }
            None => false,
        },
        Err(_) => false,
    }
}

/// Record the crash, tell the client, and exit with `code`
pub fn record_fatal(recorder: &CrashRecorder, message: &str, code: i32) -> ! {
    error!(code, "Fatal: {}", message);
    if let Err(e) = recorder.record(message) {
        error!(path = %recorder.path().display(), "Failed to write crash record: {}", e);
    }
    if notify_client(message) {
        std::thread::sleep(NOTIFY_GRACE);
    }
    std::process::exit(code)
}

/// Turn every panic into a recorded crash
pub fn install_panic_hook(recorder: CrashRecorder) {
    std::panic::set_hook(Box::new(move |info| {
        let message = format!("{}", info);
        record_fatal(&recorder, &message, PANIC_EXIT_CODE);
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_record_then_take_once() {
        let temp_dir = TempDir::new().unwrap();
        let recorder = CrashRecorder::new(temp_dir.path().join("crash.log"));

        assert_eq!(recorder.take_pending().unwrap(), None);

        recorder.record("thread 'main' panicked at boom").unwrap();
        let pending = recorder.take_pending().unwrap().unwrap();
        assert!(pending.contains("panicked at boom"));

        // Cleared after the first read
        assert_eq!(recorder.take_pending().unwrap(), None);
        assert!(recorder.path().exists());
    }

    #[test]
    fn test_record_overwrites_previous() {
        let temp_dir = TempDir::new().unwrap();
        let recorder = CrashRecorder::new(temp_dir.path().join("nested/crash.log"));

        recorder.record("first").unwrap();
        recorder.record("second").unwrap();
        let pending = recorder.take_pending().unwrap().unwrap();
        assert!(pending.ends_with("second"));
        assert!(!pending.contains("first"));
    }

    #[test]
    fn test_client_notifier_route() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        set_client_notifier(Some(Box::new(move |msg| {
            sink.lock().unwrap().push(msg);
        })));

        assert!(notify_client("fatal thing"));
        assert_eq!(seen.lock().unwrap().as_slice(), ["fatal thing".to_string()]);

        set_client_notifier(None);
        assert!(!notify_client("nobody listening"));
    }
}
