// Debug bridge supervision
//
// The bridge is an external program translating the runtime's native debug
// protocol for a browser. It reports its own lifecycle as JSON lines on stdout;
// a server error means the web port is wedged, so strays are killed by name and
// the bridge is started again after a fixed pause.

use crate::daemon::process::{ManagedProcess, ProcessError, ProcessMessage, ProcessTag, Role};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Substring of the bridge banner printed once the browser side is up
pub const CONNECTED_MARKER: &str = "Node Inspector";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Stopped,
    Starting,
    Listening,
    Connected,
    /// A retry is scheduled after a server error
    Restarting,
}

impl BridgeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BridgeState::Stopped => "stopped",
            BridgeState::Starting => "starting",
            BridgeState::Listening => "listening",
            BridgeState::Connected => "connected",
            BridgeState::Restarting => "restarting",
        }
    }
}

/// What a line of bridge stdout meant
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeSignal {
    Listening(String),
    ServerError(Value),
    Connected,
}

/// Fired when a scheduled restart is due
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeRetry {
    pub generation: u64,
    pub attempt: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("debug bridge failed to start: {0}")]
    Spawn(#[from] ProcessError),
}

#[derive(Debug, Deserialize)]
struct BridgeLine {
    event: String,
    #[serde(default)]
    address: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

pub struct DebugBridge {
    program: String,
    v8_port: u16,
    web_port: u16,
    retry_delay: Duration,
    state: BridgeState,
    attempt: u32,
    process: Option<ManagedProcess>,
    line_buf: Vec<u8>,
    retry: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for DebugBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebugBridge")
            .field("program", &self.program)
            .field("state", &self.state)
            .field("attempt", &self.attempt)
            .finish()
    }
}

impl DebugBridge {
    pub fn new(program: impl Into<String>, v8_port: u16, web_port: u16, retry_delay: Duration) -> Self {
        Self {
            program: program.into(),
            v8_port,
            web_port,
            retry_delay,
            state: BridgeState::Stopped,
            attempt: 0,
            process: None,
            line_buf: Vec::new(),
            retry: None,
        }
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    /// Number of start attempts so far
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg(format!("--debug-port={}", self.v8_port))
            .arg(format!("--web-port={}", self.web_port));
        cmd
    }

    /// Spawn the bridge, replacing any running instance
    pub fn start<T>(&mut self, generation: u64, tx: mpsc::UnboundedSender<T>) -> Result<(), BridgeError>
    where
        T: From<ProcessMessage> + Send + 'static,
    {
        self.cancel_retry();
        self.kill_process();
        self.attempt += 1;
        self.line_buf.clear();

        let tag = ProcessTag {
            generation,
            role: Role::Bridge {
                attempt: self.attempt,
            },
        };
        match ManagedProcess::spawn(self.command(), tag, tx) {
            Ok(process) => {
                info!(
                    attempt = self.attempt,
                    v8_port = self.v8_port,
                    web_port = self.web_port,
                    "Debug bridge starting"
                );
                self.process = Some(process);
                self.state = BridgeState::Starting;
                Ok(())
            }
            Err(e) => {
                self.state = BridgeState::Stopped;
                Err(e.into())
            }
        }
    }

    /// Whether a message came from the live bridge process
    pub fn owns(&self, tag: &ProcessTag) -> bool {
        self.process.is_some()
            && tag.role
                == Role::Bridge {
                    attempt: self.attempt,
                }
    }

    /// Feed a stdout chunk; returns one signal per recognised complete line
    pub fn on_stdout(&mut self, chunk: &[u8]) -> Vec<BridgeSignal> {
        self.line_buf.extend_from_slice(chunk);
        let mut signals = Vec::new();

        while let Some(pos) = self.line_buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.line_buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            if let Some(signal) = self.classify(line.trim()) {
                signals.push(signal);
            }
        }

        signals
    }

    fn classify(&mut self, line: &str) -> Option<BridgeSignal> {
        if line.is_empty() {
            return None;
        }

        if let Ok(parsed) = serde_json::from_str::<BridgeLine>(line) {
            return match parsed.event.as_str() {
                "SERVER.LISTENING" => {
                    let url = parsed
                        .address
                        .as_ref()
                        .and_then(|a| a.get("url"))
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    info!(url = %url, "Debug bridge listening");
                    if self.state == BridgeState::Starting {
                        self.state = BridgeState::Listening;
                    }
                    Some(BridgeSignal::Listening(url))
                }
                "SERVER.ERROR" => {
                    let code = parsed
                        .error
                        .as_ref()
                        .and_then(|e| e.get("code"))
                        .cloned()
                        .unwrap_or(Value::Null);
                    warn!(code = %code, "Debug bridge server error");
                    Some(BridgeSignal::ServerError(code))
                }
                other => {
                    debug!(event = other, "Ignoring bridge event");
                    None
                }
            };
        }

        if line.contains(CONNECTED_MARKER) && self.state != BridgeState::Connected {
            self.state = BridgeState::Connected;
            return Some(BridgeSignal::Connected);
        }

        None
    }

    /// Kill the current instance, then start again after the retry delay.
    ///
    /// Returns false when a restart is already pending, so each error
    /// produces at most one restart.
    pub fn schedule_retry<T>(&mut self, generation: u64, tx: mpsc::UnboundedSender<T>) -> bool
    where
        T: From<BridgeRetry> + Send + 'static,
    {
        if self.state == BridgeState::Restarting || self.state == BridgeState::Stopped {
            return false;
        }

        self.kill_process();
        self.state = BridgeState::Restarting;

        let program = self.program.clone();
        let delay = self.retry_delay;
        let retry = BridgeRetry {
            generation,
            attempt: self.attempt,
        };
        self.retry = Some(tokio::spawn(async move {
            kill_strays(&program).await;
            tokio::time::sleep(delay).await;
            let _ = tx.send(T::from(retry));
        }));
        true
    }

    /// Whether a fired retry should go ahead
    pub fn accepts_retry(&self, retry: &BridgeRetry) -> bool {
        self.state == BridgeState::Restarting && retry.attempt == self.attempt
    }

    /// The live bridge process exited on its own
    pub fn on_exit(&mut self) {
        self.process = None;
        self.line_buf.clear();
        if self.state != BridgeState::Restarting {
            self.state = BridgeState::Stopped;
        }
    }

    /// Kill the bridge and cancel any pending retry. Idempotent.
    pub fn stop(&mut self) {
        self.cancel_retry();
        self.kill_process();
        self.line_buf.clear();
        self.state = BridgeState::Stopped;
    }

    fn cancel_retry(&mut self) {
        if let Some(handle) = self.retry.take() {
            handle.abort();
        }
    }

    fn kill_process(&mut self) {
        if let Some(mut process) = self.process.take() {
            if let Err(e) = process.kill() {
                debug!("Bridge kill skipped: {}", e);
            }
        }
    }
}

impl Drop for DebugBridge {
    fn drop(&mut self) {
        self.cancel_retry();
    }
}

/// `pkill -f <program>`; a missing pkill or no match is fine
async fn kill_strays(program: &str) {
    match Command::new("pkill").arg("-f").arg(program).status().await {
        Ok(status) => debug!(program, code = ?status.code(), "Killed stray bridges"),
        Err(e) => debug!(program, "pkill unavailable: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::process::ProcessEvent;
    use crate::test_utils::write_script;
    use tempfile::TempDir;

    #[derive(Debug)]
    enum Input {
        Process(ProcessMessage),
        Retry(BridgeRetry),
    }

    impl From<ProcessMessage> for Input {
        fn from(m: ProcessMessage) -> Self {
            Input::Process(m)
        }
    }

    impl From<BridgeRetry> for Input {
        fn from(r: BridgeRetry) -> Self {
            Input::Retry(r)
        }
    }

    fn bridge(program: &str) -> DebugBridge {
        DebugBridge::new(program, 5858, 7878, Duration::from_millis(20))
    }

    /// Script with a path unique enough for `pkill -f` to hit only itself
    fn fake_bridge(dir: &TempDir, body: &str) -> String {
        write_script(dir.path(), "fake-bridge.sh", body)
            .display()
            .to_string()
    }

    #[test]
    fn test_classifies_lines_across_chunks() {
        let mut b = bridge("unused");
        b.state = BridgeState::Starting;

        assert!(b
            .on_stdout(br#"{"event":"SERVER.LISTENING","address":{"url":"http://"#)
            .is_empty());
        let signals = b.on_stdout(b"127.0.0.1:7878/\"}}\nNode Inspector v1 is now running\n");

        assert_eq!(
            signals,
            vec![
                BridgeSignal::Listening("http://127.0.0.1:7878/".to_string()),
                BridgeSignal::Connected,
            ]
        );
        assert_eq!(b.state(), BridgeState::Connected);

        // Repeating the banner does not re-announce
        assert!(b.on_stdout(b"Node Inspector again\n").is_empty());
    }

    #[test]
    fn test_server_error_carries_code() {
        let mut b = bridge("unused");
        let signals = b.on_stdout(b"{\"event\":\"SERVER.ERROR\",\"error\":{\"code\":\"EADDRINUSE\"}}\n");
        assert_eq!(
            signals,
            vec![BridgeSignal::ServerError(Value::String("EADDRINUSE".into()))]
        );
    }

    #[tokio::test]
    async fn test_one_restart_per_error() {
        let (tx, mut rx) = mpsc::unbounded_channel::<Input>();
        let dir = TempDir::new().unwrap();
        let mut b = bridge(&fake_bridge(&dir, "exit 0"));
        b.start(1, tx.clone()).unwrap();
        assert_eq!(b.attempt(), 1);

        assert!(b.schedule_retry(1, tx.clone()));
        assert!(!b.schedule_retry(1, tx.clone()), "second error while pending");
        assert_eq!(b.state(), BridgeState::Restarting);

        let retry = loop {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap() {
                Some(Input::Retry(r)) => break r,
                Some(Input::Process(_)) => continue,
                None => panic!("channel closed"),
            }
        };
        assert_eq!(retry, BridgeRetry { generation: 1, attempt: 1 });
        assert!(b.accepts_retry(&retry));

        b.start(1, tx).unwrap();
        assert_eq!(b.attempt(), 2);
        assert!(!b.accepts_retry(&retry));
    }

    #[tokio::test]
    async fn test_stop_cancels_pending_retry() {
        let (tx, mut rx) = mpsc::unbounded_channel::<Input>();
        let dir = TempDir::new().unwrap();
        let mut b = bridge(&fake_bridge(&dir, "exit 0"));
        b.start(4, tx.clone()).unwrap();
        assert!(b.schedule_retry(4, tx.clone()));

        b.stop();
        b.stop();
        assert_eq!(b.state(), BridgeState::Stopped);
        drop(tx);

        // Only process events (if any) arrive; the retry never fires
        while let Ok(Some(input)) = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await {
            assert!(matches!(input, Input::Process(_)), "unexpected {:?}", input);
        }
    }

    #[tokio::test]
    async fn test_exit_of_replaced_process_is_not_owned() {
        let (tx, mut rx) = mpsc::unbounded_channel::<Input>();
        let dir = TempDir::new().unwrap();
        let mut b = bridge(&fake_bridge(&dir, "exit 0"));
        b.start(2, tx.clone()).unwrap();
        b.start(2, tx).unwrap();

        while let Some(Input::Process(msg)) = rx.recv().await {
            if let ProcessEvent::Exited { .. } = msg.event {
                let first = ProcessTag {
                    generation: 2,
                    role: Role::Bridge { attempt: 1 },
                };
                if msg.tag == first {
                    assert!(!b.owns(&msg.tag));
                    return;
                }
            }
        }
        panic!("first bridge never reported exit");
    }
}
