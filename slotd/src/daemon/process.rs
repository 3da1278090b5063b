// Child process runtime for supervised programs
//
// Wraps tokio::process to give every child the same lifecycle:
// - piped stdout/stderr forwarded as tagged chunks over one channel
// - a single exit notification once the child is reaped and its pipes drain
// - kill on request or when the handle is dropped

use std::io;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// How long to keep draining pipes after the child is reaped.
///
/// Grandchildren can inherit the pipes and hold them open indefinitely.
const DRAIN_GRACE: Duration = Duration::from_millis(250);

const READ_CHUNK: usize = 8 * 1024;

/// Which supervised program a message belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    App,
    Installer,
    Bridge { attempt: u32 },
}

/// Identifies the lifecycle a child was spawned in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessTag {
    pub generation: u64,
    pub role: Role,
}

/// Events emitted by a managed child
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    /// Sent exactly once. `None` when the child was killed by a signal.
    Exited { code: Option<i32> },
    /// The child could not be waited on
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessMessage {
    pub tag: ProcessTag,
    pub event: ProcessEvent,
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("process already exited")]
    NotRunning,
}

/// Handle to a running child
pub struct ManagedProcess {
    tag: ProcessTag,
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
    alive: Arc<AtomicBool>,
}

impl std::fmt::Debug for ManagedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedProcess")
            .field("tag", &self.tag)
            .field("pid", &self.pid)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl ManagedProcess {
    /// Spawn `cmd` with piped output and start pumping its events into `tx`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<T>(
        mut cmd: Command,
        tag: ProcessTag,
        tx: mpsc::UnboundedSender<T>,
    ) -> Result<Self, ProcessError>
    where
        T: From<ProcessMessage> + Send + 'static,
    {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let program = cmd.as_std().get_program().to_string_lossy().into_owned();
        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            program: program.clone(),
            source,
        })?;

        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (kill_tx, kill_rx) = oneshot::channel();
        let alive = Arc::new(AtomicBool::new(true));

        debug!(program = %program, pid = ?pid, ?tag, "Spawned child");

        tokio::spawn(pump(
            child,
            stdout,
            stderr,
            tag,
            tx,
            kill_rx,
            Arc::clone(&alive),
        ));

        Ok(Self {
            tag,
            pid,
            kill_tx: Some(kill_tx),
            alive,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Request the child be killed. Its `Exited` event still follows.
    pub fn kill(&mut self) -> Result<(), ProcessError> {
        if !self.is_alive() {
            return Err(ProcessError::NotRunning);
        }
        match self.kill_tx.take() {
            Some(tx) => tx.send(()).map_err(|_| ProcessError::NotRunning),
            None => Err(ProcessError::NotRunning),
        }
    }
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn read_chunk<R: AsyncRead + Unpin>(
    reader: &mut Option<R>,
    buf: &mut [u8],
) -> io::Result<usize> {
    match reader {
        Some(r) => r.read(buf).await,
        None => std::future::pending().await,
    }
}

async fn pump<T>(
    mut child: Child,
    mut stdout: Option<ChildStdout>,
    mut stderr: Option<ChildStderr>,
    tag: ProcessTag,
    tx: mpsc::UnboundedSender<T>,
    mut kill_rx: oneshot::Receiver<()>,
    alive: Arc<AtomicBool>,
) where
    T: From<ProcessMessage> + Send + 'static,
{
    let send = |event: ProcessEvent| {
        let _ = tx.send(T::from(ProcessMessage { tag, event }));
    };

    let mut out_buf = vec![0u8; READ_CHUNK];
    let mut err_buf = vec![0u8; READ_CHUNK];
    let mut kill_armed = true;
    let mut exit: Option<Result<Option<i32>, String>> = None;
    let drain_deadline = tokio::time::sleep(Duration::MAX);
    tokio::pin!(drain_deadline);

    loop {
        if exit.is_some() && stdout.is_none() && stderr.is_none() {
            break;
        }

        tokio::select! {
            read = read_chunk(&mut stdout, &mut out_buf), if stdout.is_some() => match read {
                Ok(0) | Err(_) => stdout = None,
                Ok(n) => send(ProcessEvent::Stdout(out_buf[..n].to_vec())),
            },
            read = read_chunk(&mut stderr, &mut err_buf), if stderr.is_some() => match read {
                Ok(0) | Err(_) => stderr = None,
                Ok(n) => send(ProcessEvent::Stderr(err_buf[..n].to_vec())),
            },
            _ = &mut kill_rx, if kill_armed => {
                // Either an explicit kill or the handle was dropped
                kill_armed = false;
                if let Err(e) = child.start_kill() {
                    debug!(?tag, "Kill failed: {}", e);
                }
            }
            status = child.wait(), if exit.is_none() => {
                exit = Some(match status {
                    Ok(status) => Ok(status.code()),
                    Err(e) => Err(e.to_string()),
                });
                alive.store(false, Ordering::SeqCst);
                drain_deadline
                    .as_mut()
                    .reset(tokio::time::Instant::now() + DRAIN_GRACE);
            }
            _ = &mut drain_deadline, if exit.is_some() => {
                debug!(?tag, "Output pipes still open after exit; closing");
                break;
            }
        }
    }

    alive.store(false, Ordering::SeqCst);
    match exit {
        Some(Ok(code)) => send(ProcessEvent::Exited { code }),
        Some(Err(e)) => {
            warn!(?tag, "Failed to wait on child: {}", e);
            send(ProcessEvent::Failed(e));
        }
        None => send(ProcessEvent::Exited { code: None }),
    }
}

/// Probe a PID with signal 0
pub fn is_process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: kill with signal 0 only checks for existence/permission
    unsafe { libc::kill(pid, 0) == 0 }
}

fn terminate(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: sending SIGTERM to a PID we spawned
    unsafe { libc::kill(pid, libc::SIGTERM) == 0 }
}

/// Process-wide list of application PIDs spawned by the supervisor
#[derive(Debug, Default)]
pub struct ProcessTable {
    pids: Vec<u32>,
}

impl ProcessTable {
    pub fn push(&mut self, pid: u32) {
        self.pids.push(pid);
    }

    pub fn pids(&self) -> &[u32] {
        &self.pids
    }

    /// Drop a PID once its process has been reaped
    pub fn forget(&mut self, pid: u32) {
        self.pids.retain(|&p| p != pid);
    }

    /// SIGTERM every live entry and drop entries that are gone.
    ///
    /// Entries that were alive at the probe stay listed until a later sweep
    /// confirms them dead.
    pub fn sweep(&mut self) {
        self.pids.retain(|&pid| {
            if !is_process_alive(pid) {
                return false;
            }
            if terminate(pid) {
                debug!(pid, "Sent SIGTERM to tracked process");
                true
            } else {
                false
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TAG: ProcessTag = ProcessTag {
        generation: 7,
        role: Role::App,
    };

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    async fn collect(
        rx: &mut mpsc::UnboundedReceiver<ProcessMessage>,
    ) -> (String, String, ProcessEvent) {
        let mut stdout = String::new();
        let mut stderr = String::new();
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for child")
                .expect("channel closed");
            assert_eq!(msg.tag, TAG);
            match msg.event {
                ProcessEvent::Stdout(b) => stdout.push_str(&String::from_utf8_lossy(&b)),
                ProcessEvent::Stderr(b) => stderr.push_str(&String::from_utf8_lossy(&b)),
                done => return (stdout, stderr, done),
            }
        }
    }

    #[tokio::test]
    async fn test_output_and_exit_code() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let proc = ManagedProcess::spawn(sh("echo out; echo err >&2; exit 3"), TAG, tx).unwrap();
        assert!(proc.pid().is_some());

        let (stdout, stderr, done) = collect(&mut rx).await;
        assert_eq!(stdout, "out\n");
        assert_eq!(stderr, "err\n");
        assert_eq!(done, ProcessEvent::Exited { code: Some(3) });
        assert!(!proc.is_alive());
    }

    #[tokio::test]
    async fn test_kill_reports_signal_exit() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut proc = ManagedProcess::spawn(sh("exec sleep 30"), TAG, tx).unwrap();

        proc.kill().unwrap();
        let (_, _, done) = collect(&mut rx).await;
        assert_eq!(done, ProcessEvent::Exited { code: None });
        assert!(matches!(proc.kill(), Err(ProcessError::NotRunning)));
    }

    #[tokio::test]
    async fn test_drop_kills_child() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let proc = ManagedProcess::spawn(sh("exec sleep 30"), TAG, tx).unwrap();
        let pid = proc.pid().unwrap();
        drop(proc);

        let (_, _, done) = collect(&mut rx).await;
        assert_eq!(done, ProcessEvent::Exited { code: None });
        assert!(!is_process_alive(pid));
    }

    #[tokio::test]
    async fn test_spawn_failure_names_program() {
        let (tx, _rx) = mpsc::unbounded_channel::<ProcessMessage>();
        let err = ManagedProcess::spawn(Command::new("/nonexistent/slotd-runtime"), TAG, tx)
            .unwrap_err();
        assert!(err.to_string().contains("/nonexistent/slotd-runtime"));
    }

    #[tokio::test]
    async fn test_sweep_terminates_and_compacts() {
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let live = child.id();

        let mut table = ProcessTable::default();
        table.push(live);
        table.push(u32::MAX); // not a valid pid

        table.sweep();
        assert_eq!(table.pids(), &[live]);

        child.wait().unwrap();
        table.sweep();
        assert!(table.pids().is_empty());
    }

    #[test]
    fn test_forget_removes_only_that_pid() {
        let mut table = ProcessTable::default();
        table.push(41);
        table.push(42);
        table.forget(41);
        assert_eq!(table.pids(), &[42]);
        table.forget(41);
        assert_eq!(table.pids(), &[42]);
    }
}
