use anyhow::Result;
use slotd_lib::daemon::{
    client::DaemonClient,
    config::Config,
    server::{ExitReason, SessionServer},
};
use slotd_lib::test_utils::{assert_eventually, free_port, write_script};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub const READY_TIMEOUT: Duration = Duration::from_secs(5);
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Config rooted in `home` with fake tools and nothing that touches the host
pub fn hermetic_config(home: &Path) -> Config {
    let mut config = Config::with_home(home.join("home"));
    config.app_dir = home.join("app");
    config.tmp_dir = home.join("tmp");
    config.base_port = free_port();
    config.advertise = false;
    config.autorun = false;
    config.runtime = write_script(home, "runtime.sh", "exec sh \"$1/main.sh\"")
        .display()
        .to_string();
    config.package_tool = write_script(home, "npm.sh", "echo \"npm $1\"; exit 0")
        .display()
        .to_string();
    config.clock_program = write_script(home, "date.sh", "exit 0").display().to_string();
    config.clock_confirm_delay = Duration::from_millis(50);
    config
}

/// In-process slotd serving on a free port. Shut down on drop.
pub struct DaemonGuard {
    pub dir: TempDir,
    pub config: Config,
    pub port: u16,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<Result<ExitReason>>>,
}

impl DaemonGuard {
    pub async fn start() -> Self {
        Self::start_with(|_, _| {}, None).await
    }

    /// Start after `configure` adjusts the hermetic config, replaying `pending_crash`
    pub async fn start_with<F>(configure: F, pending_crash: Option<String>) -> Self
    where
        F: FnOnce(&Path, &mut Config),
    {
        let dir = TempDir::new().unwrap();
        let mut config = hermetic_config(dir.path());
        configure(dir.path(), &mut config);
        config.ensure_dirs().unwrap();

        let server = SessionServer::bind(config.clone(), pending_crash)
            .await
            .unwrap();
        let port = server.local_port();
        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(server.run(async move {
            let _ = shutdown_rx.await;
        }));

        Self {
            dir,
            config,
            port,
            shutdown: Some(shutdown),
            task: Some(task),
        }
    }

    /// Connect and consume the greeting
    pub async fn client(&self) -> DaemonClient {
        let mut client = DaemonClient::connect("127.0.0.1", self.port).await.unwrap();
        client.greeting(READY_TIMEOUT).await.unwrap();
        client
    }

    /// Put an application script into the app slot
    pub fn install_app(&self, body: &str) -> PathBuf {
        write_script(&self.config.app_dir, "main.sh", body)
    }

    /// Wait for the control loop to stop on its own. The temp dir stays until drop.
    pub async fn exit_reason(&mut self) -> ExitReason {
        let task = self.task.take().expect("daemon already stopped");
        tokio::time::timeout(EVENT_TIMEOUT, task)
            .await
            .expect("daemon did not exit")
            .unwrap()
            .unwrap()
    }

    pub async fn shutdown(&mut self) -> ExitReason {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.exit_reason().await
    }
}

impl Drop for DaemonGuard {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// The compiled slotd binary, killed on drop
pub struct BinaryGuard {
    child: Child,
    pub port: u16,
}

impl BinaryGuard {
    pub async fn start(home: &Path) -> Self {
        let port = free_port();
        let child = Command::new(env!("CARGO_BIN_EXE_slotd"))
            .env("SLOTD_HOME", home)
            .env("SLOTD_APP_DIR", home.join("app"))
            .env("SLOTD_HOST", "127.0.0.1")
            .env("SLOTD_BASE_PORT", port.to_string())
            .env("SLOTD_NO_AUTORUN", "1")
            .env("SLOTD_NO_MDNS", "1")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn slotd");

        let guard = Self { child, port };
        assert_eventually("slotd to accept connections", READY_TIMEOUT, || async move {
            tokio::net::TcpStream::connect(("127.0.0.1", port))
                .await
                .map(|_| ())
        })
        .await;
        guard
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Exit code once the process has exited on its own
    pub async fn wait_exit(&mut self, timeout: Duration) -> Option<i32> {
        let child = &mut self.child;
        assert_eventually("slotd to exit", timeout, || {
            let status = child.try_wait();
            async move {
                match status {
                    Ok(Some(status)) => Ok(status.code()),
                    Ok(None) => Err("still running".to_string()),
                    Err(e) => Err(e.to_string()),
                }
            }
        })
        .await
    }
}

impl Drop for BinaryGuard {
    fn drop(&mut self) {
        if let Ok(Some(_)) = self.child.try_wait() {
            return;
        }
        if let Err(err) = self.child.kill() {
            eprintln!("Failed to terminate slotd pid {}: {}", self.child.id(), err);
            return;
        }
        let _ = self.child.wait();
    }
}
