// Session server: the WebSocket control socket
//
// One control task owns the supervisor, the armed binary task and the current
// connection. Accept, per-connection reader/writer, uploads and updates run as
// their own tasks and report back over a single channel, so every mutation of
// daemon state happens in one place.

use crate::daemon::advertise::Advertiser;
use crate::daemon::archive::Extractor;
use crate::daemon::config::Config;
use crate::daemon::crash;
use crate::daemon::package_tool::PackageTool;
use crate::daemon::persistence::SettingsStore;
use crate::daemon::protocol::{
    banner, BinaryTask, ControlMessage, Frame, UploadFile, DEFAULT_UPLOAD_NAME,
};
use crate::daemon::slots::{clear_dir, UpdateSlots};
use crate::daemon::supervisor::{AppEvent, Supervisor};
use crate::daemon::updater::{RollbackManager, UpdateError};
use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// Ports tried above the base before giving up
const MAX_PORT_ATTEMPTS: u16 = 100;

/// How long the exit path waits for queued frames to reach the client
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Why the control loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// A self-update was installed; the launcher starts the new code
    Updated,
    /// Settings were changed with `config:set`
    ConfigChanged,
    /// Signal or caller-requested shutdown
    Shutdown,
}

/// Write side of one client connection
struct Connection {
    id: u64,
    peer: SocketAddr,
    tx: mpsc::UnboundedSender<Message>,
    open: Arc<AtomicBool>,
    writer: JoinHandle<()>,
}

impl Connection {
    /// Queue a frame; dropped silently once the socket is closed
    fn send(&self, frame: &Frame) {
        if !self.open.load(Ordering::SeqCst) {
            return;
        }
        match frame.encode() {
            Ok(text) => {
                if self.tx.send(Message::Text(text)).is_err() {
                    self.open.store(false, Ordering::SeqCst);
                }
            }
            Err(e) => warn!("Failed to encode frame: {}", e),
        }
    }

    /// Close the socket after everything queued so far is written
    async fn flush_and_close(self) {
        let _ = self.tx.send(Message::Close(None));
        drop(self.tx);
        if tokio::time::timeout(FLUSH_TIMEOUT, self.writer).await.is_err() {
            debug!(id = self.id, "Timed out flushing connection");
        }
    }
}

/// Everything the control task reacts to besides supervisor input
enum DaemonEvent {
    Connected(Connection),
    Text { id: u64, text: String },
    Binary { id: u64, bytes: Vec<u8> },
    Closed { id: u64 },
    /// Frame produced by a background task for the current client
    Outbound(Frame),
    UploadFinished {
        task: BinaryTask,
        result: Result<PathBuf, String>,
    },
    UpdateFinished(Result<(), UpdateError>),
}

/// A bound control socket, ready to serve
pub struct SessionServer {
    config: Config,
    listener: TcpListener,
    port: u16,
    settings: Arc<Mutex<SettingsStore>>,
    advertiser: Option<Advertiser>,
    pending_crash: Option<String>,
}

impl SessionServer {
    /// Bind the first free port at or above the configured base and advertise it
    pub async fn bind(config: Config, pending_crash: Option<String>) -> Result<Self> {
        let settings = SettingsStore::open(config.settings_file());
        let (listener, port) = bind_first_free(&config.listen_host, config.base_port).await?;
        info!(host = %config.listen_host, port, "Control socket listening");

        let mut advertiser = None;
        if config.advertise {
            match Advertiser::new() {
                Ok(mut a) => {
                    if let Err(e) = a.advertise(&settings.settings().name, port) {
                        warn!("mDNS advertisement failed: {}", e);
                    }
                    advertiser = Some(a);
                }
                Err(e) => warn!("mDNS unavailable: {}", e),
            }
        }

        Ok(Self {
            config,
            listener,
            port,
            settings: Arc::new(Mutex::new(settings)),
            advertiser,
            pending_crash,
        })
    }

    pub fn local_port(&self) -> u16 {
        self.port
    }

    /// Serve until an update, a settings change, or `shutdown` resolves
    pub async fn run<S>(self, shutdown: S) -> Result<ExitReason>
    where
        S: Future<Output = ()>,
    {
        let Self {
            config,
            listener,
            port: _,
            settings,
            advertiser: _advertiser,
            pending_crash,
        } = self;

        config
            .ensure_dirs()
            .context("Failed to create daemon directories")?;

        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<DaemonEvent>();
        let (supervisor_tx, mut supervisor_rx) = mpsc::unbounded_channel();
        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&settings),
            events_tx.clone(),
        ));

        let rollback = Arc::new(RollbackManager::new(
            UpdateSlots::new(config.slots_root().clone()),
            config.tmp_dir.clone(),
            PackageTool::new(config.package_tool.clone()),
        ));
        let mut daemon = DaemonContext {
            supervisor: Supervisor::new(config.clone(), supervisor_tx),
            config,
            settings,
            rollback,
            events_tx,
            connection: None,
            binary_task: None,
            upload: None,
            pending_crash,
            updating: false,
        };

        if daemon.config.autorun {
            info!("Starting application slot at boot");
            daemon.supervisor.run(true);
        }

        tokio::pin!(shutdown);
        let reason = loop {
            tokio::select! {
                Some(input) = supervisor_rx.recv() => {
                    let events = daemon.supervisor.handle(input);
                    daemon.emit_app(events);
                }
                Some(event) = events_rx.recv() => {
                    if let Some(reason) = daemon.handle_event(event) {
                        break reason;
                    }
                }
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break ExitReason::Shutdown;
                }
            }
        };

        info!(?reason, "Control loop stopping");
        accept_task.abort();
        daemon.supervisor.shutdown();
        crash::set_client_notifier(None);
        if let Some(connection) = daemon.connection.take() {
            connection.flush_and_close().await;
        }
        Ok(reason)
    }
}

/// Bind `host:base`, moving to the next port while the address is in use
pub async fn bind_first_free(host: &str, base: u16) -> Result<(TcpListener, u16)> {
    let mut last_err = None;
    for offset in 0..MAX_PORT_ATTEMPTS {
        let Some(port) = base.checked_add(offset) else {
            break;
        };
        match TcpListener::bind((host, port)).await {
            Ok(listener) => {
                let bound = listener.local_addr()?.port();
                return Ok((listener, bound));
            }
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                debug!(port, "Port in use, trying next");
                last_err = Some(e);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to bind {}:{}", host, port));
            }
        }
    }
    Err(last_err.unwrap_or_else(|| io::Error::from(io::ErrorKind::AddrInUse)))
        .with_context(|| format!("No free port at or above {}", base))
}

async fn accept_loop(
    listener: TcpListener,
    settings: Arc<Mutex<SettingsStore>>,
    events: mpsc::UnboundedSender<DaemonEvent>,
) {
    let mut next_id = 0u64;
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                next_id += 1;
                let id = next_id;
                let settings = Arc::clone(&settings);
                let events = events.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(id, stream, peer, settings, events).await {
                        debug!(id, %peer, "Connection ended: {:#}", e);
                    }
                });
            }
            Err(e) => {
                error!("Accept error: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Client address as seen by the whitelist: first X-Forwarded-For hop, else the peer
fn client_address(request: &Request, peer: &SocketAddr) -> String {
    request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| peer.ip().to_string())
}

async fn serve_connection(
    id: u64,
    stream: TcpStream,
    peer: SocketAddr,
    settings: Arc<Mutex<SettingsStore>>,
    events: mpsc::UnboundedSender<DaemonEvent>,
) -> Result<()> {
    let check = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let client = client_address(request, &peer);
        let allowed = settings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .refresh()
            .allows(&client);
        if allowed {
            Ok(response)
        } else {
            warn!(client = %client, "Rejected client not in whitelist");
            let mut rejection = ErrorResponse::new(Some("Unauthorized".to_string()));
            *rejection.status_mut() = StatusCode::UNAUTHORIZED;
            Err(rejection)
        }
    };

    let socket = tokio_tungstenite::accept_hdr_async(stream, check)
        .await
        .context("WebSocket handshake failed")?;
    info!(id, %peer, "Client connected");

    let (mut sink, mut source) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let open = Arc::new(AtomicBool::new(true));

    let writer_open = Arc::clone(&open);
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if sink.send(message).await.is_err() {
                writer_open.store(false, Ordering::SeqCst);
                break;
            }
            if closing {
                break;
            }
        }
    });

    let connection = Connection {
        id,
        peer,
        tx,
        open: Arc::clone(&open),
        writer,
    };
    if events.send(DaemonEvent::Connected(connection)).is_err() {
        return Ok(());
    }

    while let Some(message) = source.next().await {
        let event = match message {
            Ok(Message::Text(text)) => DaemonEvent::Text { id, text },
            Ok(Message::Binary(bytes)) => DaemonEvent::Binary { id, bytes },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(id, "Read error: {}", e);
                break;
            }
        };
        if events.send(event).is_err() {
            break;
        }
    }

    open.store(false, Ordering::SeqCst);
    info!(id, %peer, "Client disconnected");
    let _ = events.send(DaemonEvent::Closed { id });
    Ok(())
}

/// State owned by the control task
struct DaemonContext {
    config: Config,
    supervisor: Supervisor,
    settings: Arc<Mutex<SettingsStore>>,
    rollback: Arc<RollbackManager>,
    events_tx: mpsc::UnboundedSender<DaemonEvent>,
    connection: Option<Connection>,
    /// How the next binary frame is interpreted; consumed by that frame
    binary_task: Option<BinaryTask>,
    upload: Option<UploadFile>,
    pending_crash: Option<String>,
    updating: bool,
}

impl DaemonContext {
    fn emit(&self, frame: Frame) {
        match &self.connection {
            Some(connection) => connection.send(&frame),
            None => debug!(channel = %frame.channel, "No client; dropping frame"),
        }
    }

    fn emit_app(&self, events: Vec<AppEvent>) {
        for event in events {
            self.emit(app_frame(event));
        }
    }

    fn is_current(&self, id: u64) -> bool {
        self.connection.as_ref().is_some_and(|c| c.id == id)
    }

    fn handle_event(&mut self, event: DaemonEvent) -> Option<ExitReason> {
        match event {
            DaemonEvent::Connected(connection) => {
                self.on_connected(connection);
                None
            }
            DaemonEvent::Text { id, text } => {
                if !self.is_current(id) {
                    debug!(id, "Ignoring frame from superseded connection");
                    return None;
                }
                self.on_text(&text)
            }
            DaemonEvent::Binary { id, bytes } => {
                if !self.is_current(id) {
                    debug!(id, "Ignoring binary from superseded connection");
                    return None;
                }
                self.on_binary(bytes);
                None
            }
            DaemonEvent::Closed { id } => {
                if self.is_current(id) {
                    self.connection = None;
                    crash::set_client_notifier(None);
                }
                None
            }
            DaemonEvent::Outbound(frame) => {
                self.emit(frame);
                None
            }
            DaemonEvent::UploadFinished { task, result } => {
                self.on_upload_finished(task, result);
                None
            }
            DaemonEvent::UpdateFinished(result) => {
                self.updating = false;
                match result {
                    Ok(()) => {
                        self.emit(Frame::console("Upgrade complete.  Process restarting"));
                        Some(ExitReason::Updated)
                    }
                    Err(e) => {
                        error!("Upgrade failed: {}", e);
                        self.emit(Frame::error(format!("Upgrade failed: {}", e)));
                        None
                    }
                }
            }
        }
    }

    fn on_connected(&mut self, connection: Connection) {
        if let Some(previous) = self.connection.replace(connection) {
            info!(id = previous.id, peer = %previous.peer, "Connection superseded");
        }

        if let Some(connection) = &self.connection {
            let tx = connection.tx.clone();
            let open = Arc::clone(&connection.open);
            crash::set_client_notifier(Some(Box::new(move |message| {
                if open.load(Ordering::SeqCst) {
                    if let Ok(text) = Frame::error(message).encode() {
                        let _ = tx.send(Message::Text(text));
                    }
                }
            })));
        }

        self.emit(Frame::console(banner()));
        self.emit(Frame::status(&self.supervisor.status()));
        if let Some(text) = self.pending_crash.take() {
            self.emit(Frame::console("Recovering from a crash"));
            self.emit(Frame::console(text));
        }
    }

    fn on_text(&mut self, text: &str) -> Option<ExitReason> {
        let frame = Frame::parse(text);
        let Some(message) = ControlMessage::from_frame(&frame) else {
            debug!(channel = %frame.channel, "Ignoring frame");
            return None;
        };

        match message {
            ControlMessage::Command(command) => {
                self.emit(Frame::console(format!("Message Received: {}", command)));
                let events = self.supervisor.dispatch(&command);
                self.emit_app(events);
            }
            ControlMessage::Upload { task, file } => {
                debug!(task = task.as_str(), ?file, "Upload armed");
                self.binary_task = Some(task);
                self.upload = file;
            }
            ControlMessage::Config { mode, data } => return self.on_config(&mode, data),
            ControlMessage::Debugger(_) => {
                self.emit(Frame::new("debugger", self.supervisor.debugger_info()));
            }
            ControlMessage::Status => {
                self.emit(Frame::status(&self.supervisor.status()));
            }
            ControlMessage::Upgrade => {
                debug!("Upgrade armed");
                self.binary_task = Some(BinaryTask::Upgrade);
                self.upload = None;
            }
        }
        None
    }

    fn on_config(&mut self, mode: &str, data: Value) -> Option<ExitReason> {
        match mode {
            "set" => {
                let result = self
                    .settings
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .apply(&data);
                match result {
                    Ok(()) => {
                        info!("Settings updated; exiting for restart");
                        self.emit(Frame::console("Configuration saved.  Process restarting"));
                        Some(ExitReason::ConfigChanged)
                    }
                    Err(e) => {
                        warn!("Rejected settings update: {:#}", e);
                        self.emit(Frame::error(format!("{:#}", e)));
                        None
                    }
                }
            }
            "time" => {
                match epoch_seconds(&data) {
                    Some(epoch) => self.set_clock(epoch),
                    None => debug!(%data, "Ignoring non-numeric time"),
                }
                None
            }
            other => {
                debug!(mode = other, "Ignoring config mode");
                None
            }
        }
    }

    fn set_clock(&self, epoch: i64) {
        let program = self.config.clock_program.clone();
        let delay = self.config.clock_confirm_delay;
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = tokio::process::Command::new(&program)
                .arg("+%s")
                .arg("-s")
                .arg(format!("@{}", epoch))
                .output()
                .await;
            match result {
                Ok(output) if output.status.success() => info!(epoch, "System clock set"),
                Ok(output) => warn!(
                    epoch,
                    code = ?output.status.code(),
                    "Clock command failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
                Err(e) => warn!(epoch, "Clock command unavailable: {}", e),
            }
            tokio::time::sleep(delay).await;
            let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S %Z");
            let _ = events.send(DaemonEvent::Outbound(Frame::console(format!(
                "New System Time: {}",
                now
            ))));
        });
    }

    fn on_binary(&mut self, bytes: Vec<u8>) {
        let Some(task) = self.binary_task.take() else {
            warn!(bytes = bytes.len(), "Binary frame with no pending upload");
            self.emit(Frame::error("Received binary data with no pending upload"));
            return;
        };

        match task {
            BinaryTask::Upgrade => self.start_update(bytes),
            BinaryTask::Sync | BinaryTask::Clean => {
                let name = self
                    .upload
                    .take()
                    .map(|f| f.name)
                    .unwrap_or_else(|| DEFAULT_UPLOAD_NAME.to_string());
                self.start_upload(task, name, bytes);
            }
        }
    }

    fn start_update(&mut self, bundle: Vec<u8>) {
        if self.updating {
            self.emit(Frame::error("An upgrade is already in progress"));
            return;
        }
        self.updating = true;
        self.emit(Frame::console("Installing upgrade"));

        let rollback = Arc::clone(&self.rollback);
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let progress = events.clone();
            let result = rollback
                .install_update(&bundle, |line| {
                    let _ = progress.send(DaemonEvent::Outbound(Frame::console(line)));
                })
                .await;
            let _ = events.send(DaemonEvent::UpdateFinished(result));
        });
    }

    fn start_upload(&self, task: BinaryTask, name: String, bytes: Vec<u8>) {
        let app_dir = self.config.app_dir.clone();
        let archive = self.config.tmp_dir.join(upload_file_name(&name));
        let keep = self.config.dependency_cache.clone();
        let events = self.events_tx.clone();
        info!(task = task.as_str(), bytes = bytes.len(), "Receiving app archive");

        tokio::spawn(async move {
            let result = extract_upload(task, &archive, &app_dir, &keep, &bytes)
                .await
                .map(|()| app_dir)
                .map_err(|e| format!("{:#}", e));
            let _ = events.send(DaemonEvent::UploadFinished { task, result });
        });
    }

    fn on_upload_finished(&mut self, task: BinaryTask, result: Result<PathBuf, String>) {
        match result {
            Ok(path) => {
                info!(task = task.as_str(), path = %path.display(), "Upload extracted");
                self.emit(
                    Frame::new(task.as_str(), "[ Upload Complete ]")
                        .with_data(path.display().to_string()),
                );
                if task == BinaryTask::Clean {
                    let events = self.supervisor.clean();
                    self.emit_app(events);
                }
            }
            Err(e) => {
                warn!(task = task.as_str(), "Upload failed: {}", e);
                self.emit(Frame::error(format!("Upload failed: {}", e)));
            }
        }
    }
}

async fn extract_upload(
    task: BinaryTask,
    archive: &Path,
    app_dir: &Path,
    keep: &str,
    bytes: &[u8],
) -> Result<()> {
    if let Some(parent) = archive.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(archive, bytes)
        .await
        .with_context(|| format!("Failed to save {}", archive.display()))?;

    if task == BinaryTask::Clean {
        let dir = app_dir.to_path_buf();
        let keep = keep.to_string();
        tokio::task::spawn_blocking(move || clear_dir(&dir, Some(&keep)))
            .await?
            .with_context(|| format!("Failed to clean {}", app_dir.display()))?;
    }

    Extractor::discover()?.extract(archive, app_dir).await?;
    Ok(())
}

/// Keep only the final path component of a client-supplied name
fn upload_file_name(name: &str) -> String {
    Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| DEFAULT_UPLOAD_NAME.to_string())
}

/// Epoch seconds from `{"newTime": ..}`, falling back to a bare value
fn epoch_seconds(data: &Value) -> Option<i64> {
    let value = data.get("newTime").unwrap_or(data);
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn app_frame(event: AppEvent) -> Frame {
    match event {
        AppEvent::Console(text) => Frame::console(text),
        AppEvent::Error(text) => Frame::error(text),
        AppEvent::Closed(code) => Frame::close(code),
        AppEvent::Status(snapshot) => Frame::status(&snapshot),
        AppEvent::DebugStarted => Frame::new("debug", "started"),
        AppEvent::CommandFinished { command, code } => Frame::new(
            "command",
            json!({ "command": command, "code": code }),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_skips_busy_port() {
        let (busy, base) = bind_first_free("127.0.0.1", 0).await.unwrap();
        let (_listener, port) = bind_first_free("127.0.0.1", base).await.unwrap();
        assert!(port > base);
        drop(busy);
    }

    #[test]
    fn test_upload_file_name_strips_directories() {
        assert_eq!(upload_file_name("../../etc/passwd"), "passwd");
        assert_eq!(upload_file_name("app.tar"), "app.tar");
        assert_eq!(upload_file_name(""), DEFAULT_UPLOAD_NAME);
        assert_eq!(upload_file_name(".."), DEFAULT_UPLOAD_NAME);
    }

    #[test]
    fn test_epoch_seconds() {
        assert_eq!(
            epoch_seconds(&json!({"newTime": 1_700_000_000})),
            Some(1_700_000_000)
        );
        assert_eq!(epoch_seconds(&json!({"newTime": "1700000000"})), Some(1_700_000_000));
        assert_eq!(epoch_seconds(&json!({"newTime": null})), None);
        assert_eq!(epoch_seconds(&json!(1_700_000_000)), Some(1_700_000_000));
        assert_eq!(epoch_seconds(&json!("1700000000")), Some(1_700_000_000));
        assert_eq!(epoch_seconds(&json!("soon")), None);
        assert_eq!(epoch_seconds(&Value::Null), None);
    }

    #[test]
    fn test_app_frames() {
        let frame = app_frame(AppEvent::CommandFinished {
            command: "install",
            code: Some(0),
        });
        assert_eq!(frame.channel, "command");
        assert_eq!(frame.message, json!({"command": "install", "code": 0}));

        let frame = app_frame(AppEvent::DebugStarted);
        assert_eq!((frame.channel.as_str(), frame.message), ("debug", json!("started")));
    }
}
