// Process supervisor for the single application slot
//
// Owns ApplicationState and every child the daemon starts on the app's behalf:
// the app itself, the package tool, and the debug bridge while debugging.
// Children report over one channel; each operation bumps the lifecycle
// generation so events from an earlier lifecycle are dropped on arrival.

use crate::daemon::bridge::{BridgeRetry, BridgeSignal, BridgeState, DebugBridge};
use crate::daemon::config::Config;
use crate::daemon::package_tool::{Mode, PackageTool};
use crate::daemon::process::{
    ManagedProcess, ProcessError, ProcessEvent, ProcessMessage, ProcessTable, ProcessTag, Role,
};
use crate::daemon::protocol::{StatusSnapshot, PRODUCT_VERSION};
use serde_json::{json, Value};
use std::net::TcpListener;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Notice printed by the runtime when it opens its debug port
const DEBUGGER_LISTENING: &str = "debugger listening";

/// Everything that reports back to the supervisor
#[derive(Debug)]
pub enum SupervisorInput {
    Process(ProcessMessage),
    BridgeRetry(BridgeRetry),
}

impl From<ProcessMessage> for SupervisorInput {
    fn from(msg: ProcessMessage) -> Self {
        SupervisorInput::Process(msg)
    }
}

impl From<BridgeRetry> for SupervisorInput {
    fn from(retry: BridgeRetry) -> Self {
        SupervisorInput::BridgeRetry(retry)
    }
}

/// Client-visible outcome of a supervisor operation or child event
#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent {
    Console(String),
    Error(String),
    /// Application closed with this exit code (`None` for a signal)
    Closed(Option<i32>),
    Status(StatusSnapshot),
    /// The debug bridge is serving the browser
    DebugStarted,
    /// Package tool finished; `command` is `install` or `clean`
    CommandFinished {
        command: &'static str,
        code: Option<i32>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("debug port {port} is unavailable: {source}")]
    PortUnavailable {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error(transparent)]
    Bridge(#[from] crate::daemon::bridge::BridgeError),
}

#[derive(Debug, Default)]
struct ApplicationState {
    app_path: String,
    is_running: bool,
    is_debugging: bool,
    /// Swallow app stderr (boot autorun)
    silent: bool,
    /// Whether the first debug-mode stderr chunk has been seen
    stderr_seen: bool,
    app: Option<ManagedProcess>,
    installer: Option<(ManagedProcess, Mode)>,
    bridge: Option<DebugBridge>,
    /// (v8 debug port, bridge port) while debugging
    ports: Option<(u16, u16)>,
}

impl ApplicationState {
    fn new(app_path: String) -> Self {
        Self {
            app_path,
            ..Default::default()
        }
    }

    /// Kill every child, each independently, and clear the flags
    fn halt(&mut self) {
        if let Some(mut bridge) = self.bridge.take() {
            bridge.stop();
        }
        self.halt_app();
    }

    /// Like `halt` but leaves the bridge and any retry it has pending
    fn halt_app(&mut self) {
        if let Some(mut app) = self.app.take() {
            if let Err(e) = app.kill() {
                debug!("App kill skipped: {}", e);
            }
        }
        if let Some((mut installer, _)) = self.installer.take() {
            if let Err(e) = installer.kill() {
                debug!("Installer kill skipped: {}", e);
            }
        }
        self.is_running = false;
        self.is_debugging = false;
        self.ports = None;
    }
}

pub struct Supervisor {
    config: Config,
    package_tool: PackageTool,
    state: Option<ApplicationState>,
    generation: u64,
    table: ProcessTable,
    tx: mpsc::UnboundedSender<SupervisorInput>,
}

impl Supervisor {
    pub fn new(config: Config, tx: mpsc::UnboundedSender<SupervisorInput>) -> Self {
        let package_tool = PackageTool::new(config.package_tool.clone());
        Self {
            config,
            package_tool,
            state: None,
            generation: 0,
            table: ProcessTable::default(),
            tx,
        }
    }

    /// Route a client command string
    pub fn dispatch(&mut self, command: &str) -> Vec<AppEvent> {
        match command.trim() {
            "run" => self.run(false),
            "stop" => self.stop(false),
            "install" => self.install(),
            "clean" => self.clean(),
            "debug" => self.debug(),
            "list" | "shutdown" => Vec::new(),
            other => vec![AppEvent::Error(format!("Unknown command: {}", other))],
        }
    }

    /// Stop everything and start a fresh lifecycle
    fn reset(&mut self) {
        if let Some(mut state) = self.state.take() {
            state.halt();
        }
        self.table.sweep();
        self.generation += 1;
        let app_path = self.config.app_target().display().to_string();
        self.state = Some(ApplicationState::new(app_path));
    }

    fn tag(&self, role: Role) -> ProcessTag {
        ProcessTag {
            generation: self.generation,
            role,
        }
    }

    fn app_command(&self, debug_port: Option<u16>) -> Command {
        let mut cmd = Command::new(&self.config.runtime);
        if let Some(port) = debug_port {
            cmd.arg(format!("{}={}", self.config.debug_break_flag, port));
        }
        cmd.arg(self.config.app_target())
            .current_dir(&self.config.app_dir);
        cmd
    }

    fn spawn_app(&mut self, debug_port: Option<u16>) -> Result<ManagedProcess, ProcessError> {
        let process = ManagedProcess::spawn(
            self.app_command(debug_port),
            self.tag(Role::App),
            self.tx.clone(),
        )?;
        if let Some(pid) = process.pid() {
            self.table.push(pid);
        }
        Ok(process)
    }

    /// Run the slot without debugging. `silent` swallows stderr.
    pub fn run(&mut self, silent: bool) -> Vec<AppEvent> {
        self.reset();
        match self.spawn_app(None) {
            Ok(app) => {
                info!(pid = ?app.pid(), silent, "Application started");
                let state = self.state_mut();
                let notice = format!("=> Running App: {} <=", state.app_path);
                state.app = Some(app);
                state.is_running = true;
                state.silent = silent;
                if silent {
                    Vec::new()
                } else {
                    vec![AppEvent::Console(notice), AppEvent::Status(self.status())]
                }
            }
            Err(e) => {
                warn!("Failed to start application: {}", e);
                vec![AppEvent::Error(e.to_string())]
            }
        }
    }

    /// Kill app, debugger and installer. Flags are cleared even if kills fail.
    pub fn stop(&mut self, silent: bool) -> Vec<AppEvent> {
        if let Some(state) = self.state.as_mut() {
            state.halt();
        }
        self.table.sweep();
        if silent {
            Vec::new()
        } else {
            vec![
                AppEvent::Console("=> Stopping App <=".to_string()),
                AppEvent::Status(self.status()),
            ]
        }
    }

    pub fn install(&mut self) -> Vec<AppEvent> {
        self.package(Mode::Install)
    }

    pub fn clean(&mut self) -> Vec<AppEvent> {
        self.package(Mode::Rebuild)
    }

    fn package(&mut self, mode: Mode) -> Vec<AppEvent> {
        self.reset();
        let cmd = self.package_tool.command(mode, &self.config.app_dir);
        match ManagedProcess::spawn(cmd, self.tag(Role::Installer), self.tx.clone()) {
            Ok(process) => {
                info!(mode = mode.as_str(), "Package tool started");
                self.state_mut().installer = Some((process, mode));
                vec![AppEvent::Console(format!(
                    "=> {} {} <=",
                    self.package_tool.program(),
                    mode.as_str()
                ))]
            }
            Err(e) => {
                warn!("Failed to start package tool: {}", e);
                vec![
                    AppEvent::Error(e.to_string()),
                    AppEvent::CommandFinished {
                        command: mode.command_name(),
                        code: None,
                    },
                ]
            }
        }
    }

    /// Run the slot under the debugger with the bridge in front of it
    pub fn debug(&mut self) -> Vec<AppEvent> {
        self.reset();
        let mut events = match self.start_debugging() {
            Ok(()) => vec![AppEvent::Console(format!(
                "=> Debugging App: {} <=",
                self.state_mut().app_path
            ))],
            Err(e) => {
                warn!("Failed to start debugging: {}", e);
                self.stop(true);
                vec![AppEvent::Error(e.to_string())]
            }
        };
        events.push(AppEvent::Status(self.status()));
        events
    }

    fn start_debugging(&mut self) -> Result<(), SupervisorError> {
        let v8_port = self.config.v8_debug_port;
        let bridge_port = self.config.bridge_port;
        probe_port(v8_port)?;
        probe_port(bridge_port)?;

        let app = self.spawn_app(Some(v8_port))?;
        let mut bridge = DebugBridge::new(
            self.config.bridge_program.clone(),
            v8_port,
            bridge_port,
            self.config.bridge_retry_delay,
        );
        let generation = self.generation;
        let tx = self.tx.clone();

        let state = self.state_mut();
        state.app = Some(app);
        state.is_running = true;
        state.ports = Some((v8_port, bridge_port));
        bridge.start(generation, tx)?;
        state.bridge = Some(bridge);
        state.is_debugging = true;
        Ok(())
    }

    fn state_mut(&mut self) -> &mut ApplicationState {
        self.state
            .get_or_insert_with(|| ApplicationState::new(String::new()))
    }

    /// Apply a child event or a bridge retry
    pub fn handle(&mut self, input: SupervisorInput) -> Vec<AppEvent> {
        match input {
            SupervisorInput::Process(msg) => {
                if msg.tag.generation != self.generation {
                    debug!(tag = ?msg.tag, "Dropping event from a previous lifecycle");
                    return Vec::new();
                }
                match msg.tag.role {
                    Role::App => self.on_app(msg.event),
                    Role::Installer => self.on_installer(msg.event),
                    Role::Bridge { .. } => self.on_bridge(msg.tag, msg.event),
                }
            }
            SupervisorInput::BridgeRetry(retry) => self.on_bridge_retry(retry),
        }
    }

    fn on_app(&mut self, event: ProcessEvent) -> Vec<AppEvent> {
        let Some(state) = self.state.as_mut().filter(|s| s.app.is_some()) else {
            return Vec::new();
        };

        match event {
            ProcessEvent::Stdout(bytes) => vec![AppEvent::Console(lossy(&bytes))],
            ProcessEvent::Stderr(bytes) => {
                let first = !state.stderr_seen;
                state.stderr_seen = true;
                let text = lossy(&bytes);
                if state.silent
                    || (state.is_debugging
                        && first
                        && text.to_lowercase().contains(DEBUGGER_LISTENING))
                {
                    Vec::new()
                } else {
                    vec![AppEvent::Error(text)]
                }
            }
            ProcessEvent::Exited { code } => {
                info!(?code, "Application closed");
                if let Some(pid) = state.app.take().and_then(|app| app.pid()) {
                    self.table.forget(pid);
                }
                state.is_running = false;
                let mut events = Vec::new();
                if state.is_debugging {
                    self.stop(true);
                }
                events.push(AppEvent::Closed(code));
                events.push(AppEvent::Status(self.status()));
                events
            }
            ProcessEvent::Failed(e) => {
                if let Some(pid) = state.app.take().and_then(|app| app.pid()) {
                    self.table.forget(pid);
                }
                state.is_running = false;
                self.stop(true);
                vec![AppEvent::Error(e), AppEvent::Status(self.status())]
            }
        }
    }

    fn on_installer(&mut self, event: ProcessEvent) -> Vec<AppEvent> {
        let Some(state) = self.state.as_mut() else {
            return Vec::new();
        };
        let Some(mode) = state.installer.as_ref().map(|(_, mode)| *mode) else {
            return Vec::new();
        };

        match event {
            ProcessEvent::Stdout(bytes) | ProcessEvent::Stderr(bytes) => {
                vec![AppEvent::Console(lossy(&bytes))]
            }
            ProcessEvent::Exited { code } => {
                info!(mode = mode.as_str(), ?code, "Package tool finished");
                state.installer = None;
                vec![
                    AppEvent::Console(self.package_tool.completion_banner(mode, code)),
                    AppEvent::CommandFinished {
                        command: mode.command_name(),
                        code,
                    },
                ]
            }
            ProcessEvent::Failed(e) => {
                state.installer = None;
                vec![
                    AppEvent::Error(e),
                    AppEvent::CommandFinished {
                        command: mode.command_name(),
                        code: None,
                    },
                ]
            }
        }
    }

    fn on_bridge(&mut self, tag: ProcessTag, event: ProcessEvent) -> Vec<AppEvent> {
        let generation = self.generation;
        let tx = self.tx.clone();
        let Some(bridge) = self
            .state
            .as_mut()
            .and_then(|s| s.bridge.as_mut())
            .filter(|b| b.owns(&tag))
        else {
            return Vec::new();
        };

        match event {
            ProcessEvent::Stdout(bytes) => {
                let mut events = Vec::new();
                let mut fault = None;
                for signal in bridge.on_stdout(&bytes) {
                    match signal {
                        BridgeSignal::Listening(_) => {}
                        BridgeSignal::Connected => events.push(AppEvent::DebugStarted),
                        BridgeSignal::ServerError(code) => {
                            if bridge.schedule_retry(generation, tx.clone()) {
                                fault = Some(format!(
                                    "Restarting debugging protocol server ({})",
                                    code
                                ));
                            }
                        }
                    }
                }
                if let Some(reason) = fault {
                    events.extend(self.bridge_fault(reason));
                }
                events
            }
            ProcessEvent::Stderr(bytes) => {
                debug!(output = %lossy(&bytes), "Bridge stderr");
                Vec::new()
            }
            ProcessEvent::Exited { code } => {
                bridge.on_exit();
                self.teardown_debug(format!("Debug bridge exited ({:?})", code), code)
            }
            ProcessEvent::Failed(e) => {
                bridge.on_exit();
                self.teardown_debug(format!("Debug bridge failed: {}", e), None)
            }
        }
    }

    fn on_bridge_retry(&mut self, retry: BridgeRetry) -> Vec<AppEvent> {
        if retry.generation != self.generation {
            return Vec::new();
        }
        let tx = self.tx.clone();
        let Some(bridge) = self
            .state
            .as_mut()
            .and_then(|s| s.bridge.as_mut())
            .filter(|b| b.accepts_retry(&retry))
        else {
            return Vec::new();
        };

        match bridge.start(retry.generation, tx) {
            Ok(()) => Vec::new(),
            Err(e) => self.teardown_debug(e.to_string(), None),
        }
    }

    /// A bridge `SERVER.ERROR` ends the debug session and the app with it.
    /// The bridge keeps its one pending restart.
    fn bridge_fault(&mut self, reason: String) -> Vec<AppEvent> {
        warn!(reason = %reason, "Debug bridge fault");
        let was_debugging = self.status().is_debugging;
        if let Some(state) = self.state.as_mut() {
            state.halt_app();
        }
        self.table.sweep();
        let mut events = vec![AppEvent::Error(reason)];
        if was_debugging {
            events.push(AppEvent::Closed(None));
            events.push(AppEvent::Status(self.status()));
        }
        events
    }

    /// A bridge fault ends the debug session and the app with it
    fn teardown_debug(&mut self, reason: String, code: Option<i32>) -> Vec<AppEvent> {
        if !self.status().is_debugging {
            // Session already closed by an earlier fault
            debug!(reason = %reason, "Bridge stopped after its session ended");
            self.stop(true);
            return Vec::new();
        }
        warn!(reason = %reason, "Debug session ended by bridge");
        self.stop(true);
        vec![
            AppEvent::Error(reason),
            AppEvent::Closed(code),
            AppEvent::Status(self.status()),
        ]
    }

    pub fn status(&self) -> StatusSnapshot {
        match &self.state {
            Some(state) => StatusSnapshot {
                app_path: state.app_path.clone(),
                is_running: state.is_running,
                is_debugging: state.is_debugging,
                version: PRODUCT_VERSION.to_string(),
                time: chrono::Utc::now().timestamp_millis(),
            },
            None => StatusSnapshot::idle(),
        }
    }

    /// Reply for the `debugger` channel
    pub fn debugger_info(&self) -> Value {
        let state = self.state.as_ref();
        let ports = state.and_then(|s| s.ports);
        let bridge_state = state
            .and_then(|s| s.bridge.as_ref())
            .map_or(BridgeState::Stopped, |b| b.state());
        json!({
            "isDebugging": state.is_some_and(|s| s.is_debugging),
            "v8DebugPort": ports.map(|p| p.0),
            "bridgePort": ports.map(|p| p.1),
            "bridgeState": bridge_state.as_str(),
        })
    }

    /// Number of live supervised handles, for invariants in tests
    pub fn live_handles(&self) -> usize {
        self.state.as_ref().map_or(0, |s| {
            s.app.iter().filter(|a| a.is_alive()).count()
        })
    }

    /// Kill everything before the daemon exits
    pub fn shutdown(&mut self) {
        self.stop(true);
    }
}

/// Fail if something is already listening on `port`
fn probe_port(port: u16) -> Result<(), SupervisorError> {
    TcpListener::bind(("0.0.0.0", port))
        .map(drop)
        .map_err(|source| SupervisorError::PortUnavailable { port, source })
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}
