// Environment configuration for the daemon
// Resolves the home directory (crash log, settings, update slots), the app slot,
// the listening port range and the external tools the daemon drives

use std::path::PathBuf;
use std::time::Duration;

/// First port tried for the control socket
pub const DEFAULT_BASE_PORT: u16 = 58888;

/// Fixed well-known port the runtime's native debugger listens on
pub const DEFAULT_V8_DEBUG_PORT: u16 = 5858;

/// Fixed well-known port the debug bridge exposes to the browser
pub const DEFAULT_BRIDGE_PORT: u16 = 7878;

/// Configuration for daemon paths, ports and external tools
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding crash.log, config.json and the update slots
    pub home_dir: PathBuf,
    /// Directory of the single supervised application
    pub app_dir: PathBuf,
    /// Scratch directory for uploaded archives
    pub tmp_dir: PathBuf,
    /// Address the control socket binds to
    pub listen_host: String,
    /// First port tried for the control socket
    pub base_port: u16,
    /// Program that runs the application slot
    pub runtime: String,
    /// Flag passed to the runtime as `<flag>=<port>` when debugging
    pub debug_break_flag: String,
    /// Optional entry file inside the app slot; the slot directory itself when absent
    pub app_entry: Option<String>,
    /// Package manager used for install/rebuild
    pub package_tool: String,
    /// Dependency cache directory preserved across clean uploads
    pub dependency_cache: String,
    /// Debugger bridge program
    pub bridge_program: String,
    pub v8_debug_port: u16,
    pub bridge_port: u16,
    /// Pause between a bridge SERVER.ERROR and the next start attempt
    pub bridge_retry_delay: Duration,
    /// Program invoked as `<program> +%s -s @<epoch>` to set the clock
    pub clock_program: String,
    /// Delay before confirming a clock change to the client
    pub clock_confirm_delay: Duration,
    /// Advertise the control socket over mDNS
    pub advertise: bool,
    /// Run the app slot once at boot
    pub autorun: bool,
    /// Daemon executable inside each update slot, started by the launcher
    pub launch_entry: String,
    /// How long a launched slot must survive to count as started
    pub launch_grace: Duration,
}

impl Config {
    /// Defaults rooted at the given home directory
    pub fn with_home(home_dir: PathBuf) -> Self {
        Self {
            app_dir: home_dir.join("app_slot"),
            tmp_dir: std::env::temp_dir(),
            home_dir,
            listen_host: "127.0.0.1".to_string(),
            base_port: DEFAULT_BASE_PORT,
            runtime: "node".to_string(),
            debug_break_flag: "--debug-brk".to_string(),
            app_entry: None,
            package_tool: "npm".to_string(),
            dependency_cache: "node_modules".to_string(),
            bridge_program: "node-inspector-server".to_string(),
            v8_debug_port: DEFAULT_V8_DEBUG_PORT,
            bridge_port: DEFAULT_BRIDGE_PORT,
            bridge_retry_delay: Duration::from_millis(500),
            clock_program: "date".to_string(),
            clock_confirm_delay: Duration::from_secs(3),
            advertise: true,
            autorun: true,
            launch_entry: "bin/slotd".to_string(),
            launch_grace: Duration::from_millis(600),
        }
    }

    /// Create configuration using default paths
    pub fn default_paths() -> Self {
        Self::with_home(Self::default_home_dir())
    }

    /// Create configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let mut config = match std::env::var("SLOTD_HOME") {
            Ok(home) => Self::with_home(PathBuf::from(home)),
            Err(_) => Self::default_paths(),
        };

        if let Ok(app_dir) = std::env::var("SLOTD_APP_DIR") {
            config.app_dir = PathBuf::from(app_dir);
        }
        if let Ok(host) = std::env::var("SLOTD_HOST") {
            config.listen_host = host;
        }
        if let Some(port) = std::env::var("SLOTD_BASE_PORT")
            .ok()
            .and_then(|p| p.trim().parse().ok())
        {
            config.base_port = port;
        }
        if let Ok(runtime) = std::env::var("SLOTD_RUNTIME") {
            config.runtime = runtime;
        }
        if let Ok(entry) = std::env::var("SLOTD_APP_ENTRY") {
            config.app_entry = Some(entry).filter(|e| !e.is_empty());
        }
        if let Ok(tool) = std::env::var("SLOTD_PACKAGE_TOOL") {
            config.package_tool = tool;
        }
        if let Ok(bridge) = std::env::var("SLOTD_BRIDGE") {
            config.bridge_program = bridge;
        }
        if let Ok(clock) = std::env::var("SLOTD_CLOCK") {
            config.clock_program = clock;
        }
        if std::env::var_os("SLOTD_NO_AUTORUN").is_some() {
            config.autorun = false;
        }
        if let Ok(entry) = std::env::var("SLOTD_LAUNCH_ENTRY") {
            config.launch_entry = entry;
        }
        if std::env::var_os("SLOTD_NO_MDNS").is_some() {
            config.advertise = false;
        }

        config
    }

    /// ~/.slotd, or /tmp/slotd when no home directory is available
    fn default_home_dir() -> PathBuf {
        dirs::home_dir()
            .map(|h| h.join(".slotd"))
            .unwrap_or_else(|| PathBuf::from("/tmp/slotd"))
    }

    /// Durable crash record
    pub fn crash_log(&self) -> PathBuf {
        self.home_dir.join("crash.log")
    }

    /// Persisted device settings (name, whitelist)
    pub fn settings_file(&self) -> PathBuf {
        self.home_dir.join("config.json")
    }

    /// Root under which the default/current/previous slots live
    pub fn slots_root(&self) -> &PathBuf {
        &self.home_dir
    }

    /// Path the runtime is pointed at for run/debug
    pub fn app_target(&self) -> PathBuf {
        match &self.app_entry {
            Some(entry) => self.app_dir.join(entry),
            None => self.app_dir.clone(),
        }
    }

    /// Ensure the home and app slot directories exist
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.home_dir)?;
        std::fs::create_dir_all(&self.app_dir)?;
        Ok(())
    }
}
