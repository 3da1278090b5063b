// Control protocol - frames exchanged between the development client and slotd
// JSON text frames over a WebSocket; binary frames carry archives whose meaning
// depends on the most recently armed binary task

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Human-readable product name sent in the connection banner
pub const PRODUCT_NAME: &str = "slotd - IoT App Daemon";

/// Version reported in status snapshots and the mDNS TXT record
pub const PRODUCT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Archive name used when a client uploads without declaring one
pub const DEFAULT_UPLOAD_NAME: &str = "bundle.tar";

/// A single text frame, in either direction.
///
/// Inbound frames carry `{channel, message, data?}`; outbound events use the
/// same shape with `channel` set to `console`, `status`, `error`, or the
/// channel being answered.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub message: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Frame {
    pub fn new(channel: impl Into<String>, message: impl Into<Value>) -> Self {
        Self {
            channel: channel.into(),
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: impl Into<Value>) -> Self {
        self.data = Some(data.into());
        self
    }

    pub fn console(text: impl Into<String>) -> Self {
        Self::new("console", text.into())
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::new("error", text.into())
    }

    pub fn status(snapshot: &StatusSnapshot) -> Self {
        Self::new("status", json!(snapshot))
    }

    /// Close notification carrying the child's exit code (null when killed by a signal)
    pub fn close(code: Option<i32>) -> Self {
        Self::new("close", json!(code))
    }

    /// Parse an inbound text frame.
    ///
    /// Anything that is not a JSON object with the expected fields is treated
    /// as an empty frame, which dispatches to nothing.
    pub fn parse(text: &str) -> Self {
        serde_json::from_str(text).unwrap_or_default()
    }

    /// Serialize for the wire
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// How the next binary frame is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryTask {
    /// Self-update bundle for the daemon's own code
    Upgrade,
    /// Application archive extracted over the slot
    Sync,
    /// Application archive extracted into a cleaned slot, followed by a rebuild
    Clean,
}

impl BinaryTask {
    pub fn as_str(&self) -> &'static str {
        match self {
            BinaryTask::Upgrade => "upgrade",
            BinaryTask::Sync => "sync",
            BinaryTask::Clean => "clean",
        }
    }
}

/// Upload metadata declared ahead of an archive (`{type: "file", data: {name}}`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFile {
    pub name: String,
}

impl UploadFile {
    fn from_message(message: &Value) -> Option<Self> {
        if message.get("type").and_then(Value::as_str) != Some("file") {
            return None;
        }
        let name = message.get("data")?.get("name")?.as_str()?;
        Some(Self {
            name: name.to_string(),
        })
    }
}

/// Inbound control messages after channel dispatch
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    /// Forwarded verbatim to the supervisor's command dispatcher
    Command(String),
    /// Archive upload announcement; the archive follows as a binary frame
    Upload {
        task: BinaryTask,
        file: Option<UploadFile>,
    },
    /// `config` channel: `set` merges settings, `time` sets the clock
    Config { mode: String, data: Value },
    /// Query about the current debug session
    Debugger(Value),
    Status,
    /// Arms the next binary frame as a self-update bundle
    Upgrade,
}

impl ControlMessage {
    /// Map a parsed frame onto a control message.
    ///
    /// Returns `None` for unknown or empty channels.
    pub fn from_frame(frame: &Frame) -> Option<Self> {
        match frame.channel.as_str() {
            "command" => Some(ControlMessage::Command(value_as_text(&frame.message))),
            "sync" => Some(ControlMessage::Upload {
                task: BinaryTask::Sync,
                file: UploadFile::from_message(&frame.message),
            }),
            "clean" => Some(ControlMessage::Upload {
                task: BinaryTask::Clean,
                file: UploadFile::from_message(&frame.message),
            }),
            "config" => Some(ControlMessage::Config {
                mode: value_as_text(&frame.message),
                data: frame.data.clone().unwrap_or(Value::Null),
            }),
            "debugger" => Some(ControlMessage::Debugger(frame.message.clone())),
            "status" => Some(ControlMessage::Status),
            "upgrade" => Some(ControlMessage::Upgrade),
            _ => None,
        }
    }
}

fn value_as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Snapshot of the supervised application, sent on the `status` channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub app_path: String,
    pub is_running: bool,
    pub is_debugging: bool,
    pub version: String,
    /// Milliseconds since the Unix epoch
    pub time: i64,
}

impl StatusSnapshot {
    pub fn idle() -> Self {
        Self {
            app_path: String::new(),
            is_running: false,
            is_debugging: false,
            version: PRODUCT_VERSION.to_string(),
            time: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Banner sent to every new connection
pub fn banner() -> String {
    format!(
        "{} v{} - commands: run, stop, debug, install, clean, status\n",
        PRODUCT_NAME, PRODUCT_VERSION
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_json_is_empty_frame() {
        let frame = Frame::parse("{not json");
        assert_eq!(frame, Frame::default());
        assert!(ControlMessage::from_frame(&frame).is_none());

        // Valid JSON that is not an object also dispatches to nothing
        let frame = Frame::parse("42");
        assert!(ControlMessage::from_frame(&frame).is_none());
    }

    #[test]
    fn test_command_is_forwarded_verbatim() {
        let frame = Frame::parse(r#"{"channel":"command","message":"run"}"#);
        assert_eq!(
            ControlMessage::from_frame(&frame),
            Some(ControlMessage::Command("run".to_string()))
        );
    }

    #[test]
    fn test_sync_carries_upload_name() {
        let frame = Frame::parse(
            r#"{"channel":"sync","message":{"type":"file","data":{"name":"app.tar"}}}"#,
        );
        match ControlMessage::from_frame(&frame) {
            Some(ControlMessage::Upload { task, file }) => {
                assert_eq!(task, BinaryTask::Sync);
                assert_eq!(file.map(|f| f.name), Some("app.tar".to_string()));
            }
            other => panic!("Expected upload, got {:?}", other),
        }
    }

    #[test]
    fn test_upload_without_file_metadata() {
        let frame = Frame::parse(r#"{"channel":"clean","message":{"type":"dir"}}"#);
        match ControlMessage::from_frame(&frame) {
            Some(ControlMessage::Upload { task, file }) => {
                assert_eq!(task, BinaryTask::Clean);
                assert!(file.is_none());
            }
            other => panic!("Expected upload, got {:?}", other),
        }
    }

    #[test]
    fn test_config_frame_keeps_data() {
        let frame = Frame::parse(
            r#"{"channel":"config","message":"set","data":{"name":"bench-board"}}"#,
        );
        match ControlMessage::from_frame(&frame) {
            Some(ControlMessage::Config { mode, data }) => {
                assert_eq!(mode, "set");
                assert_eq!(data["name"], "bench-board");
            }
            other => panic!("Expected config, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_channel_is_ignored() {
        let frame = Frame::parse(r#"{"channel":"reboot","message":"now"}"#);
        assert!(ControlMessage::from_frame(&frame).is_none());
    }

    #[test]
    fn test_status_snapshot_uses_camel_case() {
        let snapshot = StatusSnapshot::idle();
        let encoded = Frame::status(&snapshot).encode().unwrap();
        assert!(encoded.contains("\"appPath\":\"\""));
        assert!(encoded.contains("\"isRunning\":false"));
        assert!(encoded.contains("\"isDebugging\":false"));
        assert!(!encoded.contains("\"data\""));
    }

    #[test]
    fn test_close_frame_carries_exit_code() {
        let frame = Frame::close(Some(1));
        assert_eq!(frame.channel, "close");
        assert_eq!(frame.message, json!(1));
        assert_eq!(Frame::close(None).message, Value::Null);
    }
}
