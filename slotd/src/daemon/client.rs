// Control-socket client
// Connects to a running slotd over WebSocket, sends requests and reads back
// the event stream until the request is answered

use crate::daemon::protocol::Frame;
use anyhow::{Context, Result};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// `ws://host:port/`
pub fn daemon_url(host: &str, port: u16) -> String {
    format!("ws://{}:{}/", host, port)
}

/// A live control connection
pub struct DaemonClient {
    writer: SplitSink<Socket, Message>,
    reader: SplitStream<Socket>,
}

impl DaemonClient {
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        let url = daemon_url(host, port);
        let (socket, _response) = connect_async(url.as_str())
            .await
            .with_context(|| format!("Failed to connect to slotd at {}", url))?;
        let (writer, reader) = socket.split();
        Ok(Self { writer, reader })
    }

    /// Read the frames every new connection starts with, up to the first status
    pub async fn greeting(&mut self, timeout: Duration) -> Result<Vec<Frame>> {
        self.recv_until(timeout, |f| f.channel == "status").await
    }

    pub async fn send(&mut self, frame: &Frame) -> Result<()> {
        let text = frame.encode().context("Failed to encode frame")?;
        self.writer
            .send(Message::Text(text))
            .await
            .context("Failed to send frame")
    }

    pub async fn send_binary(&mut self, bytes: Vec<u8>) -> Result<()> {
        self.writer
            .send(Message::Binary(bytes))
            .await
            .context("Failed to send archive")
    }

    /// Next text frame, or `None` once the daemon closes the socket
    pub async fn next_frame(&mut self) -> Result<Option<Frame>> {
        while let Some(message) = self.reader.next().await {
            match message.context("Connection error")? {
                Message::Text(text) => return Ok(Some(Frame::parse(&text))),
                Message::Close(_) => return Ok(None),
                _ => continue,
            }
        }
        Ok(None)
    }

    /// Collect frames until one matches `done`, which is included last
    pub async fn recv_until<P>(&mut self, timeout: Duration, mut done: P) -> Result<Vec<Frame>>
    where
        P: FnMut(&Frame) -> bool,
    {
        let mut frames = Vec::new();
        let collect = async {
            while let Some(frame) = self.next_frame().await? {
                let finished = done(&frame);
                frames.push(frame);
                if finished {
                    return Ok(true);
                }
            }
            Ok::<bool, anyhow::Error>(false)
        };

        match tokio::time::timeout(timeout, collect).await {
            Ok(Ok(true)) => Ok(frames),
            Ok(Ok(false)) => anyhow::bail!("Connection closed before the expected frame"),
            Ok(Err(e)) => Err(e),
            Err(_) => anyhow::bail!("Timed out after {:?} waiting for a frame", timeout),
        }
    }

    pub async fn close(mut self) -> Result<()> {
        self.writer
            .send(Message::Close(None))
            .await
            .context("Failed to close connection")
    }
}

/// What slotctl asks the daemon to do
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Status,
    /// A supervisor command (`run`, `stop`, `debug`, `install`, `clean`)
    Command(String),
    /// Upload an application archive, optionally into a cleaned slot
    Push { archive: PathBuf, clean: bool },
    /// Self-update bundle for the daemon
    Upgrade { archive: PathBuf },
    ConfigSet(Map<String, Value>),
    /// Set the device clock to this many seconds since the epoch
    ConfigTime(i64),
    /// Ask about the running debug session
    Debugger,
}

impl Request {
    /// Send the request, including any archive it carries
    pub async fn send(&self, client: &mut DaemonClient) -> Result<()> {
        match self {
            Request::Status => client.send(&Frame::new("status", Value::Null)).await,
            Request::Command(command) => client.send(&Frame::new("command", command.as_str())).await,
            Request::Push { archive, clean } => {
                let bytes = read_archive(archive).await?;
                let channel = if *clean { "clean" } else { "sync" };
                let name = archive
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let announce = json!({ "type": "file", "data": { "name": name } });
                client.send(&Frame::new(channel, announce)).await?;
                client.send_binary(bytes).await
            }
            Request::Upgrade { archive } => {
                let bytes = read_archive(archive).await?;
                client.send(&Frame::new("upgrade", Value::Null)).await?;
                client.send_binary(bytes).await
            }
            Request::ConfigSet(settings) => {
                let frame = Frame::new("config", "set").with_data(Value::Object(settings.clone()));
                client.send(&frame).await
            }
            Request::ConfigTime(epoch) => {
                client
                    .send(&Frame::new("config", "time").with_data(json!({ "newTime": epoch })))
                    .await
            }
            Request::Debugger => client.send(&Frame::new("debugger", "info")).await,
        }
    }

    /// Whether `frame` answers this request
    pub fn is_answered_by(&self, frame: &Frame) -> bool {
        let text = frame.message.as_str().unwrap_or_default();
        match self {
            Request::Status => frame.channel == "status",
            Request::Debugger => frame.channel == "debugger",
            Request::Command(command) => match command.as_str() {
                "run" => frame.channel == "close",
                "stop" => frame.channel == "console" && text.contains("Stopping App"),
                "debug" => frame.channel == "debug" || frame.channel == "error",
                "install" | "clean" => frame.channel == "command",
                _ => frame.channel == "error" || frame.channel == "console",
            },
            Request::Push { clean, .. } => {
                if frame.channel == "error" {
                    return true;
                }
                if *clean {
                    frame.channel == "command"
                } else {
                    frame.channel == "sync"
                }
            }
            Request::Upgrade { .. } => {
                frame.channel == "error"
                    || (frame.channel == "console" && text.starts_with("Upgrade complete"))
            }
            Request::ConfigSet(_) => {
                frame.channel == "error"
                    || (frame.channel == "console" && text.starts_with("Configuration saved"))
            }
            Request::ConfigTime(_) => {
                frame.channel == "console" && text.starts_with("New System Time")
            }
        }
    }
}

async fn read_archive(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))
}

/// Parse `key=value` pairs into a settings object.
///
/// `whitelist` takes a comma-separated list; other values are kept as strings.
pub fn parse_settings(pairs: &[String]) -> Result<Map<String, Value>> {
    let mut settings = Map::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("Expected key=value, got '{}'", pair))?;
        let value = if key == "whitelist" {
            Value::Array(
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(|v| Value::String(v.to_string()))
                    .collect(),
            )
        } else {
            Value::String(value.to_string())
        };
        settings.insert(key.to_string(), value);
    }
    Ok(settings)
}

/// One line of output for a received frame
pub fn render(frame: &Frame) -> String {
    let text = match &frame.message {
        Value::String(s) => s.trim_end().to_string(),
        other => other.to_string(),
    };
    match frame.channel.as_str() {
        "console" => text,
        "error" => format!("error: {}", text),
        channel => match &frame.data {
            Some(data) => format!("[{}] {} {}", channel, text, data),
            None => format!("[{}] {}", channel, text),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_settings() {
        let settings = parse_settings(&[
            "name=garage-pi".to_string(),
            "whitelist=10.0.0.2, 10.0.0.3".to_string(),
        ])
        .unwrap();
        assert_eq!(settings["name"], json!("garage-pi"));
        assert_eq!(settings["whitelist"], json!(["10.0.0.2", "10.0.0.3"]));

        assert!(parse_settings(&["name".to_string()]).is_err());
    }

    #[test]
    fn test_requests_answered_by_expected_frames() {
        let run = Request::Command("run".to_string());
        assert!(!run.is_answered_by(&Frame::console("hello")));
        assert!(!run.is_answered_by(&Frame::error("stderr line")));
        assert!(run.is_answered_by(&Frame::close(Some(1))));

        let install = Request::Command("install".to_string());
        assert!(install.is_answered_by(&Frame::new("command", json!({"command": "install"}))));

        let push = Request::Push {
            archive: PathBuf::from("app.tar"),
            clean: false,
        };
        assert!(push.is_answered_by(&Frame::new("sync", "[ Upload Complete ]")));
        assert!(push.is_answered_by(&Frame::error("Upload failed")));

        let upgrade = Request::Upgrade {
            archive: PathBuf::from("update.tar"),
        };
        assert!(!upgrade.is_answered_by(&Frame::console("Installing upgrade")));
        assert!(upgrade.is_answered_by(&Frame::console("Upgrade complete.  Process restarting")));
    }

    #[test]
    fn test_render() {
        assert_eq!(render(&Frame::console("line\n")), "line");
        assert_eq!(render(&Frame::error("boom")), "error: boom");
        assert_eq!(
            render(&Frame::new("sync", "[ Upload Complete ]").with_data("/srv/app")),
            "[sync] [ Upload Complete ] \"/srv/app\""
        );
        assert_eq!(render(&Frame::close(Some(0))), "[close] 0");
    }
}
