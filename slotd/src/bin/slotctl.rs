// slotctl: developer CLI for a running slotd
//
// Commands:
//   slotctl status
//   slotctl run | stop | debug | install | clean
//   slotctl push <archive.tar> [--clean]
//   slotctl upgrade <bundle.tar>
//   slotctl config set <key=value>...
//   slotctl config time [<epoch seconds>]
//   slotctl debugger

use anyhow::{anyhow, bail, Result};
use slotd_lib::daemon::{
    client::{parse_settings, render, DaemonClient, Request},
    config::Config,
};
use std::{env, path::PathBuf, time::Duration};

/// How long slotctl waits for the connection greeting
const GREETING_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on one exchange; `run` streams until the app closes
const REQUEST_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

fn print_help() {
    println!(
        r#"slotctl - control a slotd device daemon

USAGE:
    slotctl <COMMAND> [OPTIONS]

COMMANDS:
    status                     Show whether the app is running or debugging
    run                        Run the app and stream its output until it exits
    stop                       Stop the app, debugger and installer
    debug                      Run the app under the debug bridge
    install                    Install the app's dependencies
    clean                      Rebuild the app's dependencies
    push <archive> [--clean]   Upload an app archive (into a cleaned slot with --clean)
    upgrade <bundle>           Install a self-update bundle for the daemon
    config set <k=v>...        Save device settings (name, whitelist=a,b)
    config time [<epoch>]      Set the device clock (defaults to this machine's time)
    debugger                   Show debug session ports
    help                       Show this help message

OPTIONS:
    --host <host>    Daemon host (default: SLOTD_HOST or 127.0.0.1)
    --port <port>    Daemon port (default: SLOTD_BASE_PORT or 58888)

EXAMPLES:
    slotctl push build/app.tar && slotctl run
    slotctl config set name=garage-pi whitelist=10.0.0.2,10.0.0.3
    slotctl --host 192.168.1.40 status
"#
    );
}

fn parse_request(positional: &[String], clean: bool) -> Result<Request> {
    let Some(command) = positional.first() else {
        bail!("No command given");
    };

    let request = match command.as_str() {
        "status" => Request::Status,
        "debugger" => Request::Debugger,
        "run" | "stop" | "debug" | "install" | "clean" => Request::Command(command.clone()),
        "push" => {
            let archive = positional
                .get(1)
                .ok_or_else(|| anyhow!("Usage: slotctl push <archive> [--clean]"))?;
            Request::Push {
                archive: PathBuf::from(archive),
                clean,
            }
        }
        "upgrade" => {
            let archive = positional
                .get(1)
                .ok_or_else(|| anyhow!("Usage: slotctl upgrade <bundle>"))?;
            Request::Upgrade {
                archive: PathBuf::from(archive),
            }
        }
        "config" => match positional.get(1).map(String::as_str) {
            Some("set") => {
                let settings = parse_settings(&positional[2..])?;
                if settings.is_empty() {
                    bail!("Usage: slotctl config set <key=value>...");
                }
                Request::ConfigSet(settings)
            }
            Some("time") => {
                let epoch = match positional.get(2) {
                    Some(value) => value
                        .parse()
                        .map_err(|_| anyhow!("Epoch must be an integer, got '{}'", value))?,
                    None => chrono::Utc::now().timestamp(),
                };
                Request::ConfigTime(epoch)
            }
            _ => bail!("Usage: slotctl config <set|time> ..."),
        },
        other => bail!("Unknown command: {}", other),
    };
    Ok(request)
}

async fn execute(host: &str, port: u16, request: Request) -> Result<bool> {
    let mut client = DaemonClient::connect(host, port).await?;
    for frame in client.greeting(GREETING_TIMEOUT).await? {
        // Only crash reports from the greeting are interesting here
        if frame.channel == "error" {
            eprintln!("{}", render(&frame));
        }
    }

    request.send(&mut client).await?;

    let mut failed = false;
    let frames = client
        .recv_until(REQUEST_TIMEOUT, |frame| {
            let line = render(frame);
            if frame.channel == "error" {
                eprintln!("{}", line);
                failed = true;
            } else {
                println!("{}", line);
            }
            request.is_answered_by(frame)
        })
        .await?;

    // A failing install/clean reports through its exit code, not an error frame
    if let Some(last) = frames.last() {
        if last.channel == "command" {
            failed |= last.message.get("code").and_then(|c| c.as_i64()) != Some(0);
        }
    }

    // The daemon closes the socket itself when it exits for a restart
    let _ = client.close().await;
    Ok(!failed)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    let config = Config::from_env();
    let mut host = if config.listen_host == "0.0.0.0" {
        "127.0.0.1".to_string()
    } else {
        config.listen_host.clone()
    };
    let mut port = config.base_port;
    let mut clean = false;
    let mut positional = Vec::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--host" => {
                i += 1;
                if i < args.len() {
                    host = args[i].clone();
                }
            }
            "--port" | "-p" => {
                i += 1;
                if i < args.len() {
                    match args[i].parse::<u16>() {
                        Ok(v) => port = v,
                        Err(_) => {
                            eprintln!("--port must be a number between 1 and 65535");
                            std::process::exit(1);
                        }
                    }
                }
            }
            "--clean" => {
                clean = true;
            }
            "help" | "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            other => positional.push(other.to_string()),
        }
        i += 1;
    }

    let request = match parse_request(&positional, clean) {
        Ok(request) => request,
        Err(e) => {
            eprintln!("{}", e);
            eprintln!("Run 'slotctl help' for usage");
            std::process::exit(2);
        }
    };

    if !execute(&host, port, request).await? {
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(parse_request(&args(&["status"]), false).unwrap(), Request::Status);
        assert_eq!(
            parse_request(&args(&["run"]), false).unwrap(),
            Request::Command("run".to_string())
        );
        assert_eq!(
            parse_request(&args(&["push", "app.tar"]), true).unwrap(),
            Request::Push {
                archive: PathBuf::from("app.tar"),
                clean: true
            }
        );
        assert_eq!(
            parse_request(&args(&["config", "time", "1700000000"]), false).unwrap(),
            Request::ConfigTime(1_700_000_000)
        );
    }

    #[test]
    fn test_parse_rejects_incomplete_commands() {
        assert!(parse_request(&args(&[]), false).is_err());
        assert!(parse_request(&args(&["push"]), false).is_err());
        assert!(parse_request(&args(&["config", "set"]), false).is_err());
        assert!(parse_request(&args(&["config", "time", "noon"]), false).is_err());
        assert!(parse_request(&args(&["reboot"]), false).is_err());
    }
}
