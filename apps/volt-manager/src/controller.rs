//! Control-plane IPC to an optional controller process.
//!
//! The controller is spawned with one end of a Unix socket pair on its stdin
//! and speaks newline-delimited JSON: `{"method": ..., "params": ...,
//! "id": ...}`. Supported methods are `restart_modules` and `check_config`;
//! unknown methods are logged and ignored. The `boot` handshake with the
//! directory layout is sent right after spawning.

use std::path::Path;
use std::process::Stdio;

use anyhow::Context;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{error, info, warn};

use volt_config::Settings;

/// A request received from the controller.
#[derive(Debug)]
pub enum ControllerRequest {
    RestartModules,
    CheckConfig { id: Value, path: String },
}

/// Parses one line of controller input. `None` means the method is unknown
/// or the message malformed; both are ignored with a diagnostic.
pub fn parse_request(message: &Value) -> Option<ControllerRequest> {
    match message.get("method").and_then(Value::as_str) {
        Some("restart_modules") => Some(ControllerRequest::RestartModules),
        Some("check_config") => match message.get("params").and_then(Value::as_str) {
            Some(path) => Some(ControllerRequest::CheckConfig {
                id: message.get("id").cloned().unwrap_or(Value::Null),
                path: path.to_string(),
            }),
            None => {
                warn!(%message, "check_config request without a path, ignoring");
                None
            }
        },
        Some(other) => {
            error!(method = other, "unknown controller method, ignoring");
            None
        }
        None => {
            warn!(%message, "controller message without a method, ignoring");
            None
        }
    }
}

pub struct ControllerHandle {
    pub pid: Option<u32>,
    reader: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    _child: tokio::process::Child,
}

impl ControllerHandle {
    /// Spawns the configured controller binary, if any, and performs the boot
    /// handshake.
    pub async fn start(settings: &Settings) -> anyhow::Result<Option<ControllerHandle>> {
        let Some(binary) = &settings.controller_binary else {
            return Ok(None);
        };

        let (ours, theirs) = std::os::unix::net::UnixStream::pair()
            .context("cannot create controller socket pair")?;

        let mut cmd = tokio::process::Command::new(binary);
        cmd.stdin(Stdio::from(std::os::fd::OwnedFd::from(theirs)));
        let child = cmd
            .spawn()
            .with_context(|| format!("cannot spawn controller {}", binary.display()))?;
        let pid = child.id();
        info!(pid = ?pid, binary = %binary.display(), "controller started");

        ours.set_nonblocking(true)
            .context("cannot switch controller socket to non-blocking")?;
        let stream = tokio::net::UnixStream::from_std(ours)
            .context("cannot register controller socket")?;
        let (read_half, write_half) = stream.into_split();

        let mut handle = ControllerHandle {
            pid,
            reader: BufReader::new(read_half).lines(),
            writer: write_half,
            _child: child,
        };
        handle
            .send(&json!({
                "method": "boot",
                "params": {
                    "module_dir": settings.modules_dir,
                    "interface_dir": settings.interfaces_dir,
                    "configs_dir": settings.configs_dir,
                    "logging": "env",
                },
            }))
            .await
            .context("controller boot handshake failed")?;
        Ok(Some(handle))
    }

    pub async fn send(&mut self, message: &Value) -> std::io::Result<()> {
        let mut line = message.to_string();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await
    }

    /// Next recognized request. `None` means the controller hung up.
    pub async fn recv(&mut self) -> Option<ControllerRequest> {
        loop {
            let line = match self.reader.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return None,
                Err(e) => {
                    error!(error = %e, "controller ipc read failed");
                    return None;
                }
            };
            let message: Value = match serde_json::from_str(&line) {
                Ok(message) => message,
                Err(e) => {
                    warn!(error = %e, line = %line, "dropping malformed controller message");
                    continue;
                }
            };
            if let Some(request) = parse_request(&message) {
                return Some(request);
            }
        }
    }
}

/// Validates a candidate config file; `Ok` when it loads cleanly.
pub fn check_config(settings: &Settings, path: &str) -> Result<(), String> {
    let candidate = Path::new(path);
    let candidate_settings = if candidate.is_absolute() {
        Settings::load(Some(settings.prefix.clone()), Some(path.to_string()))
    } else {
        Settings::load(
            Some(settings.prefix.clone()),
            Some(settings.configs_dir.join(candidate).display().to_string()),
        )
    }
    .map_err(|e| e.to_string())?;
    volt_config::load(&candidate_settings)
        .map(|_| ())
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_methods_parse() {
        assert!(matches!(
            parse_request(&json!({"method": "restart_modules"})),
            Some(ControllerRequest::RestartModules)
        ));
        match parse_request(&json!({"method": "check_config", "params": "/tmp/c.yaml", "id": 4})) {
            Some(ControllerRequest::CheckConfig { id, path }) => {
                assert_eq!(id, json!(4));
                assert_eq!(path, "/tmp/c.yaml");
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn unknown_and_malformed_methods_are_ignored() {
        assert!(parse_request(&json!({"method": "reboot_everything"})).is_none());
        assert!(parse_request(&json!({"params": 1})).is_none());
        assert!(parse_request(&json!({"method": "check_config"})).is_none());
    }
}
