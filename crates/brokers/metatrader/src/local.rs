use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use tradedesk_core::*;

use crate::protocol::ResponseEnvelope;

/// Runs the bridge script once per command on this machine.
///
/// The script is invoked as `<interpreter> <script> <command> <args...>` and
/// prints a single JSON object to stdout, shaped like the `result` of a
/// remote bridge response. There is no socket, so there is nothing to
/// reconnect; `connect()` probes the terminal with `test_connection`.
pub struct LocalBridge {
    interpreter: PathBuf,
    script: PathBuf,
    request_timeout: Duration,
    config: BridgeConfig,
    status: watch::Sender<BridgeStatus>,
}

impl LocalBridge {
    pub fn new(interpreter: impl Into<PathBuf>, script: impl Into<PathBuf>, request_timeout: Duration) -> Self {
        let script = script.into();
        let config = BridgeConfig {
            enabled: true,
            ..BridgeConfig::default()
        };
        let mut status = BridgeStatus::new(&config);
        status.endpoint = format!("local:{}", script.display());
        Self {
            interpreter: interpreter.into(),
            script,
            request_timeout,
            config,
            status: watch::Sender::new(status),
        }
    }

    pub fn script(&self) -> &Path {
        &self.script
    }

    async fn run(&self, command: &str, args: &[Value]) -> Result<Value, BridgeError> {
        let mut cmd = Command::new(&self.interpreter);
        cmd.arg(&self.script)
            .arg(command)
            .args(args.iter().map(to_argv))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(script = %self.script.display(), command, "Running local bridge");
        let child = cmd.spawn().map_err(|e| {
            BridgeError::ConnectionFailed(format!("failed to start {}: {}", self.script.display(), e))
        })?;

        let output = match tokio::time::timeout(self.request_timeout, child.wait_with_output()).await {
            Ok(output) => output.map_err(|e| BridgeError::ConnectionClosed(e.to_string()))?,
            Err(_) => {
                warn!(command, "Local bridge command timed out");
                return Err(BridgeError::Timeout {
                    command: command.to_string(),
                    timeout: self.request_timeout,
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let Some(line) = stdout.lines().rev().find(|l| !l.trim().is_empty()) else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BridgeError::InvalidResponse(format!(
                "'{}' printed nothing ({}): {}",
                command,
                output.status,
                stderr.trim()
            )));
        };

        let result: Value = serde_json::from_str(line).map_err(|e| {
            BridgeError::InvalidResponse(format!("'{}' printed malformed JSON: {}", command, e))
        })?;
        ResponseEnvelope {
            id: None,
            success: result.get("success").and_then(Value::as_bool),
            result: Some(result),
            error: None,
        }
        .into_result()
    }
}

/// Render a JSON argument the way the script reads `sys.argv`.
fn to_argv(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Decrements the in-flight count even if the caller is cancelled.
struct InFlight<'a>(&'a watch::Sender<BridgeStatus>);

impl<'a> InFlight<'a> {
    fn start(status: &'a watch::Sender<BridgeStatus>) -> Self {
        status.send_modify(|s| s.pending_requests += 1);
        Self(status)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.send_modify(|s| s.pending_requests = s.pending_requests.saturating_sub(1));
    }
}

#[async_trait]
impl BridgeChannel for LocalBridge {
    async fn connect(&self) -> bool {
        self.status.send_modify(|s| s.state = ConnectionState::Connecting);
        match self.call("test_connection", Vec::new()).await {
            Ok(_) => {
                info!(script = %self.script.display(), "Local MT5 bridge ready");
                true
            }
            Err(e) => {
                warn!(script = %self.script.display(), error = %e, "Local MT5 bridge unavailable");
                self.status.send_modify(|s| s.state = ConnectionState::Disconnected);
                false
            }
        }
    }

    async fn disconnect(&self) {
        self.status.send_modify(|s| {
            s.state = ConnectionState::Disconnected;
            s.connected_since = None;
        });
    }

    async fn call(&self, command: &str, args: Vec<Value>) -> Result<Value, BridgeError> {
        let result = {
            let _in_flight = InFlight::start(&self.status);
            self.run(command, &args).await
        };

        match &result {
            Ok(_) | Err(BridgeError::Remote(_)) => self.status.send_modify(|s| {
                if s.state != ConnectionState::Connected {
                    s.connected_since = Some(Utc::now());
                }
                s.state = ConnectionState::Connected;
                s.last_error = None;
            }),
            Err(e) => {
                let message = e.to_string();
                self.status.send_modify(|s| {
                    s.state = ConnectionState::Disconnected;
                    s.connected_since = None;
                    s.last_error = Some(message);
                });
            }
        }
        result
    }

    fn status(&self) -> BridgeStatus {
        self.status.borrow().clone()
    }

    fn config(&self) -> BridgeConfig {
        self.config.clone()
    }

    async fn update_config(&self, _config: BridgeConfig) -> Result<(), BridgeError> {
        Err(BridgeError::InvalidRequest(
            "the local bridge has no network endpoint to configure".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// A shell stand-in for the bridge script: echoes its argv back as JSON,
    /// fails on `fail`, and stalls on `hang`.
    fn stub_script(dir: &Path) -> PathBuf {
        let path = dir.join("mt5_bridge.sh");
        std::fs::write(
            &path,
            r#"cmd="$1"; shift
case "$cmd" in
  fail) echo '{"success": false, "error": "Login failed, error code = -6"}' ;;
  hang) sleep 5 ;;
  silent) echo 'boom' >&2; exit 1 ;;
  *)
    printf 'MT5 starting\n'
    printf '{"success": true, "command": "%s", "argv": "%s"}\n' "$cmd" "$*"
    ;;
esac
"#,
        )
        .unwrap();
        path
    }

    fn bridge(dir: &Path, timeout: Duration) -> LocalBridge {
        LocalBridge::new("sh", stub_script(dir), timeout)
    }

    #[tokio::test]
    async fn test_positional_args_and_result() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = bridge(dir.path(), Duration::from_secs(5));

        let result = bridge
            .call("place_order", vec![json!("EURUSD"), json!(0), json!(0.1), json!("")])
            .await
            .unwrap();
        assert_eq!(result["command"], "place_order");
        assert_eq!(result["argv"], "EURUSD 0 0.1 ");

        let status = bridge.status();
        assert!(status.is_connected());
        assert_eq!(status.pending_requests, 0);
        assert!(status.endpoint.starts_with("local:"));
    }

    #[tokio::test]
    async fn test_failure_uses_error_field() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = bridge(dir.path(), Duration::from_secs(5));

        let err = bridge.call("fail", Vec::new()).await.unwrap_err();
        assert!(matches!(err, BridgeError::Remote(ref m) if m.contains("Login failed")));
    }

    #[tokio::test]
    async fn test_empty_output_is_invalid_response() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = bridge(dir.path(), Duration::from_secs(5));

        let err = bridge.call("silent", Vec::new()).await.unwrap_err();
        assert!(matches!(err, BridgeError::InvalidResponse(ref m) if m.contains("boom")));
        assert_eq!(bridge.status().state, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_command_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = bridge(dir.path(), Duration::from_millis(200));

        let err = bridge.call("hang", Vec::new()).await.unwrap_err();
        assert!(matches!(err, BridgeError::Timeout { ref command, .. } if command == "hang"));
        assert_eq!(bridge.status().pending_requests, 0);
    }

    #[tokio::test]
    async fn test_connect_probes_and_missing_interpreter_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(bridge(dir.path(), Duration::from_secs(5)).connect().await);

        let missing = LocalBridge::new(
            dir.path().join("no-such-python"),
            stub_script(dir.path()),
            Duration::from_secs(5),
        );
        assert!(!missing.connect().await);
        assert!(missing.status().last_error.is_some());
        assert!(missing.update_config(BridgeConfig::default()).await.is_err());
    }
}
