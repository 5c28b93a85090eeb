pub mod factory;
pub mod http_api;
pub mod ssh;
pub mod winrm;

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::warn;

pub use factory::ExecutorFactory;

/// Classification of execution failures; drives retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Timeout,
    Connection,
    Auth,
    Command,
    Permission,
    Unknown,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::Timeout => "timeout",
            ErrorType::Connection => "connection",
            ErrorType::Auth => "auth",
            ErrorType::Command => "command",
            ErrorType::Permission => "permission",
            ErrorType::Unknown => "unknown",
        }
    }
}

impl FromStr for ErrorType {
    type Err = ();

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input {
            "timeout" => Ok(ErrorType::Timeout),
            "connection" => Ok(ErrorType::Connection),
            "auth" => Ok(ErrorType::Auth),
            "command" => Ok(ErrorType::Command),
            "permission" => Ok(ErrorType::Permission),
            "unknown" => Ok(ErrorType::Unknown),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("{0} is not supported by this executor")]
    Unsupported(&'static str),
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Result of one command or request against one target.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    /// Exit code for command transports; HTTP status for API calls.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: i64,
    pub command: String,
    pub server_hostname: String,
    pub executed_at: DateTime<Utc>,
    pub error_type: Option<ErrorType>,
    pub error_message: Option<String>,
    pub retryable: bool,
    /// Values pulled out of an API response by configured extract patterns.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub extracted: HashMap<String, String>,
}

impl ExecutionResult {
    pub fn failure(
        command: &str,
        hostname: &str,
        error_type: ErrorType,
        message: impl Into<String>,
        retryable: bool,
        duration_ms: i64,
    ) -> Self {
        let message = message.into();
        Self {
            success: false,
            exit_code: -1,
            stdout: String::new(),
            stderr: message.clone(),
            duration_ms,
            command: command.to_string(),
            server_hostname: hostname.to_string(),
            executed_at: Utc::now(),
            error_type: Some(error_type),
            error_message: Some(message),
            retryable,
            extracted: HashMap::new(),
        }
    }

    pub fn combined_output(&self) -> String {
        let mut parts = Vec::new();
        if !self.stdout.is_empty() {
            parts.push(self.stdout.clone());
        }
        if !self.stderr.is_empty() {
            parts.push(format!("[STDERR]\n{}", self.stderr));
        }
        parts.join("\n")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerInfo {
    pub hostname: String,
    pub os_type: String,
    pub os_version: Option<String>,
    pub kernel_version: Option<String>,
    pub architecture: Option<String>,
    pub uptime_seconds: Option<i64>,
}

impl ServerInfo {
    pub fn bare(hostname: &str, os_type: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
            os_type: os_type.to_string(),
            os_version: None,
            kernel_version: None,
            architecture: None,
            uptime_seconds: None,
        }
    }
}

/// Per-call execution options.
#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    pub timeout_seconds: Option<u64>,
    pub with_elevation: bool,
    pub env: HashMap<String, String>,
    pub working_directory: Option<String>,
}

/// Outcome of an interactive run that may be blocked on stdin.
#[derive(Debug, Clone, Serialize)]
pub struct InteractiveResult {
    pub completed: bool,
    pub needs_input: bool,
    pub output: String,
    pub error: String,
    pub exit_code: Option<i32>,
    pub process_id: Option<uuid::Uuid>,
}

/// Capability set every transport exposes. Optional capabilities default to
/// `Unsupported`; variants override what their protocol can actually do.
#[async_trait]
pub trait Executor: Send + Sync {
    fn protocol(&self) -> &'static str;
    fn hostname(&self) -> &str;
    fn supports_elevation(&self) -> bool;

    async fn connect(&self) -> Result<(), ExecutorError>;
    async fn disconnect(&self);
    async fn is_connected(&self) -> bool;

    async fn execute(&self, command: &str, request: &ExecRequest) -> ExecutionResult;

    async fn test_connection(&self) -> bool;
    async fn server_info(&self) -> ServerInfo;

    async fn upload_file(&self, _local: &Path, _remote: &str) -> Result<(), ExecutorError> {
        Err(ExecutorError::Unsupported("file upload"))
    }

    async fn download_file(&self, _remote: &str, _local: &Path) -> Result<(), ExecutorError> {
        Err(ExecutorError::Unsupported("file download"))
    }

    /// Lazy line stream; stderr lines are prefixed with `[STDERR] `. The
    /// default buffers a plain execute and replays it line by line.
    async fn stream_execute(
        &self,
        command: &str,
        request: &ExecRequest,
    ) -> Result<mpsc::Receiver<String>, ExecutorError> {
        let result = self.execute(command, request).await;
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            for line in result.stdout.lines() {
                if tx.send(line.to_string()).await.is_err() {
                    return;
                }
            }
            if !result.stderr.is_empty() {
                for line in result.stderr.lines() {
                    if tx.send(format!("[STDERR] {line}")).await.is_err() {
                        return;
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn execute_interactive(
        &self,
        _command: &str,
        _initial_timeout_seconds: u64,
        _with_elevation: bool,
    ) -> Result<InteractiveResult, ExecutorError> {
        Err(ExecutorError::Unsupported("interactive execution"))
    }

    async fn send_input(
        &self,
        _process_id: uuid::Uuid,
        _input: &str,
        _wait_timeout_seconds: u64,
    ) -> Result<InteractiveResult, ExecutorError> {
        Err(ExecutorError::Unsupported("interactive input"))
    }

    async fn cancel_interactive(&self, _process_id: uuid::Uuid) -> Result<bool, ExecutorError> {
        Err(ExecutorError::Unsupported("interactive cancel"))
    }

    /// Execute with automatic retry on retryable failures, reconnecting
    /// after transport-level errors. `retry_command_failures` additionally
    /// retries plain command failures, for callers whose configuration
    /// declares retries. Returns the final result and the attempt index it
    /// came from.
    async fn execute_with_retry(
        &self,
        command: &str,
        request: &ExecRequest,
        max_retries: u32,
        retry_delay_seconds: u64,
        retry_command_failures: bool,
    ) -> (ExecutionResult, u32) {
        let mut last = None;

        for attempt in 0..=max_retries {
            let result = self.execute(command, request).await;
            if result.success {
                return (result, attempt);
            }

            let retryable = result.retryable
                || (retry_command_failures && result.error_type == Some(ErrorType::Command));
            let connection_error = result.error_type == Some(ErrorType::Connection);
            last = Some((result, attempt));

            if !retryable || attempt >= max_retries {
                break;
            }

            sleep(Duration::from_secs(retry_delay_seconds)).await;

            if connection_error {
                self.disconnect().await;
                if let Err(err) = self.connect().await {
                    warn!(?err, host = self.hostname(), "reconnect before retry failed");
                }
            }
        }

        last.unwrap_or_else(|| {
            (
                ExecutionResult::failure(
                    command,
                    self.hostname(),
                    ErrorType::Unknown,
                    "execution produced no result",
                    false,
                    0,
                ),
                0,
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_type_round_trips() {
        for kind in [
            ErrorType::Timeout,
            ErrorType::Connection,
            ErrorType::Auth,
            ErrorType::Command,
            ErrorType::Permission,
            ErrorType::Unknown,
        ] {
            assert_eq!(ErrorType::from_str(kind.as_str()), Ok(kind));
        }
        assert!(ErrorType::from_str("transient").is_err());
    }

    #[test]
    fn combined_output_marks_stderr() {
        let mut result = ExecutionResult::failure("ls", "h", ErrorType::Command, "boom", false, 1);
        result.stdout = "file".into();
        result.stderr = "boom".into();
        assert_eq!(result.combined_output(), "file\n[STDERR]\nboom");
    }
}
