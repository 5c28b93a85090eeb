use std::collections::HashMap;
use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tokio::task::spawn_blocking;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    ErrorType, ExecRequest, ExecutionResult, Executor, ExecutorError, InteractiveResult,
    ServerInfo,
};

const CONNECT_TIMEOUT_SECS: u64 = 10;
const INTERACTIVE_POLL_MS: u32 = 500;
const OUTPUT_CHUNK: usize = 4096;

type SharedSession = Arc<StdMutex<ssh2::Session>>;
type SharedChannel = Arc<StdMutex<ssh2::Channel>>;

/// SSH executor for Linux targets: one session per target, a channel per
/// command, sudo elevation, streaming, interactive stdin and SFTP transfer.
pub struct SshExecutor {
    hostname: String,
    port: u16,
    username: String,
    password: Option<String>,
    private_key: Option<String>,
    private_key_passphrase: Option<String>,
    sudo_password: Option<String>,
    timeout_seconds: u64,
    session: Mutex<Option<SharedSession>>,
    interactive: DashMap<Uuid, SharedChannel>,
}

impl SshExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        hostname: String,
        port: u16,
        username: String,
        password: Option<String>,
        private_key: Option<String>,
        private_key_passphrase: Option<String>,
        sudo_password: Option<String>,
        timeout_seconds: u64,
    ) -> Self {
        Self {
            hostname,
            port,
            username,
            password,
            private_key,
            private_key_passphrase,
            sudo_password,
            timeout_seconds,
            session: Mutex::new(None),
            interactive: DashMap::new(),
        }
    }

    async fn session(&self) -> Result<SharedSession, ExecutorError> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref() {
            return Ok(session.clone());
        }
        let session = self.open_session().await?;
        *guard = Some(session.clone());
        Ok(session)
    }

    async fn open_session(&self) -> Result<SharedSession, ExecutorError> {
        let hostname = self.hostname.clone();
        let port = self.port;
        let username = self.username.clone();
        let password = self.password.clone();
        let private_key = self.private_key.clone();
        let passphrase = self.private_key_passphrase.clone();
        let timeout = self.timeout_seconds;

        let session = spawn_blocking(move || -> Result<ssh2::Session, ExecutorError> {
            let address = (hostname.as_str(), port)
                .to_socket_addrs()
                .map_err(|err| ExecutorError::Connection(err.to_string()))?
                .next()
                .ok_or_else(|| {
                    ExecutorError::Connection(format!("{hostname}:{port} did not resolve"))
                })?;
            let stream =
                TcpStream::connect_timeout(&address, Duration::from_secs(CONNECT_TIMEOUT_SECS))
                    .map_err(|err| ExecutorError::Connection(err.to_string()))?;

            let mut session =
                ssh2::Session::new().map_err(|err| ExecutorError::Connection(err.to_string()))?;
            session.set_tcp_stream(stream);
            session.set_timeout((timeout * 1000) as u32);
            session
                .handshake()
                .map_err(|err| ExecutorError::Connection(err.to_string()))?;

            if let Some(key) = private_key.as_deref() {
                session
                    .userauth_pubkey_memory(&username, None, key, passphrase.as_deref())
                    .map_err(|err| ExecutorError::Auth(err.to_string()))?;
            } else if let Some(password) = password.as_deref() {
                session
                    .userauth_password(&username, password)
                    .map_err(|err| ExecutorError::Auth(err.to_string()))?;
            }
            if !session.authenticated() {
                return Err(ExecutorError::Auth("no usable ssh credential".to_string()));
            }
            Ok(session)
        })
        .await
        .map_err(|err| ExecutorError::Connection(err.to_string()))??;

        info!(host = %self.hostname, port = self.port, "ssh session established");
        Ok(Arc::new(StdMutex::new(session)))
    }

    async fn invalidate_session(&self) {
        self.session.lock().await.take();
    }

    /// Compose the remote command line: working directory, env prefix, then
    /// elevation wrapping the whole thing.
    fn build_command(&self, command: &str, request: &ExecRequest) -> String {
        build_full_command(
            command,
            request,
            self.sudo_password.as_deref(),
        )
    }
}

fn build_full_command(
    command: &str,
    request: &ExecRequest,
    sudo_password: Option<&str>,
) -> String {
    let mut full = command.to_string();
    if let Some(directory) = &request.working_directory {
        full = format!("cd {directory} && {full}");
    }
    if !request.env.is_empty() {
        let mut pairs: Vec<(&String, &String)> = request.env.iter().collect();
        pairs.sort();
        let prefix: Vec<String> = pairs
            .into_iter()
            .map(|(key, value)| format!("{key}=\"{value}\""))
            .collect();
        full = format!("{} {full}", prefix.join(" "));
    }
    if request.with_elevation {
        full = match sudo_password {
            Some(password) => format!("echo '{password}' | sudo -S {full}"),
            None => format!("sudo {full}"),
        };
    }
    full
}

fn run_channel(
    session: &SharedSession,
    command: &str,
    timeout_seconds: u64,
) -> Result<(i32, String, String), ssh2::Error> {
    let session = session.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    session.set_timeout((timeout_seconds * 1000) as u32);
    let mut channel = session.channel_session()?;
    channel.exec(command)?;

    let mut stdout = String::new();
    let mut stderr = String::new();
    channel.read_to_string(&mut stdout).ok();
    channel.stderr().read_to_string(&mut stderr).ok();
    channel.wait_close().ok();
    let exit_code = channel.exit_status().unwrap_or(-1);
    Ok((exit_code, stdout, stderr))
}

/// Drain whatever output is currently readable without blocking past the
/// session poll timeout.
fn drain_available(channel: &mut ssh2::Channel) -> String {
    let mut collected = Vec::new();
    let mut buffer = [0u8; OUTPUT_CHUNK];
    loop {
        match channel.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => collected.extend_from_slice(&buffer[..read]),
            Err(_) => break,
        }
        if collected.len() >= OUTPUT_CHUNK {
            break;
        }
    }
    String::from_utf8_lossy(&collected).into_owned()
}

#[async_trait]
impl Executor for SshExecutor {
    fn protocol(&self) -> &'static str {
        "ssh"
    }

    fn hostname(&self) -> &str {
        &self.hostname
    }

    fn supports_elevation(&self) -> bool {
        true
    }

    async fn connect(&self) -> Result<(), ExecutorError> {
        self.session().await.map(|_| ())
    }

    async fn disconnect(&self) {
        if let Some(session) = self.session.lock().await.take() {
            let _ = spawn_blocking(move || {
                if let Ok(session) = session.lock() {
                    let _ = session.disconnect(None, "closing", None);
                }
            })
            .await;
            info!(host = %self.hostname, "ssh session closed");
        }
    }

    async fn is_connected(&self) -> bool {
        self.session.lock().await.is_some()
    }

    async fn execute(&self, command: &str, request: &ExecRequest) -> ExecutionResult {
        let started = Instant::now();
        let executed_at = Utc::now();

        let session = match self.session().await {
            Ok(session) => session,
            Err(ExecutorError::Auth(message)) => {
                return ExecutionResult::failure(
                    command,
                    &self.hostname,
                    ErrorType::Auth,
                    format!("SSH authentication failed: {message}"),
                    false,
                    started.elapsed().as_millis() as i64,
                );
            }
            Err(err) => {
                return ExecutionResult::failure(
                    command,
                    &self.hostname,
                    ErrorType::Connection,
                    format!("SSH connection failed: {err}"),
                    true,
                    started.elapsed().as_millis() as i64,
                );
            }
        };

        let effective_timeout = request.timeout_seconds.unwrap_or(self.timeout_seconds);
        let full_command = self.build_command(command, request);
        let worker_session = session.clone();
        let worker_command = full_command.clone();
        let work = spawn_blocking(move || {
            run_channel(&worker_session, &worker_command, effective_timeout)
        });

        // The session-level timeout bounds the blocking call; the outer
        // timeout adds a grace second so a wedged transport cannot hold the
        // step forever.
        let outcome =
            tokio::time::timeout(Duration::from_secs(effective_timeout + 1), work).await;

        let duration_ms = started.elapsed().as_millis() as i64;
        match outcome {
            Err(_) => {
                warn!(host = %self.hostname, %command, "ssh command timed out");
                self.invalidate_session().await;
                ExecutionResult::failure(
                    command,
                    &self.hostname,
                    ErrorType::Timeout,
                    format!("Command timed out after {effective_timeout}s"),
                    true,
                    duration_ms,
                )
            }
            Ok(Err(join_err)) => {
                self.invalidate_session().await;
                ExecutionResult::failure(
                    command,
                    &self.hostname,
                    ErrorType::Unknown,
                    join_err.to_string(),
                    false,
                    duration_ms,
                )
            }
            Ok(Ok(Err(ssh_err))) => {
                self.invalidate_session().await;
                ExecutionResult::failure(
                    command,
                    &self.hostname,
                    ErrorType::Connection,
                    format!("SSH channel error: {ssh_err}"),
                    true,
                    duration_ms,
                )
            }
            Ok(Ok(Ok((exit_code, stdout, stderr)))) => {
                let success = exit_code == 0;
                ExecutionResult {
                    success,
                    exit_code,
                    stdout,
                    stderr: stderr.clone(),
                    duration_ms,
                    command: command.to_string(),
                    server_hostname: self.hostname.clone(),
                    executed_at,
                    error_type: if success { None } else { Some(ErrorType::Command) },
                    error_message: if success || stderr.is_empty() {
                        None
                    } else {
                        Some(stderr)
                    },
                    retryable: false,
                    extracted: Default::default(),
                }
            }
        }
    }

    async fn test_connection(&self) -> bool {
        let mut request = ExecRequest::default();
        request.timeout_seconds = Some(10);
        let result = self.execute("echo 'test'", &request).await;
        result.success && result.stdout.contains("test")
    }

    async fn server_info(&self) -> ServerInfo {
        let mut info = ServerInfo::bare(&self.hostname, "linux");
        let mut request = ExecRequest::default();
        request.timeout_seconds = Some(10);

        let result = self
            .execute(
                "cat /etc/os-release 2>/dev/null | grep PRETTY_NAME | cut -d'\"' -f2",
                &request,
            )
            .await;
        if result.success && !result.stdout.trim().is_empty() {
            info.os_version = Some(result.stdout.trim().to_string());
        }

        let result = self.execute("uname -r", &request).await;
        if result.success {
            info.kernel_version = Some(result.stdout.trim().to_string());
        }

        let result = self.execute("uname -m", &request).await;
        if result.success {
            info.architecture = Some(result.stdout.trim().to_string());
        }

        let result = self
            .execute("cat /proc/uptime | cut -d' ' -f1", &request)
            .await;
        if result.success {
            info.uptime_seconds = result
                .stdout
                .trim()
                .parse::<f64>()
                .ok()
                .map(|seconds| seconds as i64);
        }

        info
    }

    async fn upload_file(&self, local: &Path, remote: &str) -> Result<(), ExecutorError> {
        let session = self.session().await?;
        let local = local.to_path_buf();
        let remote = remote.to_string();
        let hostname = self.hostname.clone();
        spawn_blocking(move || -> Result<(), ExecutorError> {
            let contents = std::fs::read(&local)
                .map_err(|err| ExecutorError::Protocol(err.to_string()))?;
            let session = session.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let sftp = session
                .sftp()
                .map_err(|err| ExecutorError::Connection(err.to_string()))?;
            let mut file = sftp
                .create(Path::new(&remote))
                .map_err(|err| ExecutorError::Protocol(err.to_string()))?;
            std::io::Write::write_all(&mut file, &contents)
                .map_err(|err| ExecutorError::Protocol(err.to_string()))?;
            info!(host = %hostname, %remote, "sftp upload complete");
            Ok(())
        })
        .await
        .map_err(|err| ExecutorError::Connection(err.to_string()))?
    }

    async fn download_file(&self, remote: &str, local: &Path) -> Result<(), ExecutorError> {
        let session = self.session().await?;
        let local = local.to_path_buf();
        let remote = remote.to_string();
        let hostname = self.hostname.clone();
        spawn_blocking(move || -> Result<(), ExecutorError> {
            let session = session.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let sftp = session
                .sftp()
                .map_err(|err| ExecutorError::Connection(err.to_string()))?;
            let mut file = sftp
                .open(Path::new(&remote))
                .map_err(|err| ExecutorError::Protocol(err.to_string()))?;
            let mut contents = Vec::new();
            file.read_to_end(&mut contents)
                .map_err(|err| ExecutorError::Protocol(err.to_string()))?;
            std::fs::write(&local, contents)
                .map_err(|err| ExecutorError::Protocol(err.to_string()))?;
            info!(host = %hostname, %remote, "sftp download complete");
            Ok(())
        })
        .await
        .map_err(|err| ExecutorError::Connection(err.to_string()))?
    }

    /// Stream stdout lines as they arrive; stderr follows with a stable
    /// `[STDERR] ` sentinel prefix.
    async fn stream_execute(
        &self,
        command: &str,
        request: &ExecRequest,
    ) -> Result<mpsc::Receiver<String>, ExecutorError> {
        let session = self.session().await?;
        let full_command = self.build_command(command, request);
        let timeout_seconds = request.timeout_seconds.unwrap_or(self.timeout_seconds);
        let (tx, rx) = mpsc::channel(64);

        spawn_blocking(move || {
            let result = (|| -> Result<(), ssh2::Error> {
                let channel = {
                    let session =
                        session.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                    session.set_timeout((timeout_seconds * 1000) as u32);
                    let mut channel = session.channel_session()?;
                    channel.exec(&full_command)?;
                    channel
                };
                let mut reader = std::io::BufReader::new(channel);
                let mut line = String::new();
                loop {
                    line.clear();
                    match std::io::BufRead::read_line(&mut reader, &mut line) {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {
                            if tx
                                .blocking_send(line.trim_end_matches('\n').to_string())
                                .is_err()
                            {
                                return Ok(());
                            }
                        }
                    }
                }
                let mut channel = reader.into_inner();
                let mut stderr = String::new();
                channel.stderr().read_to_string(&mut stderr).ok();
                for line in stderr.lines() {
                    if tx.blocking_send(format!("[STDERR] {line}")).is_err() {
                        return Ok(());
                    }
                }
                channel.wait_close().ok();
                Ok(())
            })();
            if let Err(err) = result {
                debug!(?err, "ssh stream terminated");
            }
        });

        Ok(rx)
    }

    /// Start a command and wait briefly for completion; if it is still
    /// running it is assumed to be blocked on stdin, its channel is parked
    /// in the interactive registry and partial output is returned.
    async fn execute_interactive(
        &self,
        command: &str,
        initial_timeout_seconds: u64,
        with_elevation: bool,
    ) -> Result<InteractiveResult, ExecutorError> {
        let session = self.session().await?;
        let mut request = ExecRequest::default();
        request.with_elevation = with_elevation;
        let full_command = self.build_command(command, &request);

        let handle = spawn_blocking(move || -> Result<(bool, String, Option<i32>, Option<ssh2::Channel>), ssh2::Error> {
            let mut channel = {
                let session = session.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                session.set_timeout(INTERACTIVE_POLL_MS);
                let mut channel = session.channel_session()?;
                channel.request_pty("xterm", None, None)?;
                channel.exec(&full_command)?;
                channel
            };

            let deadline = Instant::now() + Duration::from_secs(initial_timeout_seconds);
            let mut output = String::new();
            loop {
                output.push_str(&drain_available(&mut channel));
                if channel.eof() {
                    channel.wait_close().ok();
                    let exit_code = channel.exit_status().unwrap_or(0);
                    return Ok((true, output, Some(exit_code), None));
                }
                if Instant::now() >= deadline {
                    return Ok((false, output, None, Some(channel)));
                }
            }
        })
        .await
        .map_err(|err| ExecutorError::Connection(err.to_string()))?
        .map_err(|err| ExecutorError::Protocol(err.to_string()))?;

        let (completed, output, exit_code, channel) = handle;
        if completed {
            return Ok(InteractiveResult {
                completed: true,
                needs_input: false,
                output,
                error: String::new(),
                exit_code,
                process_id: None,
            });
        }

        let process_id = Uuid::new_v4();
        if let Some(channel) = channel {
            self.interactive
                .insert(process_id, Arc::new(StdMutex::new(channel)));
        }
        info!(host = %self.hostname, %process_id, "command appears interactive");
        Ok(InteractiveResult {
            completed: false,
            needs_input: true,
            output,
            error: String::new(),
            exit_code: None,
            process_id: Some(process_id),
        })
    }

    async fn send_input(
        &self,
        process_id: Uuid,
        input: &str,
        wait_timeout_seconds: u64,
    ) -> Result<InteractiveResult, ExecutorError> {
        let channel = self
            .interactive
            .get(&process_id)
            .map(|entry| entry.value().clone())
            .ok_or(ExecutorError::Protocol(
                "process not found or already completed".to_string(),
            ))?;

        let line = format!("{input}\n");
        let outcome = spawn_blocking(move || -> Result<(bool, String, Option<i32>), String> {
            let mut channel = channel.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            std::io::Write::write_all(&mut *channel, line.as_bytes())
                .map_err(|err| format!("stdin write failed: {err}"))?;
            std::io::Write::flush(&mut *channel).ok();

            let deadline = Instant::now() + Duration::from_secs(wait_timeout_seconds);
            let mut output = String::new();
            loop {
                output.push_str(&drain_available(&mut channel));
                if channel.eof() {
                    channel.wait_close().ok();
                    let exit_code = channel.exit_status().unwrap_or(0);
                    return Ok((true, output, Some(exit_code)));
                }
                if Instant::now() >= deadline {
                    return Ok((false, output, None));
                }
            }
        })
        .await
        .map_err(|err| ExecutorError::Connection(err.to_string()))?;

        let (completed, output, exit_code) = match outcome {
            Ok(outcome) => outcome,
            Err(message) => {
                self.interactive.remove(&process_id);
                return Err(ExecutorError::Protocol(message));
            }
        };
        if completed {
            self.interactive.remove(&process_id);
        }
        Ok(InteractiveResult {
            completed,
            needs_input: !completed,
            output,
            error: String::new(),
            exit_code,
            process_id: if completed { None } else { Some(process_id) },
        })
    }

    /// Interrupt-then-kill collapses to closing the channel at this layer;
    /// the remote pty receives hangup and the process group is torn down.
    async fn cancel_interactive(&self, process_id: Uuid) -> Result<bool, ExecutorError> {
        let Some((_, channel)) = self.interactive.remove(&process_id) else {
            return Ok(false);
        };
        let hostname = self.hostname.clone();
        spawn_blocking(move || {
            let mut channel = channel.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            channel.close().ok();
            channel.wait_close().ok();
            info!(host = %hostname, %process_id, "cancelled interactive process");
        })
        .await
        .map_err(|err| ExecutorError::Connection(err.to_string()))?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(
        env: &[(&str, &str)],
        working_directory: Option<&str>,
        with_elevation: bool,
    ) -> ExecRequest {
        ExecRequest {
            timeout_seconds: None,
            with_elevation,
            env: env
                .iter()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect(),
            working_directory: working_directory.map(str::to_string),
        }
    }

    #[test]
    fn working_directory_and_env_prefix_compose() {
        let built = build_full_command(
            "systemctl restart nginx",
            &request(&[("LANG", "C")], Some("/srv"), false),
            None,
        );
        assert_eq!(built, "LANG=\"C\" cd /srv && systemctl restart nginx");
    }

    #[test]
    fn passwordless_sudo_prefixes_plain_sudo() {
        let built = build_full_command("whoami", &request(&[], None, true), None);
        assert_eq!(built, "sudo whoami");
    }

    #[test]
    fn sudo_password_is_piped_through_stdin() {
        let built = build_full_command("whoami", &request(&[], None, true), Some("s3cret"));
        assert_eq!(built, "echo 's3cret' | sudo -S whoami");
    }

    #[test]
    fn elevation_wraps_directory_and_env() {
        let built = build_full_command(
            "apt-get update",
            &request(&[("DEBIAN_FRONTEND", "noninteractive")], Some("/tmp"), true),
            None,
        );
        assert_eq!(
            built,
            "sudo DEBIAN_FRONTEND=\"noninteractive\" cd /tmp && apt-get update"
        );
    }
}
