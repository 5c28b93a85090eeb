use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{ErrorType, ExecRequest, ExecutionResult, Executor, ExecutorError, ServerInfo};

const WSMAN_SHELL_URI: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/cmd";
const RECEIVE_POLL_DELAY_MS: u64 = 500;

static SHELL_ID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?:<rsp:ShellId>|Name="ShellId">)([^<]+)<"#).expect("shell id regex")
});
static COMMAND_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<rsp:CommandId>([^<]+)</rsp:CommandId>").expect("command id regex"));
static STREAM_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"<rsp:Stream[^>]*Name="(stdout|stderr)"[^>]*>([^<]*)</rsp:Stream>"#)
        .expect("stream regex")
});
static EXIT_CODE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<rsp:ExitCode>(-?\d+)</rsp:ExitCode>").expect("exit code regex"));
static DONE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"CommandState[^>]*State="[^"]*CommandState/Done""#).expect("done regex")
});
static FAULT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<s:Fault|<f:WSManFault").expect("fault regex"));

/// Heuristic dispatch between PowerShell and CMD, mirroring how operators
/// actually write Windows steps: cmdlet-shaped commands and variable
/// references go to PowerShell, everything else to cmd.exe.
pub fn is_powershell(command: &str) -> bool {
    let lowered = command.to_lowercase();
    lowered.contains("get-")
        || lowered.contains("start-service")
        || lowered.contains("stop-service")
        || lowered.contains("restart-service")
        || lowered.contains("select-object")
        || lowered.contains("gci")
        || command.contains('$')
}

/// `powershell -EncodedCommand` takes UTF-16LE base64.
pub fn encode_powershell(command: &str) -> String {
    let utf16: Vec<u8> = command
        .encode_utf16()
        .flat_map(|unit| unit.to_le_bytes())
        .collect();
    BASE64.encode(utf16)
}

/// Windows Remote Management executor speaking WS-Man over HTTP(S).
///
/// The protocol is a shell lifecycle: create a remote shell, post the
/// command, poll Receive for base64 stdout/stderr chunks until the command
/// state reports Done, then delete the shell. Authentication is HTTP Basic;
/// a credential asking for `ntlm` is downgraded with a warning.
pub struct WinRmExecutor {
    hostname: String,
    port: u16,
    username: String,
    password: Option<String>,
    use_ssl: bool,
    cert_validation: bool,
    timeout_seconds: u64,
    client: Mutex<Option<Client>>,
}

impl WinRmExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        hostname: String,
        port: u16,
        username: String,
        password: Option<String>,
        transport: &str,
        use_ssl: bool,
        cert_validation: bool,
        timeout_seconds: u64,
    ) -> Self {
        if transport == "ntlm" {
            warn!(%hostname, "winrm ntlm transport requested; falling back to basic auth");
        }
        Self {
            hostname,
            port,
            username,
            password,
            use_ssl,
            cert_validation,
            timeout_seconds,
            client: Mutex::new(None),
        }
    }

    fn endpoint(&self) -> String {
        let scheme = if self.use_ssl { "https" } else { "http" };
        format!("{scheme}://{}:{}/wsman", self.hostname, self.port)
    }

    async fn client(&self) -> Result<Client, ExecutorError> {
        let mut guard = self.client.lock().await;
        if guard.is_none() {
            let client = Client::builder()
                .timeout(Duration::from_secs(self.timeout_seconds))
                .danger_accept_invalid_certs(!self.cert_validation)
                .build()
                .map_err(|err| ExecutorError::Connection(err.to_string()))?;
            *guard = Some(client);
        }
        Ok(guard.clone().unwrap_or_else(Client::new))
    }

    async fn post_envelope(
        &self,
        client: &Client,
        envelope: String,
        timeout: Duration,
    ) -> Result<String, (ErrorType, bool, String)> {
        let response = client
            .post(self.endpoint())
            .basic_auth(&self.username, self.password.as_deref())
            .header("Content-Type", "application/soap+xml;charset=UTF-8")
            .timeout(timeout)
            .body(envelope)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    (ErrorType::Timeout, true, err.to_string())
                } else {
                    (ErrorType::Connection, true, err.to_string())
                }
            })?;

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();

        if status == 401 || status == 403 {
            return Err((
                ErrorType::Auth,
                false,
                format!("WinRM authentication rejected (HTTP {status})"),
            ));
        }
        if status >= 400 && FAULT_RE.is_match(&body) {
            return Err((
                ErrorType::Command,
                false,
                format!("WinRM fault (HTTP {status})"),
            ));
        }
        if status >= 400 {
            return Err((
                ErrorType::Connection,
                true,
                format!("WinRM endpoint returned HTTP {status}"),
            ));
        }
        Ok(body)
    }

    async fn run_shell_command(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<(i32, String, String), (ErrorType, bool, String)> {
        let client = self
            .client()
            .await
            .map_err(|err| (ErrorType::Connection, true, err.to_string()))?;
        let deadline = Instant::now() + timeout;

        let create = envelope_create_shell(&self.endpoint());
        let body = self.post_envelope(&client, create, timeout).await?;
        let shell_id = SHELL_ID_RE
            .captures(&body)
            .and_then(|captures| captures.get(1))
            .map(|capture| capture.as_str().to_string())
            .ok_or_else(|| {
                (
                    ErrorType::Connection,
                    true,
                    "WinRM create response carried no shell id".to_string(),
                )
            })?;

        let result = self
            .run_in_shell(&client, &shell_id, command, deadline)
            .await;

        // Shell cleanup is best-effort; a leaked shell times out server-side.
        let delete = envelope_delete_shell(&self.endpoint(), &shell_id);
        if let Err(err) = self
            .post_envelope(&client, delete, Duration::from_secs(10))
            .await
        {
            debug!(?err, %shell_id, "winrm shell delete failed");
        }

        result
    }

    async fn run_in_shell(
        &self,
        client: &Client,
        shell_id: &str,
        command: &str,
        deadline: Instant,
    ) -> Result<(i32, String, String), (ErrorType, bool, String)> {
        let (shell_command, arguments) = if is_powershell(command) {
            (
                "powershell".to_string(),
                vec![
                    "-NoProfile".to_string(),
                    "-EncodedCommand".to_string(),
                    encode_powershell(command),
                ],
            )
        } else {
            (command.to_string(), Vec::new())
        };

        let execute = envelope_command(&self.endpoint(), shell_id, &shell_command, &arguments);
        let body = self
            .post_envelope(client, execute, remaining(deadline)?)
            .await?;
        let command_id = COMMAND_ID_RE
            .captures(&body)
            .and_then(|captures| captures.get(1))
            .map(|capture| capture.as_str().to_string())
            .ok_or_else(|| {
                (
                    ErrorType::Connection,
                    true,
                    "WinRM command response carried no command id".to_string(),
                )
            })?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        loop {
            let receive = envelope_receive(&self.endpoint(), shell_id, &command_id);
            let body = self
                .post_envelope(client, receive, remaining(deadline)?)
                .await?;
            let (out_chunk, err_chunk) = decode_streams(&body);
            stdout.push_str(&out_chunk);
            stderr.push_str(&err_chunk);

            if DONE_RE.is_match(&body) {
                let exit_code = EXIT_CODE_RE
                    .captures(&body)
                    .and_then(|captures| captures.get(1))
                    .and_then(|capture| capture.as_str().parse().ok())
                    .unwrap_or(0);
                return Ok((exit_code, stdout, stderr));
            }
            tokio::time::sleep(Duration::from_millis(RECEIVE_POLL_DELAY_MS)).await;
        }
    }
}

fn remaining(deadline: Instant) -> Result<Duration, (ErrorType, bool, String)> {
    let now = Instant::now();
    if now >= deadline {
        return Err((
            ErrorType::Timeout,
            true,
            "Command timed out".to_string(),
        ));
    }
    Ok(deadline - now)
}

#[async_trait]
impl Executor for WinRmExecutor {
    fn protocol(&self) -> &'static str {
        "winrm"
    }

    fn hostname(&self) -> &str {
        &self.hostname
    }

    fn supports_elevation(&self) -> bool {
        false
    }

    async fn connect(&self) -> Result<(), ExecutorError> {
        self.client().await.map(|_| ())
    }

    async fn disconnect(&self) {
        self.client.lock().await.take();
    }

    async fn is_connected(&self) -> bool {
        self.client.lock().await.is_some()
    }

    async fn execute(&self, command: &str, request: &ExecRequest) -> ExecutionResult {
        let started = Instant::now();
        let executed_at = Utc::now();
        let timeout = Duration::from_secs(request.timeout_seconds.unwrap_or(self.timeout_seconds));

        match self.run_shell_command(command, timeout).await {
            Ok((exit_code, stdout, stderr)) => {
                let success = exit_code == 0;
                ExecutionResult {
                    success,
                    exit_code,
                    stdout,
                    stderr: stderr.clone(),
                    duration_ms: started.elapsed().as_millis() as i64,
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
            Err((error_type, retryable, message)) => {
                if error_type == ErrorType::Connection {
                    self.disconnect().await;
                }
                ExecutionResult::failure(
                    command,
                    &self.hostname,
                    error_type,
                    message,
                    retryable,
                    started.elapsed().as_millis() as i64,
                )
            }
        }
    }

    async fn test_connection(&self) -> bool {
        let result = self.execute("echo OK", &ExecRequest::default()).await;
        result.success && result.stdout.contains("OK")
    }

    async fn server_info(&self) -> ServerInfo {
        let mut info = ServerInfo::bare(&self.hostname, "windows");
        let result = self
            .execute("systeminfo /FO CSV", &ExecRequest::default())
            .await;
        if result.success {
            info.architecture = Some("x64".to_string());
            if let Some(line) = result.stdout.lines().nth(1) {
                info.os_version = line.split(',').nth(1).map(|field| {
                    field.trim_matches('"').to_string()
                });
            }
        }
        info
    }
}

fn decode_streams(body: &str) -> (String, String) {
    let mut stdout = String::new();
    let mut stderr = String::new();
    for captures in STREAM_RE.captures_iter(body) {
        let chunk = captures.get(2).map(|capture| capture.as_str()).unwrap_or("");
        if chunk.is_empty() {
            continue;
        }
        let decoded = BASE64
            .decode(chunk)
            .ok()
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default();
        match captures.get(1).map(|capture| capture.as_str()) {
            Some("stdout") => stdout.push_str(&decoded),
            Some("stderr") => stderr.push_str(&decoded),
            _ => {}
        }
    }
    (stdout, stderr)
}

fn envelope_header(action: &str, endpoint: &str, shell_selector: Option<&str>) -> String {
    let message_id = Uuid::new_v4();
    let selector = shell_selector
        .map(|shell_id| {
            format!(
                r#"<w:SelectorSet><w:Selector Name="ShellId">{shell_id}</w:Selector></w:SelectorSet>"#
            )
        })
        .unwrap_or_default();
    format!(
        r#"<s:Header>
<a:To>{endpoint}</a:To>
<a:ReplyTo><a:Address s:mustUnderstand="true">http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous</a:Address></a:ReplyTo>
<w:ResourceURI s:mustUnderstand="true">{WSMAN_SHELL_URI}</w:ResourceURI>
<a:Action s:mustUnderstand="true">{action}</a:Action>
<w:MaxEnvelopeSize s:mustUnderstand="true">153600</w:MaxEnvelopeSize>
<a:MessageID>uuid:{message_id}</a:MessageID>
<w:OperationTimeout>PT60S</w:OperationTimeout>
{selector}</s:Header>"#
    )
}

fn envelope_wrap(header: String, body: String) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" xmlns:a="http://schemas.xmlsoap.org/ws/2004/08/addressing" xmlns:w="http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd" xmlns:rsp="http://schemas.microsoft.com/wbem/wsman/1/windows/shell">
{header}
<s:Body>{body}</s:Body>
</s:Envelope>"#
    )
}

fn envelope_create_shell(endpoint: &str) -> String {
    let header = envelope_header(
        "http://schemas.xmlsoap.org/ws/2004/09/transfer/Create",
        endpoint,
        None,
    );
    let body = r#"<rsp:Shell><rsp:InputStreams>stdin</rsp:InputStreams><rsp:OutputStreams>stdout stderr</rsp:OutputStreams></rsp:Shell>"#;
    envelope_wrap(header, body.to_string())
}

fn envelope_command(endpoint: &str, shell_id: &str, command: &str, arguments: &[String]) -> String {
    let header = envelope_header(
        "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Command",
        endpoint,
        Some(shell_id),
    );
    let rendered_arguments: String = arguments
        .iter()
        .map(|argument| format!("<rsp:Arguments>{}</rsp:Arguments>", xml_escape(argument)))
        .collect();
    let body = format!(
        r#"<rsp:CommandLine><rsp:Command>{}</rsp:Command>{rendered_arguments}</rsp:CommandLine>"#,
        xml_escape(command)
    );
    envelope_wrap(header, body)
}

fn envelope_receive(endpoint: &str, shell_id: &str, command_id: &str) -> String {
    let header = envelope_header(
        "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Receive",
        endpoint,
        Some(shell_id),
    );
    let body = format!(
        r#"<rsp:Receive><rsp:DesiredStream CommandId="{command_id}">stdout stderr</rsp:DesiredStream></rsp:Receive>"#
    );
    envelope_wrap(header, body)
}

fn envelope_delete_shell(endpoint: &str, shell_id: &str) -> String {
    let header = envelope_header(
        "http://schemas.xmlsoap.org/ws/2004/09/transfer/Delete",
        endpoint,
        Some(shell_id),
    );
    envelope_wrap(header, String::new())
}

fn xml_escape(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cmdlet_commands_dispatch_as_powershell() {
        assert!(is_powershell("Get-Service W3SVC"));
        assert!(is_powershell("Restart-Service spooler"));
        assert!(is_powershell("gci C:\\logs | Select-Object Name"));
        assert!(is_powershell("$env:TEMP"));
        assert!(!is_powershell("ipconfig /all"));
        assert!(!is_powershell("netstat -ano"));
    }

    #[test]
    fn powershell_encoding_is_utf16le_base64() {
        // "dir" -> 64 00 69 00 72 00
        assert_eq!(encode_powershell("dir"), BASE64.encode([0x64, 0, 0x69, 0, 0x72, 0]));
    }

    #[test]
    fn stream_chunks_decode_by_name() {
        let body = format!(
            r#"<rsp:Stream Name="stdout" CommandId="x">{}</rsp:Stream><rsp:Stream Name="stderr" CommandId="x">{}</rsp:Stream>"#,
            BASE64.encode("hello"),
            BASE64.encode("oops"),
        );
        let (stdout, stderr) = decode_streams(&body);
        assert_eq!(stdout, "hello");
        assert_eq!(stderr, "oops");
    }

    #[test]
    fn shell_id_parses_both_response_shapes() {
        let element = "<rsp:ShellId>ABC-123</rsp:ShellId>";
        let selector = r#"<w:Selector Name="ShellId">DEF-456</w:Selector>"#;
        assert_eq!(
            SHELL_ID_RE.captures(element).unwrap().get(1).unwrap().as_str(),
            "ABC-123"
        );
        assert_eq!(
            SHELL_ID_RE.captures(selector).unwrap().get(1).unwrap().as_str(),
            "DEF-456"
        );
    }

    #[test]
    fn done_state_and_exit_code_parse() {
        let body = r#"<rsp:CommandState CommandId="x" State="http://schemas.microsoft.com/wbem/wsman/1/windows/shell/CommandState/Done"><rsp:ExitCode>3</rsp:ExitCode></rsp:CommandState>"#;
        assert!(DONE_RE.is_match(body));
        assert_eq!(
            EXIT_CODE_RE.captures(body).unwrap().get(1).unwrap().as_str(),
            "3"
        );
    }
}
