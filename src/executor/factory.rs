use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::join_all;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::db::servers::{ApiCredentialProfile, CredentialProfile, ServerCredential};
use crate::vault::SecretVault;

use super::http_api::ApiExecutor;
use super::ssh::SshExecutor;
use super::winrm::WinRmExecutor;
use super::{ErrorType, ExecRequest, ExecutionResult, Executor};

const DEFAULT_SSH_PORT: u16 = 22;
const DEFAULT_WINRM_PORT: u16 = 5985;
const WINRM_SSL_PORT: u16 = 5986;
const DEFAULT_API_PORT: u16 = 443;
const DEFAULT_COMMAND_TIMEOUT: u64 = 60;
const FANOUT_CONCURRENCY: usize = 10;

#[derive(Debug, Error)]
pub enum FactoryError {
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),
    #[error("api credential profile `{0}` is disabled")]
    ProfileDisabled(String),
}

/// Resolved plaintext credentials for one target.
#[derive(Default)]
struct DecryptedCredentials {
    password: Option<String>,
    private_key: Option<String>,
    sudo_password: Option<String>,
    api_token: Option<String>,
    username_override: Option<String>,
}

/// Builds transport executors from stored credentials.
///
/// Decrypts secrets through the vault, picks the variant by protocol and
/// keeps a per-process pool of connected executors keyed by host and port.
pub struct ExecutorFactory {
    vault: SecretVault,
    pool: DashMap<String, Arc<dyn Executor>>,
}

impl ExecutorFactory {
    pub fn new(vault: SecretVault) -> Self {
        Self {
            vault,
            pool: DashMap::new(),
        }
    }

    /// Construct an executor for a server without connecting. The shared
    /// credential profile, when referenced, fills whichever slots the inline
    /// credential leaves empty.
    pub fn executor_for(
        &self,
        server: &ServerCredential,
        profile: Option<&CredentialProfile>,
    ) -> Result<Arc<dyn Executor>, FactoryError> {
        let credentials = self.decrypt_credentials(server, profile);
        let username = credentials
            .username_override
            .clone()
            .or_else(|| server.username.clone());

        match server.protocol.as_str() {
            "ssh" => Ok(Arc::new(SshExecutor::new(
                server.hostname.clone(),
                port_or(server.port, DEFAULT_SSH_PORT),
                username.unwrap_or_else(|| "root".to_string()),
                credentials.password,
                credentials.private_key,
                None,
                credentials.sudo_password,
                DEFAULT_COMMAND_TIMEOUT,
            ))),
            "winrm" => {
                let port = port_or(server.port, DEFAULT_WINRM_PORT);
                // SSL auto-enables on the HTTPS port unless explicitly set.
                let use_ssl = server.winrm_use_ssl.unwrap_or(port == WINRM_SSL_PORT);
                Ok(Arc::new(WinRmExecutor::new(
                    server.hostname.clone(),
                    port,
                    username.unwrap_or_else(|| "Administrator".to_string()),
                    credentials.password,
                    server.winrm_transport.as_deref().unwrap_or("ntlm"),
                    use_ssl,
                    server.winrm_cert_validation,
                    DEFAULT_COMMAND_TIMEOUT,
                )))
            }
            "api" => Ok(Arc::new(ApiExecutor::new(
                server.hostname.clone(),
                port_or(server.port, DEFAULT_API_PORT),
                username.unwrap_or_default(),
                server.api_base_url.clone(),
                server
                    .api_auth_type
                    .clone()
                    .unwrap_or_else(|| "none".to_string()),
                server.api_auth_header.clone(),
                credentials.api_token,
                server.api_verify_ssl,
                server.api_timeout_seconds.max(1) as u64,
                headers_from_json(&server.api_default_headers),
            ))),
            other => Err(FactoryError::UnsupportedProtocol(other.to_string())),
        }
    }

    /// API executor for a step-level credential profile.
    pub fn api_executor_from_profile(
        &self,
        profile: &ApiCredentialProfile,
    ) -> Result<Arc<dyn Executor>, FactoryError> {
        if !profile.enabled {
            return Err(FactoryError::ProfileDisabled(profile.name.clone()));
        }
        let token = self
            .vault
            .decrypt_opt(profile.token_encrypted.as_deref(), "api_token", &profile.name);
        Ok(Arc::new(ApiExecutor::new(
            profile.name.clone(),
            DEFAULT_API_PORT,
            profile.username.clone().unwrap_or_default(),
            Some(profile.base_url.clone()),
            profile.auth_type.clone(),
            profile.auth_header.clone(),
            token,
            profile.verify_ssl,
            profile.timeout_seconds.max(1) as u64,
            headers_from_json(&profile.default_headers),
        )))
    }

    /// Pool lookup by `(hostname, port)`, reconnecting and replacing stale
    /// entries.
    pub async fn pooled_executor(
        &self,
        server: &ServerCredential,
        profile: Option<&CredentialProfile>,
    ) -> Result<Arc<dyn Executor>, FactoryError> {
        let key = format!(
            "{}:{}",
            server.hostname,
            port_or(server.port, DEFAULT_SSH_PORT)
        );

        if let Some(entry) = self.pool.get(&key) {
            let executor = entry.value().clone();
            drop(entry);
            if executor.is_connected().await {
                return Ok(executor);
            }
            self.pool.remove(&key);
        }

        let executor = self.executor_for(server, profile)?;
        if let Err(err) = executor.connect().await {
            warn!(?err, host = %server.hostname, "pooled connect failed");
        } else {
            self.pool.insert(key, executor.clone());
        }
        Ok(executor)
    }

    /// Evict a pooled executor after a transport error.
    pub fn evict(&self, hostname: &str, port: Option<i32>) {
        let key = format!("{hostname}:{}", port_or(port, DEFAULT_SSH_PORT));
        self.pool.remove(&key);
    }

    pub async fn close_all(&self) {
        let keys: Vec<String> = self.pool.iter().map(|entry| entry.key().clone()).collect();
        for key in keys {
            if let Some((_, executor)) = self.pool.remove(&key) {
                executor.disconnect().await;
            }
        }
    }

    fn decrypt_credentials(
        &self,
        server: &ServerCredential,
        profile: Option<&CredentialProfile>,
    ) -> DecryptedCredentials {
        let mut credentials = DecryptedCredentials {
            password: self.vault.decrypt_opt(
                server.password_encrypted.as_deref(),
                "password",
                &server.hostname,
            ),
            private_key: self.vault.decrypt_opt(
                server.ssh_key_encrypted.as_deref(),
                "ssh_key",
                &server.hostname,
            ),
            sudo_password: self.vault.decrypt_opt(
                server.sudo_password_encrypted.as_deref(),
                "sudo_password",
                &server.hostname,
            ),
            api_token: self.vault.decrypt_opt(
                server.api_token_encrypted.as_deref(),
                "api_token",
                &server.hostname,
            ),
            username_override: None,
        };

        if server.credential_source == "shared_profile" {
            match profile {
                Some(profile) => {
                    let secret = self.vault.decrypt_opt(
                        profile.secret_encrypted.as_deref(),
                        "shared_secret",
                        &server.hostname,
                    );
                    match secret {
                        Some(secret) if profile.credential_type == "key" => {
                            if credentials.private_key.is_none() {
                                credentials.private_key = Some(secret);
                            }
                        }
                        Some(secret) => {
                            if credentials.password.is_none() {
                                credentials.password = Some(secret);
                                if server.username.is_none() {
                                    credentials.username_override = profile.username.clone();
                                }
                            }
                        }
                        None => {
                            warn!(profile = %profile.name, host = %server.hostname, "shared profile has no usable secret")
                        }
                    }
                }
                None => {
                    warn!(host = %server.hostname, "server references a shared profile that was not loaded")
                }
            }
        }

        credentials
    }

    /// Probe a server: run a trivial command (or an API reachability check)
    /// and fold server info into the output.
    pub async fn test_server_connection(
        &self,
        server: &ServerCredential,
        profile: Option<&CredentialProfile>,
    ) -> ExecutionResult {
        let executor = match self.executor_for(server, profile) {
            Ok(executor) => executor,
            Err(err) => {
                return ExecutionResult::failure(
                    "connection_test",
                    &server.hostname,
                    ErrorType::Unknown,
                    err.to_string(),
                    false,
                    0,
                );
            }
        };

        if let Err(err) = executor.connect().await {
            return ExecutionResult::failure(
                "connection_test",
                &server.hostname,
                ErrorType::Connection,
                err.to_string(),
                true,
                0,
            );
        }

        let result = if server.protocol == "api" {
            if executor.test_connection().await {
                let mut result = ExecutionResult::failure(
                    "connection_test",
                    &server.hostname,
                    ErrorType::Unknown,
                    "",
                    false,
                    0,
                );
                result.success = true;
                result.exit_code = 0;
                result.error_type = None;
                result.error_message = None;
                result.stderr = String::new();
                result.stdout = "API connection successful".to_string();
                result
            } else {
                ExecutionResult::failure(
                    "connection_test",
                    &server.hostname,
                    ErrorType::Connection,
                    "Unable to connect to API",
                    true,
                    0,
                )
            }
        } else {
            let mut request = ExecRequest::default();
            request.timeout_seconds = Some(30);
            let mut result = executor
                .execute("echo 'Connection test successful'", &request)
                .await;
            if result.success {
                let info = executor.server_info().await;
                result.stdout = format!(
                    "Connection successful\nOS: {}\nKernel: {}\nArch: {}",
                    info.os_version.unwrap_or_else(|| info.os_type.clone()),
                    info.kernel_version.unwrap_or_else(|| "N/A".to_string()),
                    info.architecture.unwrap_or_else(|| "N/A".to_string()),
                );
            }
            result
        };

        executor.disconnect().await;
        result
    }

    /// Probe many servers with bounded concurrency.
    pub async fn test_all_servers(
        &self,
        servers: &[(ServerCredential, Option<CredentialProfile>)],
    ) -> HashMap<String, ExecutionResult> {
        let semaphore = Arc::new(Semaphore::new(FANOUT_CONCURRENCY));
        let probes = servers.iter().map(|(server, profile)| {
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore.acquire().await;
                let result = self.test_server_connection(server, profile.as_ref()).await;
                (server.hostname.clone(), result)
            }
        });
        join_all(probes).await.into_iter().collect()
    }

    /// One-shot command helper for ad-hoc operator actions.
    pub async fn execute_command(
        &self,
        server: &ServerCredential,
        profile: Option<&CredentialProfile>,
        command: &str,
        timeout_seconds: u64,
        use_sudo: bool,
    ) -> ExecutionResult {
        let executor = match self.executor_for(server, profile) {
            Ok(executor) => executor,
            Err(err) => {
                return ExecutionResult::failure(
                    command,
                    &server.hostname,
                    ErrorType::Unknown,
                    err.to_string(),
                    false,
                    0,
                );
            }
        };

        if let Err(err) = executor.connect().await {
            return ExecutionResult::failure(
                command,
                &server.hostname,
                ErrorType::Connection,
                err.to_string(),
                true,
                0,
            );
        }

        let mut request = ExecRequest::default();
        request.timeout_seconds = Some(timeout_seconds);
        request.with_elevation = use_sudo;
        let result = executor.execute(command, &request).await;
        executor.disconnect().await;
        info!(host = %server.hostname, success = result.success, "ad-hoc command finished");
        result
    }
}

fn port_or(port: Option<i32>, default: u16) -> u16 {
    port.and_then(|value| u16::try_from(value).ok())
        .unwrap_or(default)
}

fn headers_from_json(headers: &Value) -> HashMap<String, String> {
    headers
        .as_object()
        .map(|map| {
            map.iter()
                .filter_map(|(key, value)| {
                    value
                        .as_str()
                        .map(|text| (key.clone(), text.to_string()))
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn vault() -> SecretVault {
        SecretVault::new(&hex::encode([1u8; 32])).expect("vault")
    }

    fn server(protocol: &str, port: Option<i32>) -> ServerCredential {
        ServerCredential {
            id: Uuid::new_v4(),
            name: "edge-1".into(),
            hostname: "edge-1.internal".into(),
            port,
            protocol: protocol.into(),
            os_type: (if protocol == "winrm" { "windows" } else { "linux" }).into(),
            environment: Some("staging".into()),
            username: None,
            password_encrypted: None,
            ssh_key_encrypted: None,
            sudo_password_encrypted: None,
            api_token_encrypted: None,
            credential_source: "inline".into(),
            credential_profile_id: None,
            winrm_transport: None,
            winrm_use_ssl: None,
            winrm_cert_validation: false,
            api_base_url: None,
            api_auth_type: None,
            api_auth_header: None,
            api_verify_ssl: true,
            api_timeout_seconds: 30,
            api_default_headers: serde_json::json!({}),
            enabled: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn selects_executor_by_protocol() {
        let factory = ExecutorFactory::new(vault());
        assert_eq!(
            factory.executor_for(&server("ssh", None), None).unwrap().protocol(),
            "ssh"
        );
        assert_eq!(
            factory
                .executor_for(&server("winrm", Some(5985)), None)
                .unwrap()
                .protocol(),
            "winrm"
        );
        assert_eq!(
            factory.executor_for(&server("api", None), None).unwrap().protocol(),
            "api"
        );
        assert!(matches!(
            factory.executor_for(&server("telnet", None), None),
            Err(FactoryError::UnsupportedProtocol(_))
        ));
    }

    #[test]
    fn decrypts_inline_credentials() {
        let vault = vault();
        let factory = ExecutorFactory::new(vault.clone());
        let mut record = server("ssh", None);
        record.password_encrypted = Some(vault.encrypt("hunter2").unwrap());
        let credentials = factory.decrypt_credentials(&record, None);
        assert_eq!(credentials.password.as_deref(), Some("hunter2"));
    }

    #[test]
    fn shared_profile_fills_empty_slots() {
        let vault = vault();
        let factory = ExecutorFactory::new(vault.clone());
        let mut record = server("ssh", None);
        record.credential_source = "shared_profile".into();
        let profile = CredentialProfile {
            id: Uuid::new_v4(),
            name: "linux-fleet".into(),
            credential_type: "password".into(),
            username: Some("svc-remedy".into()),
            secret_encrypted: Some(vault.encrypt("fleet-pass").unwrap()),
            enabled: true,
        };
        let credentials = factory.decrypt_credentials(&record, Some(&profile));
        assert_eq!(credentials.password.as_deref(), Some("fleet-pass"));
        assert_eq!(credentials.username_override.as_deref(), Some("svc-remedy"));
    }

    #[test]
    fn inline_credentials_win_over_profile() {
        let vault = vault();
        let factory = ExecutorFactory::new(vault.clone());
        let mut record = server("ssh", None);
        record.credential_source = "shared_profile".into();
        record.password_encrypted = Some(vault.encrypt("inline-pass").unwrap());
        let profile = CredentialProfile {
            id: Uuid::new_v4(),
            name: "linux-fleet".into(),
            credential_type: "password".into(),
            username: Some("svc-remedy".into()),
            secret_encrypted: Some(vault.encrypt("fleet-pass").unwrap()),
            enabled: true,
        };
        let credentials = factory.decrypt_credentials(&record, Some(&profile));
        assert_eq!(credentials.password.as_deref(), Some("inline-pass"));
        assert_eq!(credentials.username_override, None);
    }

    #[test]
    fn disabled_api_profile_is_rejected() {
        let factory = ExecutorFactory::new(vault());
        let profile = ApiCredentialProfile {
            id: Uuid::new_v4(),
            name: "awx".into(),
            base_url: "https://awx.internal/api".into(),
            auth_type: "bearer".into(),
            auth_header: None,
            username: None,
            token_encrypted: None,
            verify_ssl: true,
            timeout_seconds: 30,
            default_headers: serde_json::json!({}),
            enabled: false,
        };
        assert!(matches!(
            factory.api_executor_from_profile(&profile),
            Err(FactoryError::ProfileDisabled(_))
        ));
    }
}
