use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::{Executor, PgPool, Postgres};
use uuid::Uuid;

// key: server-db -> target credential records
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ServerCredential {
    pub id: Uuid,
    pub name: String,
    pub hostname: String,
    pub port: Option<i32>,
    pub protocol: String,
    pub os_type: String,
    pub environment: Option<String>,
    pub username: Option<String>,
    pub password_encrypted: Option<String>,
    pub ssh_key_encrypted: Option<String>,
    pub sudo_password_encrypted: Option<String>,
    pub api_token_encrypted: Option<String>,
    pub credential_source: String,
    pub credential_profile_id: Option<Uuid>,
    pub winrm_transport: Option<String>,
    pub winrm_use_ssl: Option<bool>,
    pub winrm_cert_validation: bool,
    pub api_base_url: Option<String>,
    pub api_auth_type: Option<String>,
    pub api_auth_header: Option<String>,
    pub api_verify_ssl: bool,
    pub api_timeout_seconds: i32,
    pub api_default_headers: Value,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct CredentialProfile {
    pub id: Uuid,
    pub name: String,
    pub credential_type: String,
    pub username: Option<String>,
    pub secret_encrypted: Option<String>,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ApiCredentialProfile {
    pub id: Uuid,
    pub name: String,
    pub base_url: String,
    pub auth_type: String,
    pub auth_header: Option<String>,
    pub username: Option<String>,
    pub token_encrypted: Option<String>,
    pub verify_ssl: bool,
    pub timeout_seconds: i32,
    pub default_headers: Value,
    pub enabled: bool,
}

const SERVER_COLUMNS: &str = "id, name, hostname, port, protocol, os_type, environment, username, \
     password_encrypted, ssh_key_encrypted, sudo_password_encrypted, api_token_encrypted, \
     credential_source, credential_profile_id, winrm_transport, winrm_use_ssl, \
     winrm_cert_validation, api_base_url, api_auth_type, api_auth_header, api_verify_ssl, \
     api_timeout_seconds, api_default_headers, enabled, created_at, updated_at";

pub async fn get_server<'c, E>(
    executor: E,
    server_id: Uuid,
) -> Result<Option<ServerCredential>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, ServerCredential>(&format!(
        "SELECT {SERVER_COLUMNS} FROM server_credentials WHERE id = $1"
    ))
    .bind(server_id)
    .fetch_optional(executor)
    .await
}

/// Target resolution from an alert label: the label value may be a server
/// name or a bare hostname.
pub async fn find_server_by_name_or_hostname<'c, E>(
    executor: E,
    identifier: &str,
) -> Result<Option<ServerCredential>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, ServerCredential>(&format!(
        "SELECT {SERVER_COLUMNS} FROM server_credentials \
         WHERE name = $1 OR hostname = $1 \
         ORDER BY created_at \
         LIMIT 1"
    ))
    .bind(identifier)
    .fetch_optional(executor)
    .await
}

pub async fn list_enabled_servers(pool: &PgPool) -> Result<Vec<ServerCredential>, sqlx::Error> {
    sqlx::query_as::<_, ServerCredential>(&format!(
        "SELECT {SERVER_COLUMNS} FROM server_credentials WHERE enabled ORDER BY name"
    ))
    .fetch_all(pool)
    .await
}

pub async fn get_credential_profile<'c, E>(
    executor: E,
    profile_id: Uuid,
) -> Result<Option<CredentialProfile>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, CredentialProfile>(
        "SELECT id, name, credential_type, username, secret_encrypted, enabled \
         FROM credential_profiles WHERE id = $1",
    )
    .bind(profile_id)
    .fetch_optional(executor)
    .await
}

pub async fn get_api_credential_profile<'c, E>(
    executor: E,
    profile_id: Uuid,
) -> Result<Option<ApiCredentialProfile>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, ApiCredentialProfile>(
        "SELECT id, name, base_url, auth_type, auth_header, username, token_encrypted, \
         verify_ssl, timeout_seconds, default_headers, enabled \
         FROM api_credential_profiles WHERE id = $1",
    )
    .bind(profile_id)
    .fetch_optional(executor)
    .await
}
