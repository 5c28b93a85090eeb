use once_cell::sync::Lazy;

/// Symmetric key for the credential vault. Must be set via `ENCRYPTION_KEY`
/// (32 bytes, base64 or hex encoded).
pub static ENCRYPTION_KEY: Lazy<String> =
    Lazy::new(|| std::env::var("ENCRYPTION_KEY").expect("ENCRYPTION_KEY must be set"));

/// Seconds between execution worker polls. Defaults to 5.
pub static WORKER_POLL_INTERVAL_SECS: Lazy<u64> = Lazy::new(|| {
    std::env::var("WORKER_POLL_INTERVAL_SECS")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(5)
});

/// Maximum executions claimed per worker poll. Defaults to 5.
pub static WORKER_BATCH_SIZE: Lazy<i64> = Lazy::new(|| {
    std::env::var("WORKER_BATCH_SIZE")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(5)
});

/// Seconds between scheduler ticks. Defaults to 30.
pub static SCHEDULER_TICK_SECS: Lazy<u64> = Lazy::new(|| {
    std::env::var("SCHEDULER_TICK_SECS")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(30)
});

/// Dimension of alert/runbook embeddings. Defaults to 1536.
pub static EMBEDDING_DIMENSION: Lazy<usize> = Lazy::new(|| {
    std::env::var("EMBEDDING_DIMENSION")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(1536)
});

/// Continue past failed migrations when set. Defaults to false.
pub static ALLOW_MIGRATION_FAILURE: Lazy<bool> = Lazy::new(|| {
    std::env::var("ALLOW_MIGRATION_FAILURE")
        .map(|value| value == "true" || value == "1")
        .unwrap_or(false)
});
