use std::future::Future;
use std::time::Duration;

use anyhow::{Result, anyhow};
use razorbus::{Command, NewCommand, RetryPolicy, RuntimeConfig, Store, UnitOfWork};
use serde_json::json;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(20);
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Initialize tracing for tests. Safe to call multiple times.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("razorbus=debug")
        .with_test_writer()
        .try_init();
}

/// Fast runtime config for tests: short polls and millisecond backoff.
pub fn test_runtime_config() -> RuntimeConfig {
    RuntimeConfig {
        poll_interval: DEFAULT_POLL_INTERVAL,
        lock_duration: Duration::from_secs(30),
        shutdown_timeout: Duration::from_secs(5),
        retry_policy: RetryPolicy {
            base_delay: Duration::from_millis(5),
            ..Default::default()
        },
        worker_id: Some("test-worker".into()),
        ..Default::default()
    }
}

/// Create and commit a pending command.
pub async fn create_command<S: Store>(store: &S, name: &str) -> Result<Command> {
    let mut uow = store.begin().await?;
    let command = uow
        .create_command(NewCommand::new(name, json!({ "name": name })).submitted_by("tests"))
        .await?;
    uow.commit().await?;
    Ok(command)
}

/// Poll until condition returns Some(T) or timeout expires.
pub async fn wait_until<F, Fut, T>(timeout: Duration, check: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        if let Some(result) = check().await? {
            return Ok(result);
        }

        if tokio::time::Instant::now() > deadline {
            return Err(anyhow!("timeout waiting for condition"));
        }

        tokio::time::sleep(DEFAULT_POLL_INTERVAL).await;
    }
}
