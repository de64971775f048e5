//! Throwaway Postgres databases for integration tests.
//!
//! Every test gets its own database, created from the admin connection in
//! `TEST_ADMIN_DATABASE_URL` (read from the environment or `.env`) and
//! migrated with the razorbus schema. The database is dropped when the test
//! body returns `Ok`; it is kept after an error, a panic, or when
//! `TEST_KEEP_DB` is set, so a failing run can be inspected.

use std::{future::Future, pin::Pin};

use anyhow::{Context, Result};
use sqlx::{Connection, Executor, PgConnection, PgPool, postgres::PgPoolOptions};
use url::Url;
use uuid::Uuid;

const NAME_PREFIX: &str = "razorbus_";
/// Postgres truncates identifiers beyond this many bytes.
const MAX_IDENTIFIER: usize = 63;

/// Run `f` against a freshly created and migrated database.
pub async fn with_test_db<F, T>(test_name: &str, f: F) -> Result<T>
where
    F: for<'a> FnOnce(&'a PgPool) -> Pin<Box<dyn Future<Output = Result<T>> + 'a>>,
{
    dotenvy::from_filename(".env").ok();
    let admin_url = std::env::var("TEST_ADMIN_DATABASE_URL")
        .context("TEST_ADMIN_DATABASE_URL must point at a database with CREATEDB rights")?;

    let mut admin = PgConnection::connect(&admin_url).await?;
    let db_name = database_name(test_name);
    admin
        .execute(format!(r#"CREATE DATABASE "{db_name}""#).as_str())
        .await?;

    let mut db_url = Url::parse(&admin_url)?;
    db_url.set_path(&format!("/{db_name}"));
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(db_url.as_str())
        .await?;

    // Relative to this crate's manifest directory.
    sqlx::migrate!("../razorbus/migrations").run(&pool).await?;

    let result = f(&pool).await;
    pool.close().await;

    if result.is_err() || std::env::var_os("TEST_KEEP_DB").is_some() {
        eprintln!("[with_test_db] keeping database {db_name}");
        return result;
    }

    let drop = format!(r#"DROP DATABASE IF EXISTS "{db_name}" WITH (FORCE)"#);
    if let Err(e) = admin.execute(drop.as_str()).await {
        eprintln!("[with_test_db] failed to drop database {db_name}: {e}");
    }
    result
}

/// `razorbus_<sanitized test name>_<uuid>`, cut to fit an identifier.
fn database_name(test_name: &str) -> String {
    let suffix = Uuid::now_v7().simple().to_string();
    let budget = MAX_IDENTIFIER - NAME_PREFIX.len() - suffix.len() - 1;

    let sanitized: String = test_name
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    let mut stem = sanitized.trim_matches('_').to_owned();
    stem.truncate(budget);

    format!("{NAME_PREFIX}{stem}_{suffix}")
}

/// Define an async test that runs against its own database.
///
/// Expands to a `#[tokio::test]` returning `anyhow::Result<()>`, so the
/// calling crate needs `tokio` (with `macros` and `rt-multi-thread`) and
/// `anyhow` among its dev-dependencies.
///
/// ```ignore
/// use test_utils::db_test;
///
/// db_test!(claim_skips_locked_rows, |pool| {
///     let store = PgStore::new(pool.clone());
///     assert!(store.claim("w1", LOCK).await?.is_none());
///     Ok(())
/// });
/// ```
#[macro_export]
macro_rules! db_test {
    ($name:ident, |$pool:ident| $body:block) => {
        #[tokio::test(flavor = "multi_thread")]
        async fn $name() -> anyhow::Result<()> {
            $crate::db::with_test_db(stringify!($name), |$pool| {
                Box::pin(async move { $body })
            })
            .await
        }
    };
}
