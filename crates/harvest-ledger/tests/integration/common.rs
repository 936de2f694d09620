use std::time::Duration;

use harvest_core::config::RunConfig;
use harvest_core::retry::RetryPolicy;
use harvest_ledger::Database;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use testcontainers::core::{ContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};

/// Spins up a PostgreSQL container, runs the workspace migrations and
/// returns a connected pool.
///
/// Keep the `ContainerAsync` in scope for the whole test; dropping it stops
/// the container.
pub async fn setup_test_db() -> (PgPool, ContainerAsync<GenericImage>) {
    let container = GenericImage::new("postgres", "16")
        .with_exposed_port(ContainerPort::Tcp(5432))
        .with_wait_for(WaitFor::message_on_stderr(
            "database system is ready to accept connections",
        ))
        .with_env_var("POSTGRES_PASSWORD", "postgres")
        .with_env_var("POSTGRES_DB", "harvest_test")
        .start()
        .await
        .expect("Failed to start PostgreSQL container");

    let host = container.get_host().await.expect("Failed to get host");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("Failed to get port");

    let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/harvest_test");

    // The port can open before the server accepts logins.
    const MAX_RETRIES: u32 = 30;
    let mut retries = 0;
    let pool = loop {
        match PgPoolOptions::new()
            .max_connections(5)
            .connect(&connection_string)
            .await
        {
            Ok(pool) => break pool,
            Err(e) => {
                retries += 1;
                if retries >= MAX_RETRIES {
                    panic!("Failed to connect to database after {MAX_RETRIES} retries: {e}");
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    };

    Database::from_pool(pool.clone())
        .migrate()
        .await
        .expect("Failed to run migrations");

    (pool, container)
}

/// Run settings with no pacing and millisecond backoff.
pub fn fast_config() -> RunConfig {
    let fast = RetryPolicy::new(2)
        .with_base_delay(Duration::from_millis(1))
        .with_max_delay(Duration::from_millis(5));
    RunConfig::default()
        .with_run_id("integration")
        .with_inter_item_delay(Duration::ZERO)
        .with_retry(fast.clone())
        .with_sink_retry(fast)
        .with_circuit_breaker(None)
}

/// Write an input CSV with `rows` items under `dir`.
pub fn write_input(dir: &std::path::Path, rows: u64) -> std::path::PathBuf {
    let path = dir.join("input.csv");
    let mut text = String::from("platform,url,account\n");
    for i in 0..rows {
        text.push_str(&format!("Generic,https://example.com/{i},\n"));
    }
    std::fs::write(&path, text).expect("Failed to write input CSV");
    path
}
