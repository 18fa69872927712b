//! Pool lifecycle example.
//!
//! Loads the pool configuration, verifies the principal database at startup,
//! prints a health report, and closes every pool on Ctrl-C or SIGTERM.
//!
//! # Running
//!
//! ```bash
//! export HISDB_CONFIG=config/database.yaml
//! export DB_HOST=localhost
//! export DB_USER=sa
//! export DB_PASSWORD=YourStrong@Passw0rd
//!
//! cargo run -p hisdb-pool --features tds --example pool_lifecycle
//! ```

// Allow common patterns in example code
#![allow(clippy::unwrap_used, clippy::expect_used)]

use hisdb_pool::shutdown::DEFAULT_SHUTDOWN_TIMEOUT;
use hisdb_pool::tds::TdsConnector;
use hisdb_pool::{
    ConfigLoader, HealthChecker, ManagerCell, PRINCIPAL, PoolManager, SECUNDARIA,
    ShutdownOutcome, SqlPoolFactory, close_within, wait_for_signal,
};

static MANAGER: ManagerCell<SqlPoolFactory<TdsConnector>> = ManagerCell::new();

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let loader = ConfigLoader::from_path("${HISDB_CONFIG}");
    let manager = MANAGER.get_or_init(|| {
        let factory = SqlPoolFactory::new(TdsConnector::new()).application_name("hisdb-admin");
        PoolManager::from_loader(&loader, factory)
    })?;

    println!("=== Pool Lifecycle Example ===\n");
    println!("Configured pools: {:?}", manager.pool_names().collect::<Vec<_>>());

    // The service refuses to start without its principal database.
    manager.warm_up([PRINCIPAL]).await?;

    {
        let principal = manager.get_pool(PRINCIPAL).await?;
        let mut conn = principal.get().await?;
        conn.client().simple_query("SELECT 1").await?;
        println!("principal: {:?}", principal.status());
    }

    // The secondary database is optional; report instead of failing.
    if let Err(e) = manager.get_pool(SECUNDARIA).await {
        println!("secundaria unavailable: {e}");
    }

    let report = HealthChecker::default().check(&manager).await;
    println!(
        "\nHealth ({}): {}",
        report.http_status(),
        serde_json::to_string_pretty(&report)?
    );

    println!("\nWaiting for Ctrl-C...");
    wait_for_signal().await?;

    match close_within(&manager, DEFAULT_SHUTDOWN_TIMEOUT).await {
        ShutdownOutcome::Clean => println!("All pools closed"),
        ShutdownOutcome::PartialFailure(e) => println!("Closed with errors: {e}"),
        ShutdownOutcome::TimedOut(d) => println!("Gave up closing after {d:?}"),
    }

    Ok(())
}
