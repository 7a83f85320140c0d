pub mod builders;
pub mod fake_runner;

use std::path::Path;
use std::sync::Once;
use std::time::Duration;

use stepflow::engine::EngineConfig;
use tracing_subscriber::{EnvFilter, fmt};

static INIT: Once = Once::new();

/// Initialise tracing for tests.
///
/// - Uses `with_test_writer()`, so logs are captured per-test.
/// - The Rust test harness only prints captured output for **failing** tests
///   (unless you run with `-- --nocapture`).
///
/// Enable levels with e.g.:
/// `RUST_LOG=debug cargo test`
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        fmt()
            .with_env_filter(filter)
            .with_test_writer() // print only for failing tests unless --nocapture
            .with_target(true)
            .init();
    });
}

/// Run a future with a 10-second timeout.
#[allow(dead_code)]
pub async fn with_timeout<F, T>(f: F) -> T
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(Duration::from_secs(10), f)
        .await
        .expect("Test timed out after 10 seconds")
}

/// Engine settings suitable for tests: small pool, short timeouts, all
/// directories under `root`.
pub fn test_engine_config(root: &Path) -> EngineConfig {
    EngineConfig {
        pool_size: 2,
        exec_timeout: Duration::from_secs(30),
        key_expire: Duration::from_secs(120),
        root_dir: root.to_path_buf(),
        max_parallel_steps: None,
        sweep_interval: Duration::from_secs(1),
    }
}
