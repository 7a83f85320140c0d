// src/main.rs

use stepflow::config::load_or_default;
use stepflow::{cli, logging, run};

#[tokio::main]
async fn main() {
    if let Err(err) = run_main().await {
        eprintln!("stepflow error: {err:?}");
        std::process::exit(1);
    }
}

async fn run_main() -> anyhow::Result<()> {
    let args = cli::parse();
    let cfg = load_or_default(args.config.as_deref())?;
    logging::init_logging(args.log_level, cfg.log.level.as_deref())?;
    run(args, cfg).await
}
