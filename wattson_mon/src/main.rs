pub mod args;
pub mod commands;

use anyhow::Result;
use args::{Args, Commands};
use clap::Parser;
use wattson_library::bail_error;
use wattson_library::logging::start_tracing;
use wattson_library::monitor_config::MonitorConfig;
use wattson_library::transaction::{gen_tid, TransactionId, STARTUP_TID};

async fn run(cli: Args) -> Result<i32> {
    let config = MonitorConfig::boxed(cli.config.as_deref(), Some(cli.overrides))?;
    let _guard = start_tracing(&config.logging, &STARTUP_TID)?;
    let tid: &TransactionId = &gen_tid();
    match cli.command {
        Commands::Monitor(args) => commands::monitor(config, args, tid).await,
        Commands::Sensors => commands::sensors(config, tid).map(|_| 0),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = match Args::try_parse() {
        Ok(arg) => arg,
        Err(e) => e.exit(),
    };
    let tid: &TransactionId = &STARTUP_TID;
    let code = match run(cli).await {
        Ok(c) => c,
        Err(e) => bail_error!(tid=tid, error=%e, "Command failed"),
    };
    std::process::exit(code)
}
