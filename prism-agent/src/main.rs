//! Prism Agent Binary Entry Point

use clap::Parser;
use prism_agent::{init_logging, load_adapter_config, run_agent, Args};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args.log_level)?;

    let config = load_adapter_config(&args)?;

    tokio::select! {
        result = run_agent(args, config) => {
            if let Err(e) = result {
                tracing::error!("Replay failed: {}", e);
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
             tracing::info!("Shutdown signal received, stopping replay...");
        }
    }

    Ok(())
}
