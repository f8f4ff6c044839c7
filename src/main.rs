mod agent;
mod blackboard;
mod cli;
mod config;
mod errors;
mod mailbox;
mod providers;
mod registry;
mod tap;
mod utils;

use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".parse().unwrap());
    // TAP mode owns stdout for the event stream; diagnostics go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli::run().await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("fatal: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
