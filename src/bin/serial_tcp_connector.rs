use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use dockserver_gateway::cli::ConnectorArgs;
use dockserver_gateway::config;
use dockserver_gateway::supervisor;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .try_init()
        .ok();

    let args = ConnectorArgs::parse();
    let config = match config::load(&args) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "failed to load configuration");
            return ExitCode::from(4);
        }
    };

    let code = supervisor::run(&config);
    ExitCode::from(code as u8)
}
