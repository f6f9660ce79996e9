use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use dockserver_gateway::cli::DecompressorArgs;
use dockserver_gateway::decompress::FileWatcherPipeline;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .try_init()
        .ok();

    let args = DecompressorArgs::parse();
    let pipeline = FileWatcherPipeline::new(args.directory);

    match pipeline.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "file watcher pipeline failed");
            ExitCode::FAILURE
        }
    }
}
