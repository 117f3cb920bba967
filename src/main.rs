#![recursion_limit = "256"]

use clap::Parser;
use tracing_subscriber::EnvFilter;
use weed_watcher_lib::cli::Cli;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("weed_watcher_lib=info".parse()?))
        .init();

    Cli::parse().run()
}
