mod build;
mod chart;
mod cli;
mod dashboard;
mod download;
mod error;
mod index;
mod inspect;
mod model;
mod query;
mod server;
mod storage;

use anyhow::Context;
use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let args = cli::Args::parse();

    match args.cmd {
        cli::Command::Build(cmd) => build::run(cmd).await.context("build failed"),
        cli::Command::Serve(cmd) => server::run(cmd).await.context("serve failed"),
        cli::Command::Map(cmd) => inspect::map(cmd).context("map failed"),
        cli::Command::Series(cmd) => inspect::series(cmd).context("series failed"),
    }
}
