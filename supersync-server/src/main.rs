use anyhow::Result;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    supersync_server::run_with_cli(supersync_server::cli::Cli::parse()).await
}
