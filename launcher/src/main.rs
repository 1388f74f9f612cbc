//! Shim binary that calls into the `launcher_core` library's `inner_main`.
use clap::Parser as _;
use eyre::Result;

#[tokio::main]
async fn main() -> Result<()> {
    // Delegate to library entrypoint
    launcher_core::inner_main(launcher_core::cli::Cli::parse()).await
}
