//! CLI entry point for msgr.

use clap::Parser;
use msgr_cli::CliConfig;

fn main() -> anyhow::Result<()> {
    let config = CliConfig::parse();
    config.run()
}
