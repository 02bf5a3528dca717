//! Command-line configuration and logging setup.

use crate::commands::Command;
use anyhow::Context;
use clap::Parser;
use msgr_core::MessengerConfig;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "msgr")]
#[command(about = "Exercise peer messengers over an in-process network")]
pub struct CliConfig {
    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,

    /// JSON messenger configuration (priority and policies)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

impl CliConfig {
    pub fn run(&self) -> anyhow::Result<()> {
        self.init_tracing()?;
        let messenger_config = self.messenger_config()?;
        let result = self.command.execute(&messenger_config)?;
        if self.json {
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else {
            print!("{}", result);
        }
        Ok(())
    }

    /// Messenger settings from `--config`, or defaults.
    pub fn messenger_config(&self) -> anyhow::Result<MessengerConfig> {
        match &self.config {
            Some(path) => MessengerConfig::from_json_file(path)
                .with_context(|| format!("loading {}", path.display())),
            None => Ok(MessengerConfig::default()),
        }
    }

    fn init_tracing(&self) -> anyhow::Result<()> {
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.log_level))
            .context("invalid log filter")?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_thread_names(true)
            .try_init()
            .map_err(|e| anyhow::anyhow!(e))
    }
}
