use anyhow::Result;
use clap::{Args, Subcommand};
use serde_json::json;
use wfd_core::config_schema_json;

use super::{print_json, GlobalOpts};

#[derive(Subcommand, Clone, Debug)]
pub enum ConfigCmd {
    /// Print the JSON schema of the configuration file
    Schema(PrettyArgs),
    /// Load and validate the configuration, then print the effective values
    Check(PrettyArgs),
}

#[derive(Args, Clone, Debug)]
pub struct PrettyArgs {
    /// Pretty-print JSON
    #[arg(long)]
    pub pretty: bool,
}

pub fn execute(global: &GlobalOpts, cmd: ConfigCmd) -> Result<()> {
    match cmd {
        ConfigCmd::Schema(args) => print_json(&config_schema_json(), args.pretty),
        ConfigCmd::Check(args) => {
            let cfg = global.dispatch_config()?;
            let summary = json!({
                "base_url": cfg.base(),
                "api_key": cfg.api_key.as_ref().map(|_| "<redacted>"),
                "workflows": cfg.workflows,
                "timeout_ms": cfg.default_timeout.as_millis() as u64,
                "max_retries": cfg.max_retries,
                "retry_delay_ms": cfg.retry_delay.as_millis() as u64,
                "workers": cfg.worker_count,
                "queue_capacity": cfg.queue_capacity,
                "batch_size": cfg.batch_size,
                "health_interval_ms": cfg.health_interval.as_millis() as u64,
                "health_timeout_ms": cfg.health_timeout.as_millis() as u64,
                "verbose": cfg.verbose,
            });
            print_json(&summary, args.pretty)
        }
    }
}
