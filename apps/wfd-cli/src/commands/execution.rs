use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use serde_json::json;
use wfd_core::client::RuntimeClient;

use super::{print_json, GlobalOpts};

#[derive(Subcommand, Clone, Debug)]
pub enum ExecutionCmd {
    /// Fetch an execution document from the runtime
    Status(ExecutionArgs),
    /// Ask the runtime to stop an execution
    Stop(ExecutionArgs),
}

#[derive(Args, Clone, Debug)]
pub struct ExecutionArgs {
    /// Runtime execution id
    pub id: String,
    /// Pretty-print JSON
    #[arg(long)]
    pub pretty: bool,
}

pub async fn execute(global: &GlobalOpts, cmd: ExecutionCmd) -> Result<()> {
    let cfg = global.dispatch_config()?;
    let client = RuntimeClient::new(&cfg)?;
    match cmd {
        ExecutionCmd::Status(args) => {
            let doc = client
                .execution_status(&args.id)
                .await
                .with_context(|| format!("fetching execution {}", args.id))?;
            print_json(&doc, args.pretty)
        }
        ExecutionCmd::Stop(args) => {
            client
                .stop_execution(&args.id)
                .await
                .with_context(|| format!("stopping execution {}", args.id))?;
            print_json(&json!({"id": args.id, "stopped": true}), args.pretty)
        }
    }
}
