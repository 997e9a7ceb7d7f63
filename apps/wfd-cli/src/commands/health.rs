use anyhow::{bail, Result};
use clap::Args;
use wfd_core::client::RuntimeClient;

use super::{print_json, GlobalOpts};

#[derive(Args, Clone, Debug)]
pub struct HealthArgs {
    /// Pretty-print JSON
    #[arg(long)]
    pub pretty: bool,
}

pub async fn execute(global: &GlobalOpts, args: &HealthArgs) -> Result<()> {
    let cfg = global.dispatch_config()?;
    let client = RuntimeClient::new(&cfg)?;
    let report = client.probe().await;
    print_json(&report, args.pretty)?;
    if !report.is_healthy() {
        bail!("runtime at {} is {}", cfg.base(), report.state.as_str());
    }
    Ok(())
}
