use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;
use wfd_core::{load_settings, DispatchConfig, Settings};

pub mod config;
pub mod execution;
pub mod health;
pub mod run;

pub use config::ConfigCmd;
pub use execution::ExecutionCmd;
pub use health::HealthArgs;
pub use run::RunArgs;

#[derive(Args, Clone, Debug)]
pub struct GlobalOpts {
    /// TOML configuration file; falls back to WFD_CONFIG env
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,
    /// Runtime base URL; overrides the file and WFD_RUNTIME_URL
    #[arg(long, global = true)]
    pub base_url: Option<String>,
    /// Debug logging for engine targets and per-attempt logs
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,
}

impl GlobalOpts {
    fn config_path(&self) -> Option<PathBuf> {
        self.config.clone().or_else(|| {
            std::env::var("WFD_CONFIG")
                .ok()
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from)
        })
    }

    /// File (if any), then environment, then flags.
    pub fn settings(&self) -> Result<Settings> {
        let settings = match self.config_path() {
            Some(path) => load_settings(&path.to_string_lossy())
                .with_context(|| format!("loading config {}", path.display()))?,
            None => Settings::default(),
        };
        let mut settings = settings.apply_env_overrides();
        if let Some(url) = self.base_url.as_ref().filter(|u| !u.trim().is_empty()) {
            settings.runtime.base_url = Some(url.clone());
        }
        if self.verbose {
            settings.dispatch.verbose = Some(true);
        }
        Ok(settings)
    }

    pub fn dispatch_config(&self) -> Result<DispatchConfig> {
        self.settings()?.into_config()
    }
}

pub(crate) fn print_json<T: Serialize>(value: &T, pretty: bool) -> Result<()> {
    let text = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{text}");
    Ok(())
}
