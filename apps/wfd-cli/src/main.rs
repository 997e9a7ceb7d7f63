use clap::{Parser, Subcommand};

mod commands;

use commands::{ConfigCmd, ExecutionCmd, GlobalOpts, HealthArgs, RunArgs};

#[derive(Parser)]
#[command(name = "wfd", version, about = "Workflow dispatch engine CLI")]
struct Cli {
    #[command(flatten)]
    global: GlobalOpts,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Dispatch a JSONL file of workflow payloads and print a summary
    Run(RunArgs),
    /// Probe the runtime once and print the health report
    Health(HealthArgs),
    /// Query or stop a runtime execution
    Execution {
        #[command(subcommand)]
        cmd: ExecutionCmd,
    },
    /// Inspect the configuration file
    Config {
        #[command(subcommand)]
        cmd: ConfigCmd,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    wfd_otel::init_with_verbose(cli.global.verbose);

    let result = match cli.command {
        Commands::Run(args) => commands::run::execute(&cli.global, &args).await,
        Commands::Health(args) => commands::health::execute(&cli.global, &args).await,
        Commands::Execution { cmd } => commands::execution::execute(&cli.global, cmd).await,
        Commands::Config { cmd } => commands::config::execute(&cli.global, cmd),
    };
    if let Err(err) = result {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
