use clap::{Parser, Subcommand};
use courier_observability::{LogFormat, ObservabilityConfig, init_tracing};
use std::path::PathBuf;

mod commands;

use commands::{CliError, run_delays, run_simulate};

#[derive(Parser, Debug)]
#[command(name = "courier", version = "0.1.0")]
#[command(about = "Courier CLI - inspect and exercise routing configurations")]
struct Cli {
    /// Log output format (json, pretty, compact)
    #[arg(long, global = true, default_value = "json")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the redelivery delay schedule of a configuration
    Delays {
        /// Routing configuration file (TOML); defaults apply when omitted
        #[arg(long)]
        config: Option<PathBuf>,
        /// Number of redelivery attempts to show
        #[arg(long, default_value_t = 5)]
        attempts: u32,
    },
    /// Route generated messages through a failing step and report the outcome
    Simulate {
        /// Routing configuration file (TOML); defaults apply when omitted
        #[arg(long)]
        config: Option<PathBuf>,
        /// Failed deliveries per message before it succeeds
        #[arg(long, default_value_t = 1)]
        failures: u32,
        /// Number of distinct messages
        #[arg(long, default_value_t = 10)]
        messages: u32,
        /// How many times each message is sent; repeats are duplicates
        #[arg(long, default_value_t = 1)]
        repeat: u32,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let observability = ObservabilityConfig {
        format: cli.log_format,
        ..Default::default()
    };
    if let Err(e) = init_tracing(&observability) {
        eprintln!("failed to initialize logging: {}", e);
    }

    let result: Result<String, CliError> = match cli.command {
        Commands::Delays { config, attempts } => run_delays(config.as_deref(), attempts),
        Commands::Simulate {
            config,
            failures,
            messages,
            repeat,
        } => run_simulate(config.as_deref(), failures, messages, repeat).await,
    };

    match result {
        Ok(output) => println!("{}", output),
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            std::process::exit(1);
        }
    }
}
