use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;
use commands::{handle_config_command, run_probe, ConfigCommands, ProbeOptions};

#[derive(Parser)]
#[command(name = "switchyard")]
#[command(about = "Switchyard CLI - configuration checks and regulation probes for the call dispatcher")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log output format: pretty or json
    #[arg(long, global = true, default_value = "pretty")]
    log_format: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Configuration Management
    #[command(subcommand)]
    Config(ConfigCommands),

    /// Drive in-process endpoints through regulation and print their states
    Probe {
        /// Number of simulated endpoints
        #[arg(short, long, default_value = "4")]
        endpoints: u16,

        /// Failing endpoint as index=ratio (can be specified multiple times)
        #[arg(short, long)]
        failing: Vec<String>,

        /// Number of rounds to run
        #[arg(short, long, default_value = "10")]
        rounds: u32,

        /// Calls issued per round
        #[arg(long, default_value = "100")]
        calls: u32,

        /// Statistics window in milliseconds
        #[arg(long, default_value = "500")]
        window_ms: u64,

        /// Initial degrade duration in milliseconds
        #[arg(long, default_value = "1000")]
        degrade_ms: u64,

        /// Emit one JSON object per round
        #[arg(long)]
        json: bool,

        /// Take regulation thresholds from this config file
        #[arg(short, long)]
        config: Option<String>,
    },
}

/// Initializes logging. `RUST_LOG` overrides the default filter.
fn init_logging(format: &str) {
    let filter = EnvFilter::try_from_env("RUST_LOG")
        .unwrap_or_else(|_| EnvFilter::new("warn,switchyard_core=info,switchyard_cli=info"));
    let registry = tracing_subscriber::registry().with(filter);

    if format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr)).init();
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .pretty()
            .with_file(true)
            .with_line_number(true)
            .with_target(false)
            .with_writer(std::io::stderr);
        registry.with(fmt_layer).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_format);

    match cli.command {
        Commands::Config(config_command) => handle_config_command(config_command)?,
        Commands::Probe { endpoints, failing, rounds, calls, window_ms, degrade_ms, json, config } => {
            let options = ProbeOptions {
                endpoints,
                failing,
                rounds,
                calls_per_round: calls,
                window_ms,
                degrade_ms,
                json,
                config,
            };
            run_probe(options).await?;
        }
    }

    Ok(())
}
