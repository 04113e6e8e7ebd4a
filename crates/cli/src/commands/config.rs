use clap::Subcommand;
use std::path::Path;
use switchyard_core::config::{AppConfig, RegulationMode};

use super::utils::{print_error, print_info, print_success, CliError, CliResult};

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Validate a configuration file
    Validate {
        /// Path to config file
        #[arg(short, long, default_value = "config/switchyard.toml")]
        file: String,
    },

    /// Show the effective configuration, including environment overrides
    Show {
        /// Path to config file
        #[arg(short, long, default_value = "config/switchyard.toml")]
        file: String,
    },

    /// Generate a sample configuration file
    Generate {
        /// Output path for the config file
        #[arg(short, long, default_value = "config/switchyard.toml")]
        output: String,

        /// Overwrite existing file
        #[arg(long)]
        force: bool,
    },
}

pub fn handle_config_command(command: ConfigCommands) -> CliResult<()> {
    match command {
        ConfigCommands::Validate { file } => validate_config(&file),
        ConfigCommands::Show { file } => show_config(&file),
        ConfigCommands::Generate { output, force } => generate_config(&output, force),
    }
}

fn load(file: &str) -> CliResult<AppConfig> {
    AppConfig::from_file(file).map_err(|e| CliError::Config(e.to_string()))
}

fn validate_config(file: &str) -> CliResult<()> {
    if !Path::new(file).exists() {
        print_error(&format!("Configuration file not found: {file}"));
        return Err(CliError::Config(format!("File not found: {file}")));
    }

    print_info(&format!("Loading configuration from {file}..."));
    let config = load(file)?;

    print_info("Validating configuration...");
    config.validate().map_err(CliError::Config)?;

    print_success("Configuration is valid!");
    println!("Configuration Summary:");
    println!("  Consumers: {}", config.consumers.len());
    println!(
        "  Regulation: {}",
        match &config.regulation {
            Some(r) if r.mode == RegulationMode::Observe => "observe only",
            Some(_) => "enforced",
            None => "disabled",
        }
    );
    Ok(())
}

fn show_config(file: &str) -> CliResult<()> {
    let config = load(file)?;

    println!("Configuration from {file}:");

    println!("\n[Logging]");
    println!("  Level: {}", config.logging.level);
    println!("  Format: {}", config.logging.format);

    println!("\n[Regulation]");
    match &config.regulation {
        Some(r) => {
            println!("  Regulator: {} ({:?})", r.regulator, r.mode);
            println!("  Window: {}ms, min samples {}", r.window_ms, r.min_sample_threshold);
            println!("  Threshold: {:.2}", r.regulation_threshold);
            println!(
                "  Degrade: {}ms x{} (cap {})",
                r.degrade_duration_ms,
                r.escalation_factor,
                r.max_degrade_duration_ms.map_or_else(|| "none".to_string(), |ms| format!("{ms}ms"))
            );
            println!("  Probe share: {:.2}", r.probe_share);
            println!(
                "  Guards: allow_regulate_all={}, max_regulated_count={}",
                r.allow_regulate_all,
                r.max_regulated_count.map_or_else(|| "unbounded".to_string(), |n| n.to_string())
            );
        }
        None => println!("  Disabled"),
    }

    println!("\n[Consumers] ({})", config.consumers.len());
    for consumer in &config.consumers {
        println!("  {} -> {}", consumer.consumer_id(), consumer.service);
        println!(
            "    timeout {}ms, retries {}, {} invoke, balancer {}",
            consumer.timeout_ms,
            consumer.retries,
            consumer.invoke_type.as_str(),
            consumer.load_balancer
        );
        println!(
            "    connections: {:?}, lazy={}, check every {}ms",
            consumer.connection.holder,
            consumer.connection.lazy,
            consumer.connection.health_check_interval_ms
        );
        if let Some(direct) = &consumer.direct_url {
            println!("    direct: {direct}");
        }
    }
    Ok(())
}

pub(crate) const SAMPLE_CONFIG: &str = r#"# Switchyard call dispatch configuration

[logging]
level = "info"
format = "pretty"

# Remove this section to disable endpoint regulation.
[regulation]
window_ms = 10000
min_sample_threshold = 10
regulation_threshold = 0.5
degrade_duration_ms = 30000
escalation_factor = 2.0
probe_share = 0.1
max_degrade_duration_ms = 300000
mode = "enforce"
max_regulated_count = 3

[[consumers]]
service = "com.example.OrderService"
timeout_ms = 2000
retries = 1
load_balancer = "random"

[consumers.connection]
holder = "elastic"
elastic_percent = 30
elastic_min_count = 2

[[consumers]]
id = "inventory-direct"
service = "com.example.InventoryService"
direct_url = "tcp://10.0.0.11:12200?weight=100,tcp://10.0.0.12:12200?weight=50"
invoke_type = "future"
"#;

fn generate_config(output: &str, force: bool) -> CliResult<()> {
    if Path::new(output).exists() && !force {
        return Err(CliError::Config(format!(
            "File {output} already exists. Use --force to overwrite."
        )));
    }
    if let Some(parent) = Path::new(output).parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(output, SAMPLE_CONFIG)?;

    print_success(&format!("Sample configuration generated: {output}"));
    print_info("Remember to:");
    print_info("  1. Point direct_url at real endpoints or feed addresses from your registry");
    print_info("  2. Tune regulation thresholds to your traffic volume");
    Ok(())
}
