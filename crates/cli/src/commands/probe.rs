//! Simulated regulation run against in-process endpoints.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use switchyard_core::{
    config::{AppConfig, ConsumerConfig, RegulationConfig},
    runtime::{ConsumerClient, DispatchRuntime},
    transport::{LoopbackBehavior, LoopbackTransport},
    types::{EndpointInfo, EndpointKey},
};
use tracing::debug;

use super::utils::{print_info, CliError, CliResult};

const PROBE_SERVICE: &str = "switchyard.Probe";
const BASE_PORT: u16 = 20_000;

/// Options for the `probe` command.
#[derive(Debug, Clone)]
pub struct ProbeOptions {
    pub endpoints: u16,
    /// `index=ratio` pairs, e.g. `1=0.9`.
    pub failing: Vec<String>,
    pub rounds: u32,
    pub calls_per_round: u32,
    pub window_ms: u64,
    pub degrade_ms: u64,
    pub json: bool,
    /// Regulation thresholds are taken from this file when it has a `[regulation]` section.
    pub config: Option<String>,
}

#[derive(Debug, Serialize)]
struct EndpointRow {
    endpoint: String,
    state: &'static str,
    effective_calls: u64,
    last_window_ratio: Option<f64>,
    strikes: u32,
    degrade_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
struct RoundReport {
    round: u32,
    at: DateTime<Utc>,
    ok: u32,
    failed: u32,
    endpoints: Vec<EndpointRow>,
}

/// Parses `index=ratio` into an endpoint index and failure probability.
pub(crate) fn parse_failing(arg: &str, endpoints: u16) -> CliResult<(u16, f64)> {
    let (index, ratio) = arg
        .split_once('=')
        .ok_or_else(|| CliError::Argument(format!("expected index=ratio, got {arg}")))?;
    let index: u16 = index
        .trim()
        .parse()
        .map_err(|_| CliError::Argument(format!("bad endpoint index in {arg}")))?;
    let ratio: f64 =
        ratio.trim().parse().map_err(|_| CliError::Argument(format!("bad ratio in {arg}")))?;
    if index >= endpoints {
        return Err(CliError::Argument(format!("endpoint index {index} out of range 0..{endpoints}")));
    }
    if !(0.0..=1.0).contains(&ratio) {
        return Err(CliError::Argument(format!("ratio {ratio} must be within 0..=1")));
    }
    Ok((index, ratio))
}

fn endpoint_key(index: u16) -> EndpointKey {
    EndpointKey::new("tcp", "127.0.0.1", BASE_PORT + index, "default")
}

fn regulation_for(options: &ProbeOptions) -> CliResult<RegulationConfig> {
    if let Some(file) = &options.config {
        let config = AppConfig::from_file(file).map_err(|e| CliError::Config(e.to_string()))?;
        if let Some(regulation) = config.regulation {
            regulation.validate().map_err(CliError::Config)?;
            return Ok(regulation);
        }
    }
    Ok(RegulationConfig::new(
        Duration::from_millis(options.window_ms),
        10,
        0.5,
        Duration::from_millis(options.degrade_ms),
        2.0,
        0.2,
    ))
}

pub async fn run_probe(options: ProbeOptions) -> CliResult<()> {
    if options.endpoints == 0 {
        return Err(CliError::Argument("at least one endpoint is required".to_string()));
    }
    let failing = options
        .failing
        .iter()
        .map(|arg| parse_failing(arg, options.endpoints))
        .collect::<CliResult<Vec<_>>>()?;
    let regulation = regulation_for(&options)?;
    let window = regulation.window();

    let transport = LoopbackTransport::new();
    for (index, ratio) in &failing {
        transport.set_behavior(&endpoint_key(*index), LoopbackBehavior::FailRatio(*ratio));
    }

    let runtime = DispatchRuntime::builder()
        .with_config(AppConfig { regulation: Some(regulation), ..Default::default() })
        .with_transport(Arc::new(transport))
        .disable_health_checks()
        .build()?;

    let mut consumer = ConsumerConfig::new(PROBE_SERVICE);
    consumer.direct_url = Some(
        (0..options.endpoints)
            .map(|i| format!("tcp://127.0.0.1:{}", BASE_PORT + i))
            .collect::<Vec<_>>()
            .join(","),
    );
    let client = runtime.refer(consumer).await?;

    print_info(&format!(
        "Probing {} endpoints for {} rounds of {} calls (window {}ms)",
        options.endpoints,
        options.rounds,
        options.calls_per_round,
        window.as_millis()
    ));

    for round in 1..=options.rounds {
        let (ok, failed) = fire(&client, options.calls_per_round).await;
        // Let the regulation loop tick over the window just filled.
        tokio::time::sleep(window + Duration::from_millis(20)).await;
        let report = RoundReport { round, at: Utc::now(), ok, failed, endpoints: rows(&runtime, &client) };
        if options.json {
            println!("{}", serde_json::to_string(&report)?);
        } else {
            print_round(&report);
        }
    }

    runtime.shutdown().await;
    Ok(())
}

async fn fire(client: &ConsumerClient, calls: u32) -> (u32, u32) {
    let mut ok = 0;
    let mut failed = 0;
    for _ in 0..calls {
        match client.invoke(client.build_request("probe", "")).await {
            Ok(_) => ok += 1,
            Err(e) => {
                debug!(error = %e, "probe call failed");
                failed += 1;
            }
        }
    }
    (ok, failed)
}

fn rows(runtime: &DispatchRuntime, client: &ConsumerClient) -> Vec<EndpointRow> {
    let mut endpoints: Vec<Arc<EndpointInfo>> = client.addresses().all_endpoints();
    endpoints.sort_by_key(|ep| ep.key().port);
    endpoints
        .iter()
        .map(|ep| {
            let stat = runtime.stats().get(client.id(), ep.key());
            let entry = runtime.regulation().and_then(|r| r.entry(client.id(), ep.key()));
            EndpointRow {
                endpoint: ep.key().to_string(),
                state: ep.regulation_state().as_str(),
                effective_calls: stat.as_ref().map_or(0, |s| s.total_invocations()),
                last_window_ratio: stat
                    .and_then(|s| s.history().last().copied())
                    .map(|w| w.exception_ratio()),
                strikes: entry.map_or(0, |e| e.strikes),
                degrade_ms: entry
                    .map(|e| u64::try_from(e.current_degrade.as_millis()).unwrap_or(u64::MAX)),
            }
        })
        .collect()
}

fn print_round(report: &RoundReport) {
    println!(
        "\nRound {} at {} ({} ok, {} failed)",
        report.round,
        report.at.format("%H:%M:%S%.3f"),
        report.ok,
        report.failed
    );
    println!("  {:<28} {:<11} {:>7} {:>7} {:>7} {:>9}", "endpoint", "state", "calls", "ratio", "strikes", "degrade");
    for row in &report.endpoints {
        println!(
            "  {:<28} {:<11} {:>7} {:>7} {:>7} {:>9}",
            row.endpoint,
            row.state,
            row.effective_calls,
            row.last_window_ratio.map_or_else(|| "-".to_string(), |r| format!("{r:.2}")),
            row.strikes,
            row.degrade_ms.map_or_else(|| "-".to_string(), |ms| format!("{ms}ms")),
        );
    }
}
