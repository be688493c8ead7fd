//! BankCore Simulator
//!
//! Drives concurrent transfers and fault scenarios against the ledger core
//! and checks that money is conserved.

use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bankcore_engine::{Bank, EngineConfig, MetricsSnapshot, StoreBackend};
use bankcore_ledger::MemoryStore;

mod controller;
mod customers;
mod metrics;
mod scenario;

use controller::{SimulationController, SimulationOptions, Verification};
use metrics::SimulationSummary;
use scenario::Scenario;

/// BankCore Simulator CLI
#[derive(Parser, Debug)]
#[command(name = "simulator")]
#[command(about = "BankCore ledger workload and fault simulator")]
struct Args {
    /// Number of customers to open
    #[arg(short, long, default_value = "5")]
    customers: usize,

    /// Scenario to run (ping-pong, contention, overdraft-race, audit-fault, slow-storage)
    #[arg(short, long)]
    scenario: Option<String>,

    /// Opening balance of every customer account
    #[arg(long, default_value = "1000")]
    opening_balance: Decimal,

    /// Owner id of the first customer
    #[arg(long, default_value = "1")]
    first_owner: i64,

    /// Concurrent workers in continuous mode
    #[arg(long, default_value = "4")]
    workers: usize,

    /// Operations per second per worker in continuous mode
    #[arg(long, default_value = "50.0")]
    rate: f64,

    /// Random seed for reproducibility
    #[arg(long)]
    seed: Option<u64>,

    /// Run duration in seconds (0 = until Ctrl+C)
    #[arg(long, default_value = "0")]
    duration: u64,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

/// Final report printed to stdout.
#[derive(Serialize)]
struct Report {
    backend: StoreBackend,
    scenario: Option<String>,
    simulation: SimulationSummary,
    engine: MetricsSnapshot,
    verification: Verification,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = EngineConfig::from_env();

    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone()),
    );
    if args.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    info!("Starting BankCore Simulator");
    info!(customers = args.customers, backend = %config.backend, "Configuration loaded");

    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return Err(anyhow::anyhow!("Configuration error: {}", e));
    }

    // Keep a handle on the memory store so scenarios can inject faults.
    let (bank, memory) = match config.backend {
        StoreBackend::Memory => {
            let memory = Arc::new(MemoryStore::new());
            let bank = Bank::new(config.clone(), memory.clone());
            (bank, Some(memory))
        }
        StoreBackend::Postgres => (Bank::connect(config.clone()).await?, None),
    };

    let options = SimulationOptions {
        customers: args.customers,
        first_owner: args.first_owner,
        opening_balance: args.opening_balance,
        rate: args.rate,
        workers: args.workers,
        seed: args.seed,
    };
    let mut controller = SimulationController::new(Arc::new(bank), memory, options);
    controller.initialize().await?;

    info!(customers = args.customers, "Simulator initialized");

    let started = Instant::now();
    if let Some(scenario_name) = &args.scenario {
        let scenario = Scenario::load(scenario_name)?;
        controller.run_scenario(scenario).await?;
    } else {
        info!("Running in continuous mode");
        info!("Press Ctrl+C to stop");

        let duration = if args.duration > 0 {
            Some(Duration::from_secs(args.duration))
        } else {
            None
        };

        controller.run(duration).await?;
    }
    let elapsed = started.elapsed();

    let verification = controller.verify().await?;
    let metrics = controller.metrics().await;
    let summary = metrics.summary(elapsed);

    info!("Simulation complete");
    info!(
        total = summary.total_operations,
        successful = summary.successful_operations,
        rejected = summary.rejected_operations,
        storage_faults = summary.storage_faults,
        diverged = summary.diverged_operations,
        "Operations"
    );
    info!(
        average_us = summary.average_latency_us,
        p50_us = summary.p50_latency_us,
        p99_us = summary.p99_latency_us,
        "Latency"
    );

    let passed = verification.passed();
    let report = Report {
        backend: config.backend,
        scenario: args.scenario.clone(),
        simulation: summary,
        engine: controller.engine_metrics(),
        verification,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !passed {
        error!("Ledger verification failed");
        return Err(anyhow::anyhow!("ledger verification failed"));
    }

    Ok(())
}
