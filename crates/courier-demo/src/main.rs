//! Courier demo: exercises the RPC, task and event patterns end to end.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use courier_bus::{BusConfig, MessageBus};
use courier_demo::{build_bus, run_event, run_rpc, run_task};
use courier_telemetry::{init_telemetry, BusMetrics, TelemetryConfig};

/// Courier demo: message bus patterns over one broker connection
#[derive(Parser, Debug)]
#[command(name = "courier-demo")]
#[command(about = "Runs the Courier RPC, task and event examples")]
struct Args {
    /// Broker URL (needs the `amqp` feature). Defaults to the in-memory broker.
    #[arg(long)]
    amqp: Option<String>,

    /// Timeout for the call to the service nobody serves, in milliseconds
    #[arg(long, default_value = "2000")]
    missing_timeout_ms: u64,

    /// How long to wait for tasks and events, in milliseconds
    #[arg(long, default_value = "5000")]
    wait_ms: u64,

    /// Print Prometheus metrics when done
    #[arg(long)]
    metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Hypotenuse RPC service with a failing call and a call that times out
    Rpc,
    /// Task sent while no listener is attached, received by the next one
    Task,
    /// One event delivered to two subscribers
    Event,
    /// All of the above
    All,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let telemetry_config = TelemetryConfig::from_env().with_service_name("courier-demo");
    let telemetry = init_telemetry(telemetry_config).context("failed to initialize telemetry")?;

    let config = BusConfig::from_env().context("invalid bus configuration")?;
    let bus = build_bus(config, args.amqp.clone())?;
    info!(url = %bus.url(), timeout = ?bus.timeout(), "Bus created");

    let outcome = run(&bus, telemetry.metrics(), &args).await;
    bus.close().await.context("failed to close the bus")?;
    outcome?;

    if args.metrics {
        print!("{}", telemetry.metrics().gather_text()?);
    }
    Ok(())
}

async fn run(bus: &MessageBus, metrics: &BusMetrics, args: &Args) -> Result<()> {
    let wait = Duration::from_millis(args.wait_ms);
    let all = args.command == Command::All;

    if all || args.command == Command::Rpc {
        let report = run_rpc(bus, metrics, Duration::from_millis(args.missing_timeout_ms)).await?;
        println!("rpc {}: {:?}", courier_demo::scenarios::MISSING_SERVICE, report.missing_service);
        println!("rpc {} {{test}}: {:?}", courier_demo::scenarios::RPC_SERVICE, report.incomplete);
        println!("rpc {} {{dx: 3, dy: 4}}: {:?}", courier_demo::scenarios::RPC_SERVICE, report.hypotenuse);
    }

    if all || args.command == Command::Task {
        let task = run_task(bus, metrics, wait).await?;
        println!("task received: {task}");
    }

    if all || args.command == Command::Event {
        let report = run_event(bus, metrics, wait).await?;
        for (subscriber, events) in [("first", &report.first), ("second", &report.second)] {
            for event in events {
                println!("event {subscriber} subscriber: {event}");
            }
        }
    }

    Ok(())
}
