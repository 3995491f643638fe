//! Vigil: VPN tunnel control plane tools
//!
//! Runs pieces of the control plane standalone: the connection tester
//! against a real interface, and server selection over a server list.

mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::error::Elapsed;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vigil_tunnel::{
    ConnectionTester, ServerList, ServerSelectionMethod, SystemInterfaces, TcpProber, TestReport,
    TestResult, TesterSettings, TunnelSettings,
};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Probe { interface, count, config } => {
            let settings = load_settings(config.as_deref())?;
            probe(settings, &interface, count).await
        }
        Commands::Servers { file, avoid, prefer } => {
            let method = match (avoid, prefer) {
                (Some(name), _) => ServerSelectionMethod::AvoidServer(name),
                (None, Some(name)) => ServerSelectionMethod::PreferredServer(name),
                (None, None) => ServerSelectionMethod::Automatic,
            };
            show_servers(&file, &method)
        }
        Commands::Defaults => {
            print!("{}", TunnelSettings::default().to_toml());
            Ok(())
        }
    }
}

fn setup_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

fn load_settings(path: Option<&Path>) -> Result<TunnelSettings> {
    match path {
        Some(path) => TunnelSettings::from_toml_file(path)
            .with_context(|| format!("loading settings from {}", path.display())),
        None => Ok(TunnelSettings::default()),
    }
}

async fn probe(settings: TunnelSettings, interface: &str, count: usize) -> Result<()> {
    let (tester, mut results) = ConnectionTester::new(
        settings.tester.clone(),
        Arc::new(TcpProber),
        Arc::new(SystemInterfaces),
    );

    tester.start(interface)
        .with_context(|| format!("starting connection tester on {interface}"))?;
    info!(endpoint = %settings.tester.endpoint, count, "Probing");

    let wait = result_wait(&settings.tester);
    for _ in 0..count {
        let result = match next_result(&mut results, wait).await {
            Ok(Some(result)) => result,
            Ok(None) => break,
            Err(_) => {
                warn!(?wait, "No conclusive result, both probes failed or timed out");
                continue;
            }
        };
        match result {
            TestResult::Connected => info!("Tunnel connected"),
            TestResult::Reconnected => info!("Tunnel reconnected"),
            TestResult::Disconnected { failure_count } => {
                warn!(failure_count, "Tunnel disconnected")
            }
        }
    }

    tester.stop();
    Ok(())
}

/// Longest a test tick can take to report.
///
/// Inconclusive ticks report nothing at all.
fn result_wait(settings: &TesterSettings) -> Duration {
    settings.interval() + settings.timeout()
}

async fn next_result(
    results: &mut UnboundedReceiver<TestReport>,
    wait: Duration,
) -> Result<Option<TestResult>, Elapsed> {
    tokio::time::timeout(wait, results.recv())
        .await
        .map(|report| report.map(|r| r.result))
}

fn show_servers(file: &Path, method: &ServerSelectionMethod) -> Result<()> {
    let list = ServerList::load(file)
        .with_context(|| format!("loading server list from {}", file.display()))?;

    for server in list.enabled_servers() {
        println!("{:<20} {:<24} {}:{}", server.name, server.location, server.endpoint_ip, server.endpoint_port);
    }

    let selected = list.select(method)
        .with_context(|| format!("selecting a server with method {method}"))?;
    println!();
    println!("{method} -> {} ({})", selected.name, selected.location);
    Ok(())
}
