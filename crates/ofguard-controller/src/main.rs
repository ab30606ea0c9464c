//! ofguardd entry point.
//!
//! Loads the policy, compiles it, and runs the controller against the
//! in-memory transport: the configured switches connect, the scripted port
//! events are replayed, and the resulting flow tables are logged.

use anyhow::Context;
use clap::Parser;
use ofguard_controller::{ControllerConfig, MemoryTransport, SessionManager, Transport};
use ofguard_orch_common::{EventHandler, HandshakeInfo, SwitchEvent};
use ofguard_policy::PolicyModel;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Reactive network-policy controller
#[derive(Parser, Debug)]
#[command(name = "ofguardd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Policy file (TOML). Overrides the config file setting.
    #[arg(short = 'p', long)]
    policy: Option<PathBuf>,

    /// Daemon config file (TOML)
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error), overridden by RUST_LOG
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,

    /// Print the compiled rules and exit
    #[arg(long)]
    dump_rules: bool,
}

fn init_logging(log_level: &str, json: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(fmt::layer().with_target(true).json())
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .init();
    }
}

fn load_policy(path: Option<&PathBuf>) -> anyhow::Result<PolicyModel> {
    match path {
        Some(path) => PolicyModel::load(path)
            .with_context(|| format!("loading policy {}", path.display())),
        None => {
            info!("No policy file given, using the built-in campus policy");
            Ok(PolicyModel::reference())
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = match &args.config {
        Some(path) => ControllerConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => ControllerConfig::default(),
    };

    let model = load_policy(args.policy.as_ref().or(config.policy.as_ref()))?;

    let transport = Arc::new(MemoryTransport::new());
    let manager = Arc::new(
        SessionManager::new(transport.clone() as Arc<dyn Transport>, config.retry.clone())
            .with_policy(&model)?,
    );
    let compiled = manager.compiled_policy();

    if args.dump_rules {
        for rule in compiled.rules() {
            println!("{}  # {}", rule, rule.note);
        }
        return Ok(());
    }

    let sim = &config.simulation;
    info!(
        version = compiled.version(),
        rules = compiled.len(),
        switches = sim.switches.len(),
        port_events = sim.port_events.len(),
        "Starting simulation"
    );

    let mut connects = JoinSet::new();
    for &switch_id in &sim.switches {
        let manager = manager.clone();
        let info = HandshakeInfo::new(254, sim.ports_per_switch);
        connects.spawn(async move { (switch_id, manager.connect(switch_id, info).await) });
    }
    while let Some(joined) = connects.join_next().await {
        let (switch_id, result) = joined.context("connect task panicked")?;
        match result {
            Ok(entries) => info!(switch = %switch_id, entries, "switch ready"),
            Err(e) => error!(switch = %switch_id, error = %e, "switch failed to connect"),
        }
    }

    for event in &sim.port_events {
        match manager.port_status(*event).await {
            Ok(outcome) => info!(%event, ?outcome, "port event handled"),
            Err(e) => warn!(%event, error = %e, "port event discarded"),
        }
    }

    for switch_id in manager.active_switches() {
        let snapshot = manager.snapshot(switch_id).await?;
        info!(
            switch = %switch_id,
            state = %snapshot.state,
            version = snapshot.policy_version,
            entries = snapshot.entry_count(),
            "flow table"
        );
        for entry in &snapshot.entries {
            info!(switch = %switch_id, seq = entry.seq, "{}", entry.rule);
        }
    }

    for switch_id in manager.active_switches() {
        manager
            .dispatch(SwitchEvent::Disconnected { switch_id })
            .await;
    }
    manager.shutdown().await;

    info!(messages = transport.messages().len(), "Simulation complete");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log_level, args.json);

    info!("--- Starting ofguardd ---");

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("ofguardd failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
