//! CLI command implementations
//!
//! Commands that need the async runtime build one here; the binary's
//! `main` stays synchronous.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::backend::{AgentTarget, PooledBackend, ProvisioningBackend, SimulatedProvisioningService};
use crate::config::CoordinatorConfig;
use crate::coordinator::{Coordinator, CoordinatorSettings};
use crate::events::{EventListener, EventRecorder, ListenerRegistry, LoggingListener};
use crate::http::{AdminServer, AdminState};
use crate::master::{JsonFileStore, MasterState, MasterStore, Organization};
use crate::observability::{init_tracing, FleetMetrics, MetricsListener};
use crate::protocol::{IdentityIssuer, TlsConfig};
use crate::scheduler::Cadence;

use super::args::{Cli, Command};
use super::errors::{CliError, CliResult};
use super::io::write_response;

/// Server name on the demo coordinator's certificate.
const DEMO_SERVER_NAME: &str = "coordinator.demo.local";

/// Parse arguments, install logging and run the command
pub fn run() -> CliResult<()> {
    let cli = Cli::parse_args();
    init_tracing(cli.log_filter.as_deref(), cli.json_logs);
    run_command(cli.command)
}

/// Run the appropriate command based on CLI args
pub fn run_command(cmd: Command) -> CliResult<()> {
    match cmd {
        Command::Serve { config } => serve(&config),
        Command::CheckConfig { config } => check_config(&config),
        Command::IssueCa { out, common_name } => issue_ca(&out, &common_name),
        Command::IssueIdentity {
            ca_dir,
            organization,
            out,
            server_name,
            stem,
        } => issue_identity(
            &ca_dir,
            &organization,
            &out,
            server_name.as_deref(),
            stem.as_deref(),
        ),
        Command::Demo {
            masters,
            capacity,
            delay_ms,
            timeout_secs,
        } => demo(DemoOptions {
            masters,
            capacity,
            delay: Duration::from_millis(delay_ms),
            timeout: Duration::from_secs(timeout_secs),
        }),
    }
}

fn runtime() -> CliResult<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| CliError::Startup(format!("failed to start runtime: {e}")))
}

fn organization(name: &str) -> CliResult<Organization> {
    Organization::new(name).map_err(|e| CliError::Startup(e.to_string()))
}

// ==================
// serve
// ==================

/// Run the coordinator until interrupted
pub fn serve(config_path: &Path) -> CliResult<()> {
    let config = CoordinatorConfig::load(config_path)?;
    runtime()?.block_on(serve_config(config))
}

async fn serve_config(config: CoordinatorConfig) -> CliResult<()> {
    let tls = config.load_tls()?;

    let metrics = Arc::new(FleetMetrics::new());
    let recorder = Arc::new(EventRecorder::default());
    let listeners: Vec<Arc<dyn EventListener>> = vec![
        Arc::new(LoggingListener),
        Arc::new(MetricsListener::new(metrics.clone())),
        recorder.clone(),
    ];
    let events =
        Arc::new(ListenerRegistry::new(listeners).with_slow_threshold(config.slow_threshold()));
    let store: Option<Arc<dyn MasterStore>> = config
        .state_file
        .as_ref()
        .map(|path| Arc::new(JsonFileStore::new(path)) as Arc<dyn MasterStore>);

    let built = config.build_backends();
    let coordinator = Arc::new(Coordinator::start(
        config.coordinator_settings()?,
        tls,
        built.backends,
        events,
        store,
    )?);
    let agent_addr = coordinator.serve_agents(config.agent_addr()?).await?;

    if !built.simulated.is_empty() {
        match &config.tls.ca_key {
            Some(ca_key) => {
                let issuer = IdentityIssuer::from_pem(
                    &fs::read_to_string(&config.tls.ca_cert)?,
                    &fs::read_to_string(ca_key)?,
                )?;
                let mut target = AgentTarget::new(
                    agent_addr.to_string(),
                    config.tls.server_name.clone(),
                    Arc::new(issuer),
                );
                target.expected_coordinator = Some(config.organization()?);
                for service in &built.simulated {
                    service.set_agent_target(target.clone());
                }
            }
            None => warn!("tls.ca_key is not set; simulated masters will not dial back"),
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let admin = AdminServer::new(AdminState {
        coordinator: coordinator.clone(),
        metrics,
        recorder,
    });
    let (http_addr, http_task) = admin.spawn(config.http_addr()?, shutdown_rx).await?;
    info!(agents = %agent_addr, admin = %http_addr, "coordinator running");

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");

    shutdown_tx.send_replace(true);
    coordinator.shutdown().await;
    match http_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "admin API stopped with error"),
        Err(e) => warn!(error = %e, "admin API task failed"),
    }
    Ok(())
}

// ==================
// check-config
// ==================

/// Validate a configuration file and print the effective settings
pub fn check_config(config_path: &Path) -> CliResult<()> {
    let config = CoordinatorConfig::load(config_path)?;
    write_response(serde_json::to_value(&config)?)
}

// ==================
// issue-ca / issue-identity
// ==================

/// Create a CA and write `ca.pem` / `ca.key` into `out`
pub fn issue_ca(out: &Path, common_name: &str) -> CliResult<()> {
    let issuer = IdentityIssuer::generate(common_name)?;
    issuer.save(out)?;
    write_response(json!({
        "ca_dir": out.display().to_string(),
        "common_name": common_name,
    }))
}

/// Issue a master identity, or a coordinator identity when `server_name`
/// is given
pub fn issue_identity(
    ca_dir: &Path,
    organization_name: &str,
    out: &Path,
    server_name: Option<&str>,
    stem: Option<&str>,
) -> CliResult<()> {
    let issuer = IdentityIssuer::load(ca_dir)?;
    let organization = organization(organization_name)?;

    let (identity, default_stem, role) = match server_name {
        Some(name) => (
            issuer.issue_coordinator(name, &organization)?,
            "coordinator".to_string(),
            "coordinator",
        ),
        None => (
            issuer.issue_master(&organization)?,
            organization.to_string(),
            "master",
        ),
    };
    let stem = stem.map(str::to_string).unwrap_or(default_stem);
    identity.write(out, &stem)?;

    write_response(json!({
        "role": role,
        "organization": organization.as_str(),
        "cert": out.join(format!("{stem}.pem")).display().to_string(),
        "key": out.join(format!("{stem}.key")).display().to_string(),
    }))
}

// ==================
// demo
// ==================

/// Options for the in-process demo fleet
#[derive(Debug, Clone)]
pub struct DemoOptions {
    pub masters: usize,
    pub capacity: usize,
    pub delay: Duration,
    pub timeout: Duration,
}

/// Run the demo and print a summary
pub fn demo(options: DemoOptions) -> CliResult<()> {
    let summary = runtime()?.block_on(run_demo(options))?;
    write_response(summary)
}

/// Provision `masters` simulated masters, wait for all of them to connect,
/// then terminate them and report what happened.
pub async fn run_demo(options: DemoOptions) -> CliResult<Value> {
    if options.capacity == 0 {
        return Err(CliError::Demo("capacity must be > 0".into()));
    }

    let issuer = Arc::new(IdentityIssuer::generate("metafleet demo CA")?);
    let coordinator_org = organization("coordinator")?;
    let identity = issuer.issue_coordinator(DEMO_SERVER_NAME, &coordinator_org)?;
    let tls = TlsConfig::builder()
        .ca_cert_pem(issuer.ca_cert_pem())
        .cert_pem(identity.cert_pem)
        .key_pem(identity.key_pem)
        .build()?;

    let metrics = Arc::new(FleetMetrics::new());
    let listeners: Vec<Arc<dyn EventListener>> = vec![
        Arc::new(LoggingListener),
        Arc::new(MetricsListener::new(metrics.clone())),
    ];
    let events = Arc::new(ListenerRegistry::new(listeners));
    let service = Arc::new(SimulatedProvisioningService::new(options.delay));
    let backend: Arc<dyn ProvisioningBackend> =
        Arc::new(PooledBackend::cloud("demo", options.capacity, service.clone()));

    let mut settings = CoordinatorSettings::new(coordinator_org.clone());
    settings.scheduler.cadence = Cadence::new(Duration::ZERO, Duration::from_millis(100))
        .map_err(|e| CliError::Demo(e.to_string()))?;
    let coordinator = Coordinator::start(settings, tls, vec![backend], events, None)?;
    let agent_addr = coordinator
        .serve_agents(([127, 0, 0, 1], 0).into())
        .await?;

    let mut target = AgentTarget::new(agent_addr.to_string(), DEMO_SERVER_NAME, issuer);
    target.expected_coordinator = Some(coordinator_org);
    service.set_agent_target(target);

    let started = Instant::now();
    let mut organizations = Vec::with_capacity(options.masters);
    for i in 0..options.masters {
        let org = organization(&format!("org{i}"))?;
        coordinator.create_master(org.clone())?;
        coordinator.provision_master(&org)?;
        organizations.push(org);
    }

    let all_approved = wait_for_states(&coordinator, options.timeout, |s| s == MasterState::Approved).await?;
    let connected_after = started.elapsed();
    let peak = coordinator
        .backend_status()
        .first()
        .map(|s| s.peak)
        .unwrap_or(0);
    let connected = coordinator.connected_masters();

    for org in &organizations {
        coordinator.terminate(org, false)?;
    }
    let all_terminated =
        wait_for_states(&coordinator, options.timeout, |s| s == MasterState::Terminated).await?;
    coordinator.shutdown().await;

    if !all_approved {
        return Err(CliError::Demo(format!(
            "only {connected} of {} masters connected within {:?}",
            options.masters, options.timeout
        )));
    }

    Ok(json!({
        "masters": options.masters,
        "capacity": options.capacity,
        "peak_in_flight": peak,
        "connected": connected,
        "connected_after_ms": connected_after.as_millis() as u64,
        "all_terminated": all_terminated,
        "metrics": metrics.snapshot(),
        "simulated": service.stats(),
    }))
}

async fn wait_for_states(
    coordinator: &Coordinator,
    timeout: Duration,
    done: impl Fn(MasterState) -> bool,
) -> CliResult<bool> {
    let deadline = Instant::now() + timeout;
    loop {
        let masters = coordinator.masters()?;
        if masters.iter().all(|m| done(m.state)) {
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
