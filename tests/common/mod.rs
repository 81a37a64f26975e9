//! Shared fixtures for the integration suites
//!
//! A `Fleet` is one coordinator on an ephemeral port, a single pooled
//! backend over a simulated provisioning service and an event recorder.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use metafleet::backend::{AgentTarget, PooledBackend, ProvisioningBackend, SimulatedProvisioningService};
use metafleet::coordinator::{Coordinator, CoordinatorSettings};
use metafleet::events::{EventListener, EventRecorder, ListenerRegistry, MasterEvent};
use metafleet::master::{MasterState, MasterStore, Organization};
use metafleet::protocol::{AgentConfig, AgentHandle, IdentityIssuer, MasterAgent, TlsConfig};
use metafleet::scheduler::{Cadence, RetryPolicy};

pub const COORDINATOR_ORG: &str = "coordinator";
pub const SERVER_NAME: &str = "coordinator.test.local";
pub const WAIT: Duration = Duration::from_secs(20);

pub fn org(name: &str) -> Organization {
    Organization::new(name).unwrap()
}

pub fn orgs(n: usize) -> Vec<Organization> {
    (0..n).map(|i| org(&format!("org{i}"))).collect()
}

/// TLS material for a coordinator signed by `issuer`.
pub fn coordinator_tls(issuer: &IdentityIssuer) -> TlsConfig {
    let identity = issuer
        .issue_coordinator(SERVER_NAME, &org(COORDINATOR_ORG))
        .unwrap();
    TlsConfig::builder()
        .ca_cert_pem(issuer.ca_cert_pem())
        .cert_pem(identity.cert_pem)
        .key_pem(identity.key_pem)
        .build()
        .unwrap()
}

/// TLS material for a master agent whose certificate names `certified`.
pub fn master_tls(issuer: &IdentityIssuer, certified: &str) -> TlsConfig {
    let identity = issuer.issue_master(&org(certified)).unwrap();
    TlsConfig::builder()
        .ca_cert_pem(issuer.ca_cert_pem())
        .cert_pem(identity.cert_pem)
        .key_pem(identity.key_pem)
        .build()
        .unwrap()
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[derive(Clone)]
pub struct FleetOptions {
    pub capacity: usize,
    /// Use a node pool instead of a cloud pool.
    pub node_pool: bool,
    pub start_delay: Duration,
    pub stop_delay: Duration,
    pub start_failures: u32,
    pub failing_graceful_stops: bool,
    /// Launched masters dial back when set.
    pub agents: bool,
    pub max_connected: Option<usize>,
    pub retry: RetryPolicy,
    pub store: Option<Arc<dyn MasterStore>>,
}

impl Default for FleetOptions {
    fn default() -> Self {
        Self {
            capacity: 4,
            node_pool: false,
            start_delay: Duration::from_millis(20),
            stop_delay: Duration::ZERO,
            start_failures: 0,
            failing_graceful_stops: false,
            agents: true,
            max_connected: None,
            retry: RetryPolicy {
                initial_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(50),
                ..RetryPolicy::default()
            },
            store: None,
        }
    }
}

pub struct Fleet {
    pub coordinator: Coordinator,
    pub service: Arc<SimulatedProvisioningService>,
    pub recorder: Arc<EventRecorder>,
    pub issuer: Arc<IdentityIssuer>,
    pub agent_address: String,
}

impl Fleet {
    pub async fn start(options: FleetOptions) -> Self {
        Self::start_with_issuer(options, Arc::new(IdentityIssuer::generate("test CA").unwrap())).await
    }

    pub async fn start_with_issuer(options: FleetOptions, issuer: Arc<IdentityIssuer>) -> Self {
        let recorder = Arc::new(EventRecorder::default());
        let listeners: Vec<Arc<dyn EventListener>> = vec![recorder.clone()];
        let events = Arc::new(ListenerRegistry::new(listeners));

        let mut service = SimulatedProvisioningService::new(options.start_delay)
            .with_stop_delay(options.stop_delay)
            .with_failures(options.start_failures);
        if options.failing_graceful_stops {
            service = service.with_failing_graceful_stops();
        }
        let service = Arc::new(service);
        let backend: Arc<dyn ProvisioningBackend> = if options.node_pool {
            Arc::new(PooledBackend::node("rack-a", options.capacity, service.clone()))
        } else {
            Arc::new(PooledBackend::cloud("pool", options.capacity, service.clone()))
        };

        let mut settings = CoordinatorSettings::new(org(COORDINATOR_ORG));
        settings.scheduler.cadence =
            Cadence::new(Duration::ZERO, Duration::from_millis(20)).unwrap();
        settings.scheduler.retry = options.retry;
        settings.max_connected_masters = options.max_connected;

        let coordinator = Coordinator::start(
            settings,
            coordinator_tls(&issuer),
            vec![backend],
            events,
            options.store,
        )
        .unwrap();
        let agent_address = coordinator
            .serve_agents("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap()
            .to_string();

        if options.agents {
            let mut target = AgentTarget::new(agent_address.clone(), SERVER_NAME, issuer.clone());
            target.expected_coordinator = Some(org(COORDINATOR_ORG));
            service.set_agent_target(target);
        }

        Self {
            coordinator,
            service,
            recorder,
            issuer,
            agent_address,
        }
    }

    /// Create and request provisioning for each organization.
    pub fn provision(&self, organizations: &[Organization]) {
        for organization in organizations {
            self.coordinator.create_master(organization.clone()).unwrap();
            assert!(self.coordinator.provision_master(organization).unwrap());
        }
    }

    pub fn state(&self, organization: &Organization) -> MasterState {
        self.coordinator.master(organization).unwrap().state
    }

    pub fn count_in(&self, state: MasterState) -> usize {
        self.coordinator
            .masters()
            .unwrap()
            .iter()
            .filter(|m| m.state == state)
            .count()
    }

    pub async fn wait_for_state(&self, organization: &Organization, state: MasterState) -> bool {
        wait_until(WAIT, || self.state(organization) == state).await
    }

    pub async fn wait_for_all(&self, state: MasterState) -> bool {
        wait_until(WAIT, || {
            self.coordinator
                .masters()
                .unwrap()
                .iter()
                .all(|m| m.state == state)
        })
        .await
    }

    pub async fn wait_for_all_of(&self, organizations: &[Organization], state: MasterState) -> bool {
        wait_until(WAIT, || organizations.iter().all(|o| self.state(o) == state)).await
    }

    /// Master events recorded for one organization, in order.
    pub fn master_events(&self, organization: &Organization) -> Vec<MasterEvent> {
        self.recorder.master_events(organization)
    }

    /// Dial in by hand as `declared`, presenting a certificate that names
    /// `certified`.
    pub fn dial(&self, declared: &str, certified: &str) -> (AgentHandle, Arc<EventRecorder>) {
        self.dial_with(declared, master_tls(&self.issuer, certified))
    }

    pub fn dial_with(&self, declared: &str, tls: TlsConfig) -> (AgentHandle, Arc<EventRecorder>) {
        let recorder = Arc::new(EventRecorder::default());
        let listeners: Vec<Arc<dyn EventListener>> = vec![recorder.clone()];
        let mut config = AgentConfig::new(org(declared), self.agent_address.clone(), SERVER_NAME);
        config.expected_coordinator = Some(org(COORDINATOR_ORG));
        config.initial_backoff = Duration::from_millis(20);
        config.max_backoff = Duration::from_millis(100);
        let handle = MasterAgent::new(config, tls, Arc::new(ListenerRegistry::new(listeners))).spawn();
        (handle, recorder)
    }

    pub async fn shutdown(self) {
        self.coordinator.shutdown().await;
    }
}
