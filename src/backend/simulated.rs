//! # Simulated Provisioning Service
//!
//! Launches masters in-process. After a configurable delay each launch
//! issues the master a TLS identity and starts a [`MasterAgent`] that dials
//! back to the coordinator, exactly as a real instance would on boot.
//! Used by the demo command, the `simulated` service type and the tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use super::errors::{BackendError, BackendResult};
use super::service::MasterProvisioningService;
use super::InstanceHandle;
use crate::events::ListenerRegistry;
use crate::master::Organization;
use crate::protocol::{AgentConfig, AgentHandle, IdentityIssuer, MasterAgent, TlsConfig};

/// Where launched masters dial back to.
#[derive(Debug, Clone)]
pub struct AgentTarget {
    pub address: String,
    pub server_name: String,
    pub issuer: Arc<IdentityIssuer>,
    pub expected_coordinator: Option<Organization>,
    pub properties: BTreeMap<String, String>,
    /// Registry the agents report their side of each attempt to.
    pub events: Arc<ListenerRegistry>,
}

impl AgentTarget {
    pub fn new(
        address: impl Into<String>,
        server_name: impl Into<String>,
        issuer: Arc<IdentityIssuer>,
    ) -> Self {
        Self {
            address: address.into(),
            server_name: server_name.into(),
            issuer,
            expected_coordinator: None,
            properties: BTreeMap::new(),
            events: Arc::new(ListenerRegistry::default()),
        }
    }
}

/// Counters for assertions and diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SimulatedStats {
    pub running: usize,
    pub launched: u64,
    pub stopped: u64,
    pub failed: u64,
    pub starts_in_flight: usize,
    pub peak_starts_in_flight: usize,
}

struct RunningMaster {
    organization: Organization,
    agent: Option<AgentHandle>,
}

/// In-process master launcher.
pub struct SimulatedProvisioningService {
    delay: Duration,
    stop_delay: Duration,
    fail_remaining: AtomicU32,
    fail_graceful_stops: AtomicBool,
    target: RwLock<Option<AgentTarget>>,
    running: Mutex<HashMap<Uuid, RunningMaster>>,
    starts_in_flight: AtomicUsize,
    peak_starts: AtomicUsize,
    launched: AtomicU64,
    stopped: AtomicU64,
    failed: AtomicU64,
}

impl std::fmt::Debug for SimulatedProvisioningService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedProvisioningService")
            .field("delay", &self.delay)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Counts one start in flight for as long as it lives, including when the
/// start is aborted.
struct StartGuard<'a>(&'a AtomicUsize);

impl<'a> StartGuard<'a> {
    fn enter(counter: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl SimulatedProvisioningService {
    /// Masters take `delay` to start.
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            stop_delay: Duration::ZERO,
            fail_remaining: AtomicU32::new(0),
            fail_graceful_stops: AtomicBool::new(false),
            target: RwLock::new(None),
            running: Mutex::new(HashMap::new()),
            starts_in_flight: AtomicUsize::new(0),
            peak_starts: AtomicUsize::new(0),
            launched: AtomicU64::new(0),
            stopped: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Graceful stops take `delay`.
    pub fn with_stop_delay(mut self, delay: Duration) -> Self {
        self.stop_delay = delay;
        self
    }

    /// The next `count` starts fail.
    pub fn with_failures(self, count: u32) -> Self {
        self.fail_remaining.store(count, Ordering::SeqCst);
        self
    }

    /// Graceful stops fail; forced stops still succeed.
    pub fn with_failing_graceful_stops(self) -> Self {
        self.fail_graceful_stops.store(true, Ordering::SeqCst);
        self
    }

    /// Launched masters dial back to `target`.
    pub fn with_agents(self, target: AgentTarget) -> Self {
        self.set_agent_target(target);
        self
    }

    /// Set the dial-back target once the coordinator endpoint is bound.
    pub fn set_agent_target(&self, target: AgentTarget) {
        if let Ok(mut current) = self.target.write() {
            *current = Some(target);
        }
    }

    /// Make the next `count` starts fail.
    pub fn fail_next(&self, count: u32) {
        self.fail_remaining.store(count, Ordering::SeqCst);
    }

    pub fn stats(&self) -> SimulatedStats {
        SimulatedStats {
            running: self.running.lock().map(|r| r.len()).unwrap_or(0),
            launched: self.launched.load(Ordering::SeqCst),
            stopped: self.stopped.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            starts_in_flight: self.starts_in_flight.load(Ordering::SeqCst),
            peak_starts_in_flight: self.peak_starts.load(Ordering::SeqCst),
        }
    }

    /// Organizations with a running master.
    pub fn running_organizations(&self) -> Vec<Organization> {
        let mut orgs: Vec<Organization> = self
            .running
            .lock()
            .map(|r| r.values().map(|m| m.organization.clone()).collect())
            .unwrap_or_default();
        orgs.sort();
        orgs
    }

    fn take_failure(&self) -> bool {
        self.fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn launch_agent(&self, organization: &Organization) -> BackendResult<Option<AgentHandle>> {
        let target = match self.target.read() {
            Ok(target) => target.clone(),
            Err(_) => return Err(BackendError::Internal("Lock poisoned".into())),
        };
        let Some(target) = target else {
            return Ok(None);
        };

        let start_failed = |reason: String| BackendError::StartFailed {
            backend: "simulated".into(),
            reason,
        };
        let identity = target
            .issuer
            .issue_master(organization)
            .map_err(|e| start_failed(e.to_string()))?;
        let tls = TlsConfig::builder()
            .ca_cert_pem(target.issuer.ca_cert_pem())
            .cert_pem(identity.cert_pem)
            .key_pem(identity.key_pem)
            .build()
            .map_err(|e| start_failed(e.to_string()))?;

        let mut config = AgentConfig::new(organization.clone(), target.address, target.server_name);
        config.expected_coordinator = target.expected_coordinator;
        config.properties = target.properties;
        Ok(Some(MasterAgent::new(config, tls, target.events).spawn()))
    }
}

#[async_trait]
impl MasterProvisioningService for SimulatedProvisioningService {
    async fn provision(&self, handle: &InstanceHandle) -> BackendResult<String> {
        let _guard = StartGuard::enter(&self.starts_in_flight, &self.peak_starts);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if self.take_failure() {
            self.failed.fetch_add(1, Ordering::SeqCst);
            return Err(BackendError::StartFailed {
                backend: handle.backend.clone(),
                reason: "simulated start failure".into(),
            });
        }

        let agent = self.launch_agent(&handle.organization)?;
        self.running
            .lock()
            .map_err(|_| BackendError::Internal("Lock poisoned".into()))?
            .insert(
                handle.id,
                RunningMaster {
                    organization: handle.organization.clone(),
                    agent,
                },
            );
        self.launched.fetch_add(1, Ordering::SeqCst);
        info!(organization = %handle.organization, instance = %handle.id, "simulated master launched");
        Ok(format!("https://{}.masters.local/", handle.organization))
    }

    async fn terminate(&self, handle: &InstanceHandle, graceful: bool) -> BackendResult<()> {
        if graceful {
            if !self.stop_delay.is_zero() {
                tokio::time::sleep(self.stop_delay).await;
            }
            if self.fail_graceful_stops.load(Ordering::SeqCst) {
                return Err(BackendError::StopFailed {
                    backend: handle.backend.clone(),
                    reason: "simulated graceful stop failure".into(),
                });
            }
        }

        let removed = self
            .running
            .lock()
            .map_err(|_| BackendError::Internal("Lock poisoned".into()))?
            .remove(&handle.id);
        match removed {
            Some(master) => {
                if let Some(agent) = master.agent {
                    agent.stop();
                }
                self.stopped.fetch_add(1, Ordering::SeqCst);
                debug!(organization = %handle.organization, graceful, "simulated master stopped");
            }
            None => debug!(instance = %handle.id, "stop for unknown simulated master"),
        }
        Ok(())
    }
}
