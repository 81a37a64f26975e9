//! # Coordinator
//!
//! Wires the master registry, event listeners, lifecycle scheduler and the
//! agent endpoint into one running service. The [`CoordinatorAgentListener`]
//! is the acceptor-side policy: it decides which masters may dial in and
//! binds the resulting channel to the master entity.

use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::ProvisioningBackend;
use crate::events::{ListenerRegistry, MasterEvent};
use crate::master::{
    lock_master, MasterError, MasterRegistry, MasterSnapshot, MasterState, MasterStore,
    Organization, StoreError, StoreListener,
};
use crate::protocol::{
    AgentListener, Channel, ConnectError, ConnectionAttempt, ConnectionFailure, ProtocolEngine,
    Refusal, RefusalReason, SecurityError, TlsConfig, DEFAULT_HANDSHAKE_TIMEOUT,
};
use crate::scheduler::{BackendStatus, CadenceHandle, MasterProvisioner, SchedulerError, SchedulerSettings};

/// Result type for coordinator operations
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

/// Coordinator errors
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Master(#[from] MasterError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Agent endpoint error: {0}")]
    Endpoint(String),
}

impl CoordinatorError {
    /// Get HTTP status code
    pub fn status_code(&self) -> u16 {
        match self {
            CoordinatorError::Master(e) => e.status_code(),
            CoordinatorError::Scheduler(e) => e.status_code(),
            CoordinatorError::Store(_) => 500,
            CoordinatorError::Endpoint(_) => 500,
        }
    }
}

/// Coordinator tunables.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// Organization the coordinator declares in the handshake.
    pub organization: Organization,
    pub properties: BTreeMap<String, String>,
    pub scheduler: SchedulerSettings,
    pub handshake_timeout: Duration,
    /// Upper bound on masters connected at once.
    pub max_connected_masters: Option<usize>,
}

impl CoordinatorSettings {
    pub fn new(organization: Organization) -> Self {
        Self {
            organization,
            properties: BTreeMap::new(),
            scheduler: SchedulerSettings::default(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            max_connected_masters: None,
        }
    }
}

/// The running coordinator.
pub struct Coordinator {
    registry: Arc<MasterRegistry>,
    events: Arc<ListenerRegistry>,
    provisioner: MasterProvisioner,
    listener: Arc<CoordinatorAgentListener>,
    engine: Arc<ProtocolEngine>,
    shutdown: watch::Sender<bool>,
    endpoints: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("masters", &self.registry.len())
            .field("connected", &self.listener.connected())
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    /// Start the coordinator on the current runtime.
    ///
    /// With a `store`, persisted masters are restored first and every
    /// later transition is written back.
    pub fn start(
        settings: CoordinatorSettings,
        tls: TlsConfig,
        backends: Vec<Arc<dyn ProvisioningBackend>>,
        events: Arc<ListenerRegistry>,
        store: Option<Arc<dyn MasterStore>>,
    ) -> CoordinatorResult<Self> {
        let registry = Arc::new(MasterRegistry::new());

        let mut sink: Option<Arc<StoreListener>> = None;
        if let Some(store) = store {
            let records = store.load()?;
            let restored = registry.restore(records)?;
            info!(restored, "restored persisted masters");
            let listener = Arc::new(StoreListener::new(store, registry.records()?));
            events.register(listener.clone());
            sink = Some(listener);
        }

        let mut provisioner =
            MasterProvisioner::spawn(registry.clone(), events.clone(), backends, settings.scheduler)?;
        if let Some(sink) = sink {
            provisioner = provisioner.with_record_sink(sink);
        }

        let listener = Arc::new(CoordinatorAgentListener::new(
            registry.clone(),
            events.clone(),
            settings.max_connected_masters,
        ));
        let engine = ProtocolEngine::new(tls, settings.organization, listener.clone(), events.clone())
            .with_properties(settings.properties)
            .with_handshake_timeout(settings.handshake_timeout);
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            registry,
            events,
            provisioner,
            listener,
            engine: Arc::new(engine),
            shutdown,
            endpoints: Mutex::new(Vec::new()),
        })
    }

    // =========================================================================
    // MASTER OPERATIONS
    // =========================================================================

    /// Record a new master for `organization`.
    pub fn create_master(&self, organization: Organization) -> CoordinatorResult<MasterSnapshot> {
        let master = self.registry.create(organization)?;
        let master = lock_master(&master)?;
        self.events.fire_master(MasterEvent::Created {
            organization: master.organization().clone(),
            id: master.id(),
        });
        info!(organization = %master.organization(), "master created");
        Ok(master.snapshot())
    }

    /// Request provisioning. Returns `false` when nothing changed.
    pub fn provision_master(&self, organization: &Organization) -> CoordinatorResult<bool> {
        Ok(self.provisioner.provision(organization)?)
    }

    /// Request termination. Returns `false` when nothing changed.
    pub fn terminate(&self, organization: &Organization, forced: bool) -> CoordinatorResult<bool> {
        Ok(self.provisioner.terminate(organization, forced)?)
    }

    pub fn master(&self, organization: &Organization) -> CoordinatorResult<MasterSnapshot> {
        let master = self.registry.get(organization)?;
        let snapshot = lock_master(&master)?.snapshot();
        Ok(snapshot)
    }

    pub fn masters(&self) -> CoordinatorResult<Vec<MasterSnapshot>> {
        Ok(self.registry.snapshots()?)
    }

    /// Masters whose instance is up and not yet confirmed gone.
    pub fn provisioned_masters(&self) -> CoordinatorResult<Vec<MasterSnapshot>> {
        Ok(self.registry.provisioned()?)
    }

    /// Live channel to a connected master.
    pub fn channel(&self, organization: &Organization) -> CoordinatorResult<Option<Channel>> {
        let master = self.registry.get(organization)?;
        let channel = lock_master(&master)?.channel().cloned();
        Ok(channel)
    }

    pub fn connected_masters(&self) -> usize {
        self.listener.connected()
    }

    pub fn backend_status(&self) -> Vec<BackendStatus> {
        self.provisioner.backend_status()
    }

    pub fn cadence(&self) -> &CadenceHandle {
        self.provisioner.cadence()
    }

    pub fn reconcile_now(&self) -> CoordinatorResult<()> {
        Ok(self.provisioner.reconcile_now()?)
    }

    pub fn registry(&self) -> &Arc<MasterRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &Arc<ListenerRegistry> {
        &self.events
    }

    pub fn provisioner(&self) -> &MasterProvisioner {
        &self.provisioner
    }

    // =========================================================================
    // AGENT ENDPOINT
    // =========================================================================

    /// Listen for master agents on `addr`. Returns the bound address.
    pub async fn serve_agents(&self, addr: SocketAddr) -> CoordinatorResult<SocketAddr> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| CoordinatorError::Endpoint(format!("bind {addr}: {e}")))?;
        let local = listener
            .local_addr()
            .map_err(|e| CoordinatorError::Endpoint(e.to_string()))?;
        let task = tokio::spawn(self.engine.clone().serve(listener, self.shutdown.subscribe()));
        self.endpoints
            .lock()
            .map_err(|_| CoordinatorError::Endpoint("Lock poisoned".into()))?
            .push(task);
        Ok(local)
    }

    /// Stop the agent endpoints and the scheduler, then close every live
    /// channel.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let endpoints: Vec<JoinHandle<()>> = self
            .endpoints
            .lock()
            .map(|mut e| e.drain(..).collect())
            .unwrap_or_default();
        for endpoint in endpoints {
            let _ = endpoint.await;
        }
        self.provisioner.shutdown().await;

        for master in self.registry.all() {
            if let Ok(master) = lock_master(&master) {
                if let Some(channel) = master.channel() {
                    channel.close("coordinator shutting down");
                }
            }
        }
        info!("coordinator stopped");
    }
}

// =============================================================================
// ACCEPTOR POLICY
// =============================================================================

/// Decides which masters may connect and binds their channels.
///
/// Entity locks are taken one at a time and never while holding the
/// listener's own bookkeeping lock.
pub struct CoordinatorAgentListener {
    registry: Arc<MasterRegistry>,
    events: Arc<ListenerRegistry>,
    max_connected: Option<usize>,
    /// Reserved attempts plus live channels.
    slots: Arc<AtomicUsize>,
    /// Attempts currently holding a slot.
    holding: Mutex<HashSet<Uuid>>,
}

impl std::fmt::Debug for CoordinatorAgentListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorAgentListener")
            .field("max_connected", &self.max_connected)
            .field("slots", &self.slots.load(Ordering::SeqCst))
            .finish()
    }
}

impl CoordinatorAgentListener {
    pub fn new(
        registry: Arc<MasterRegistry>,
        events: Arc<ListenerRegistry>,
        max_connected: Option<usize>,
    ) -> Self {
        Self {
            registry,
            events,
            max_connected,
            slots: Arc::new(AtomicUsize::new(0)),
            holding: Mutex::new(HashSet::new()),
        }
    }

    /// Masters holding a connection slot.
    pub fn connected(&self) -> usize {
        self.slots.load(Ordering::SeqCst)
    }

    fn take_slot(&self) -> Result<(), ConnectError> {
        let limit = self.max_connected.unwrap_or(usize::MAX);
        self.slots
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < limit).then_some(n + 1))
            .map(|_| ())
            .map_err(|_| ConnectError::Refused(RefusalReason::QuotaExceeded { limit }))
    }

    fn give_back(&self, attempt_id: Option<Uuid>) {
        let Some(attempt_id) = attempt_id else {
            return;
        };
        let held = self
            .holding
            .lock()
            .map(|mut h| h.remove(&attempt_id))
            .unwrap_or(false);
        if held {
            self.slots.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn check_identity(
        attempt: &ConnectionAttempt,
        pinned: Option<&str>,
    ) -> Result<(), SecurityError> {
        attempt.verify_organization_claim()?;
        let identity = &attempt.identity;
        if let Some(pinned) = pinned {
            if pinned != identity.fingerprint {
                return Err(SecurityError::IdentityMismatch {
                    organization: attempt.organization.to_string(),
                    expected: pinned.to_string(),
                    presented: identity.fingerprint.clone(),
                });
            }
            return Ok(());
        }
        // No O= attribute and nothing pinned yet: the common name must name
        // the organization.
        if identity.organization.is_none()
            && identity.common_name.as_deref() != Some(attempt.organization.as_str())
        {
            return Err(SecurityError::OrganizationMismatch {
                declared: attempt.organization.to_string(),
                certified: identity.common_name.clone().unwrap_or_default(),
            });
        }
        Ok(())
    }
}

fn endpoint_fault(e: MasterError) -> ConnectError {
    ConnectError::Io(e.to_string())
}

impl AgentListener for CoordinatorAgentListener {
    fn on_connecting_to(&self, attempt: &ConnectionAttempt) -> Result<(), ConnectError> {
        let master = match self.registry.get(&attempt.organization) {
            Ok(master) => master,
            Err(MasterError::NotFound(_)) => {
                return Err(ConnectError::Refused(RefusalReason::UnknownOrganization))
            }
            Err(e) => return Err(endpoint_fault(e)),
        };
        let mut master = lock_master(&master).map_err(endpoint_fault)?;

        match master.state() {
            MasterState::Created | MasterState::Provisioning => {
                return Err(ConnectError::Refused(RefusalReason::NotYetProvisioned))
            }
            MasterState::Approved => {
                return Err(ConnectError::Refused(RefusalReason::DuplicateConnection))
            }
            MasterState::Provisioned if master.termination().is_none() => {}
            state => {
                let state = if master.termination().is_some() {
                    MasterState::Terminating
                } else {
                    state
                };
                return Err(ConnectError::Refused(RefusalReason::NotAccepting {
                    state: state.to_string(),
                }));
            }
        }
        if master.pending_attempt().is_some() {
            return Err(ConnectError::Refused(RefusalReason::DuplicateConnection));
        }

        Self::check_identity(attempt, master.identity_fingerprint())?;
        self.take_slot()?;

        master.reserve_attempt(attempt.canceller());
        if let Ok(mut holding) = self.holding.lock() {
            holding.insert(attempt.id);
        }
        debug!(organization = %attempt.organization, attempt = %attempt.id, "reserved master for attempt");
        Ok(())
    }

    fn on_connected_to(
        &self,
        attempt: &ConnectionAttempt,
        channel: &Channel,
    ) -> Result<(), ConnectError> {
        let master_ref = self.registry.get(&attempt.organization).map_err(endpoint_fault)?;
        {
            let mut master = lock_master(&master_ref).map_err(endpoint_fault)?;
            if attempt.is_cancelled() || master.pending_attempt() != Some(attempt.id) {
                return Err(ConnectError::Refused(RefusalReason::Cancelled));
            }
            let fingerprint = attempt.identity.fingerprint.clone();
            if master.attach_channel(channel.clone(), fingerprint.clone()).is_err() {
                return Err(ConnectError::Refused(RefusalReason::NotAccepting {
                    state: master.state().to_string(),
                }));
            }
            self.events.fire_master(MasterEvent::Approved {
                organization: attempt.organization.clone(),
                channel_id: channel.id(),
                fingerprint,
            });
        }

        // The slot now belongs to the channel.
        if let Ok(mut holding) = self.holding.lock() {
            holding.remove(&attempt.id);
        }

        let registry = self.registry.clone();
        let events = self.events.clone();
        let slots = self.slots.clone();
        let channel = channel.clone();
        tokio::spawn(async move {
            let reason = channel.closed().await;
            slots.fetch_sub(1, Ordering::SeqCst);
            let organization = channel.organization().clone();
            let Ok(master) = registry.get(&organization) else {
                return;
            };
            let Ok(mut master) = lock_master(&master) else {
                return;
            };
            match master.detach_channel(channel.id()) {
                Ok(true) => {
                    info!(%organization, channel = %channel.id(), %reason, "master disconnected");
                    events.fire_master(MasterEvent::Disconnected {
                        organization,
                        channel_id: channel.id(),
                    });
                }
                Ok(false) => {}
                Err(e) => warn!(%organization, error = %e, "failed to detach channel"),
            }
        });
        Ok(())
    }

    fn on_refusal(&self, refusal: &Refusal) {
        self.release(refusal.attempt_id, refusal.organization.as_ref());
    }

    fn on_error(
        &self,
        attempt_id: Option<Uuid>,
        organization: Option<&Organization>,
        _failure: &ConnectionFailure,
    ) {
        self.release(attempt_id, organization);
    }
}

impl CoordinatorAgentListener {
    fn release(&self, attempt_id: Option<Uuid>, organization: Option<&Organization>) {
        if let (Some(attempt_id), Some(organization)) = (attempt_id, organization) {
            if let Ok(master) = self.registry.get(organization) {
                if let Ok(mut master) = lock_master(&master) {
                    master.release_attempt(attempt_id);
                }
            }
        }
        self.give_back(attempt_id);
    }
}
