//! # Master Entity
//!
//! The coordinator's record of one tenant master. Entities are owned by the
//! [`MasterRegistry`](super::MasterRegistry) and always accessed through
//! their per-entity lock; backends only ever see an [`InstanceHandle`].

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::MasterResult;
use super::organization::Organization;
use super::state::MasterState;
use crate::backend::{InstanceHandle, ProvisionedInstance};
use crate::protocol::{AttemptCanceller, Channel};

/// An accepted request to tear a master down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminationRequest {
    /// Forced teardown skips backend confirmation.
    pub forced: bool,
}

/// One tenant master.
#[derive(Debug)]
pub struct MasterServer {
    id: Uuid,
    organization: Organization,
    state: MasterState,
    endpoint: Option<String>,
    channel: Option<Channel>,
    approved: bool,
    identity_fingerprint: Option<String>,
    provision_requested: bool,
    termination: Option<TerminationRequest>,
    handle: Option<InstanceHandle>,
    attempts: u32,
    retry_at: Option<Instant>,
    last_backend: Option<String>,
    last_error: Option<String>,
    pending_attempt: Option<AttemptCanceller>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl MasterServer {
    /// Create a new master record in `Created`.
    pub fn new(organization: Organization) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            organization,
            state: MasterState::Created,
            endpoint: None,
            channel: None,
            approved: false,
            identity_fingerprint: None,
            provision_requested: false,
            termination: None,
            handle: None,
            attempts: 0,
            retry_at: None,
            last_backend: None,
            last_error: None,
            pending_attempt: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Rebuild an entity from a persisted record.
    ///
    /// No channel survives a restart, so approved masters come back as
    /// `Provisioned` and wait for their agent to dial in again. Half-done
    /// work is re-requested rather than resumed.
    pub fn from_record(record: MasterRecord) -> Self {
        let mut master = Self::new(record.organization);
        master.id = record.id;
        master.endpoint = record.endpoint;
        master.identity_fingerprint = record.identity_fingerprint;
        master.handle = record.handle;
        master.last_backend = record.last_backend;
        master.last_error = record.last_error;
        master.created_at = record.created_at;

        master.state = match record.state {
            MasterState::Provisioning => {
                master.provision_requested = true;
                master.handle = None;
                MasterState::Created
            }
            MasterState::Approved => MasterState::Provisioned,
            MasterState::Terminating => {
                master.termination = Some(
                    record
                        .termination
                        .unwrap_or(TerminationRequest { forced: false }),
                );
                MasterState::Terminating
            }
            MasterState::Created => {
                master.provision_requested = record.provision_requested;
                MasterState::Created
            }
            other => other,
        };
        if master.state != MasterState::Terminated {
            if let Some(request) = record.termination {
                master.termination = Some(request);
                master.provision_requested = false;
            }
        }
        master
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn organization(&self) -> &Organization {
        &self.organization
    }

    pub fn state(&self) -> MasterState {
        self.state
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    /// Live channel, present only while `Approved`.
    pub fn channel(&self) -> Option<&Channel> {
        self.channel.as_ref()
    }

    pub fn is_approved(&self) -> bool {
        self.approved
    }

    pub fn identity_fingerprint(&self) -> Option<&str> {
        self.identity_fingerprint.as_deref()
    }

    pub fn provision_requested(&self) -> bool {
        self.provision_requested
    }

    pub fn termination(&self) -> Option<TerminationRequest> {
        self.termination
    }

    pub fn handle(&self) -> Option<&InstanceHandle> {
        self.handle.as_ref()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn retry_at(&self) -> Option<Instant> {
        self.retry_at
    }

    pub fn last_backend(&self) -> Option<&str> {
        self.last_backend.as_deref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Id of the connection attempt currently holding this entity.
    pub fn pending_attempt(&self) -> Option<Uuid> {
        self.pending_attempt.as_ref().map(AttemptCanceller::attempt_id)
    }

    fn transition(
        &mut self,
        next: impl FnOnce(MasterState) -> MasterResult<MasterState>,
    ) -> MasterResult<MasterState> {
        let next = next(self.state)?;
        self.state = next;
        self.updated_at = Utc::now();

        if !next.allows_channel() {
            if let Some(channel) = self.channel.take() {
                channel.close(format!("master entered {}", next));
            }
        }
        if next == MasterState::Terminated {
            self.handle = None;
            self.approved = false;
            self.retry_at = None;
            if let Some(pending) = self.pending_attempt.take() {
                pending.cancel();
            }
        }
        Ok(next)
    }

    // =========================================================================
    // DESIRED STATE (written by the public API, read by reconciliation)
    // =========================================================================

    /// Ask for this master to be provisioned.
    ///
    /// Returns `false` when the request changes nothing: the entity is
    /// already being provisioned, is past provisioning, or is being torn
    /// down. A `ProvisioningFailed` entity is reset and tried afresh.
    pub fn request_provisioning(&mut self) -> MasterResult<bool> {
        if self.termination.is_some() {
            return Ok(false);
        }
        match self.state {
            MasterState::Created if !self.provision_requested => {
                self.provision_requested = true;
                self.updated_at = Utc::now();
                Ok(true)
            }
            MasterState::ProvisioningFailed => {
                self.transition(MasterState::reset)?;
                self.provision_requested = true;
                self.attempts = 0;
                self.last_error = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Ask for this master to be torn down.
    ///
    /// A forced request upgrades a pending graceful one. Returns `false`
    /// when nothing changed.
    pub fn request_termination(&mut self, forced: bool) -> bool {
        if self.state == MasterState::Terminated {
            return false;
        }
        match self.termination {
            Some(existing) if existing.forced || !forced => false,
            _ => {
                self.termination = Some(TerminationRequest { forced });
                self.provision_requested = false;
                self.updated_at = Utc::now();
                true
            }
        }
    }

    // =========================================================================
    // PROVISIONING
    // =========================================================================

    /// Whether a reconciliation pass should dispatch a start for this entity.
    pub fn wants_dispatch(&self, now: Instant) -> bool {
        if self.termination.is_some() {
            return false;
        }
        match self.state {
            MasterState::Created => self.provision_requested,
            MasterState::Provisioning => self.retry_at.map(|at| at <= now).unwrap_or(false),
            _ => false,
        }
    }

    /// Record a start dispatched to `backend`.
    ///
    /// Returns `true` on the first dispatch, when the entity enters
    /// `Provisioning`; retries stay in `Provisioning` and return `false`.
    pub fn record_dispatch(&mut self, backend: &str) -> MasterResult<bool> {
        let first = self.state == MasterState::Created;
        if first {
            self.transition(MasterState::begin_provisioning)?;
            self.provision_requested = false;
        }
        self.attempts += 1;
        self.retry_at = None;
        self.last_backend = Some(backend.to_string());
        self.updated_at = Utc::now();
        Ok(first)
    }

    /// The backend reported the instance running and reachable.
    pub fn mark_provisioned(&mut self, instance: ProvisionedInstance) -> MasterResult<()> {
        self.transition(MasterState::mark_provisioned)?;
        self.endpoint = Some(instance.endpoint);
        self.handle = Some(instance.handle);
        self.last_error = None;
        Ok(())
    }

    /// A start failed but will be retried at `at`.
    pub fn schedule_retry(&mut self, at: Instant, error: String) {
        self.retry_at = Some(at);
        self.last_error = Some(error);
        self.updated_at = Utc::now();
    }

    /// Retries exhausted.
    pub fn fail_provisioning(&mut self, error: String) -> MasterResult<()> {
        self.transition(MasterState::fail_provisioning)?;
        self.last_error = Some(error);
        Ok(())
    }

    // =========================================================================
    // CONNECTION
    // =========================================================================

    /// Hold this entity for one connection attempt.
    pub fn reserve_attempt(&mut self, canceller: AttemptCanceller) {
        self.pending_attempt = Some(canceller);
    }

    /// Drop the reservation if it still belongs to `attempt_id`.
    pub fn release_attempt(&mut self, attempt_id: Uuid) -> bool {
        match &self.pending_attempt {
            Some(pending) if pending.attempt_id() == attempt_id => {
                self.pending_attempt = None;
                true
            }
            _ => false,
        }
    }

    /// Attach the channel produced by a completed handshake and approve.
    pub fn attach_channel(&mut self, channel: Channel, fingerprint: String) -> MasterResult<()> {
        self.transition(MasterState::approve)?;
        self.pending_attempt = None;
        self.channel = Some(channel);
        self.identity_fingerprint = Some(fingerprint);
        self.approved = true;
        Ok(())
    }

    /// The channel `channel_id` went away.
    ///
    /// Returns `false` when the entity has already moved on (a newer
    /// channel, or termination closed it).
    pub fn detach_channel(&mut self, channel_id: Uuid) -> MasterResult<bool> {
        let matches = self
            .channel
            .as_ref()
            .map(|c| c.id() == channel_id)
            .unwrap_or(false);
        if !matches || self.state != MasterState::Approved {
            return Ok(false);
        }
        self.transition(MasterState::disconnect)?;
        self.approved = false;
        Ok(true)
    }

    // =========================================================================
    // TERMINATION
    // =========================================================================

    /// Enter `Terminating`; closes the channel and cancels any handshake in
    /// flight for this entity.
    pub fn begin_terminating(&mut self) -> MasterResult<()> {
        self.transition(MasterState::begin_terminating)?;
        self.provision_requested = false;
        self.retry_at = None;
        if let Some(pending) = self.pending_attempt.take() {
            pending.cancel();
        }
        Ok(())
    }

    /// Enter `Terminated`; channel and handle are cleared.
    pub fn mark_terminated(&mut self) -> MasterResult<()> {
        self.transition(MasterState::mark_terminated)?;
        self.termination = None;
        Ok(())
    }

    /// Record a non-fatal error against the entity.
    pub fn record_error(&mut self, error: String) {
        self.last_error = Some(error);
        self.updated_at = Utc::now();
    }

    /// Serializable view for diagnostics and the admin API.
    pub fn snapshot(&self) -> MasterSnapshot {
        MasterSnapshot {
            id: self.id,
            organization: self.organization.clone(),
            state: self.state,
            endpoint: self.endpoint.clone(),
            approved: self.approved,
            channel_id: self.channel.as_ref().map(Channel::id),
            identity_fingerprint: self.identity_fingerprint.clone(),
            provision_requested: self.provision_requested,
            termination: self.termination,
            attempts: self.attempts,
            last_backend: self.last_backend.clone(),
            last_error: self.last_error.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    /// Durable subset of the entity.
    pub fn record(&self) -> MasterRecord {
        MasterRecord {
            id: self.id,
            organization: self.organization.clone(),
            state: self.state,
            endpoint: self.endpoint.clone(),
            identity_fingerprint: self.identity_fingerprint.clone(),
            provision_requested: self.provision_requested,
            termination: self.termination,
            handle: self.handle.clone(),
            last_backend: self.last_backend.clone(),
            last_error: self.last_error.clone(),
            created_at: self.created_at,
        }
    }
}

/// Point-in-time view of a master.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterSnapshot {
    pub id: Uuid,
    pub organization: Organization,
    pub state: MasterState,
    pub endpoint: Option<String>,
    pub approved: bool,
    pub channel_id: Option<Uuid>,
    pub identity_fingerprint: Option<String>,
    pub provision_requested: bool,
    pub termination: Option<TerminationRequest>,
    pub attempts: u32,
    pub last_backend: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Persisted form of a master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterRecord {
    pub id: Uuid,
    pub organization: Organization,
    pub state: MasterState,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub identity_fingerprint: Option<String>,
    #[serde(default)]
    pub provision_requested: bool,
    #[serde(default)]
    pub termination: Option<TerminationRequest>,
    #[serde(default)]
    pub handle: Option<InstanceHandle>,
    #[serde(default)]
    pub last_backend: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn org(name: &str) -> Organization {
        Organization::new(name).unwrap()
    }

    fn instance(org: &Organization) -> ProvisionedInstance {
        ProvisionedInstance {
            handle: InstanceHandle::new("pool", org.clone()),
            endpoint: format!("https://{org}.masters.test/"),
        }
    }

    #[test]
    fn test_request_provisioning_is_idempotent() {
        let mut master = MasterServer::new(org("org0"));
        assert!(master.request_provisioning().unwrap());
        assert!(!master.request_provisioning().unwrap());

        assert!(master.record_dispatch("pool").unwrap());
        assert_eq!(master.state(), MasterState::Provisioning);
        assert!(!master.request_provisioning().unwrap());
        assert_eq!(master.attempts(), 1);
    }

    #[test]
    fn test_retry_dispatch_does_not_reenter_provisioning() {
        let mut master = MasterServer::new(org("org0"));
        master.request_provisioning().unwrap();
        assert!(master.record_dispatch("pool").unwrap());

        let now = Instant::now();
        master.schedule_retry(now, "boom".into());
        assert!(master.wants_dispatch(now));
        assert!(!master.record_dispatch("pool").unwrap());
        assert_eq!(master.attempts(), 2);
        assert_eq!(master.last_error(), Some("boom"));
    }

    #[test]
    fn test_failed_entity_keeps_diagnostics_and_can_reset() {
        let mut master = MasterServer::new(org("org0"));
        master.request_provisioning().unwrap();
        master.record_dispatch("cloud-a").unwrap();
        master.fail_provisioning("quota".into()).unwrap();

        let snapshot = master.snapshot();
        assert_eq!(snapshot.state, MasterState::ProvisioningFailed);
        assert_eq!(snapshot.last_backend.as_deref(), Some("cloud-a"));
        assert_eq!(snapshot.last_error.as_deref(), Some("quota"));

        assert!(master.request_provisioning().unwrap());
        assert_eq!(master.state(), MasterState::Created);
        assert_eq!(master.attempts(), 0);
    }

    #[test]
    fn test_termination_clears_handle_and_provision_flag() {
        let o = org("org0");
        let mut master = MasterServer::new(o.clone());
        master.request_provisioning().unwrap();
        master.record_dispatch("pool").unwrap();
        master.mark_provisioned(instance(&o)).unwrap();
        assert!(master.handle().is_some());

        assert!(master.request_termination(false));
        assert!(master.request_termination(true));
        assert!(!master.request_termination(false));

        master.begin_terminating().unwrap();
        master.mark_terminated().unwrap();
        assert_eq!(master.state(), MasterState::Terminated);
        assert!(master.handle().is_none());
        assert!(master.channel().is_none());
        assert!(!master.request_termination(true));
    }

    #[test]
    fn test_termination_blocks_dispatch() {
        let mut master = MasterServer::new(org("org0"));
        master.request_provisioning().unwrap();
        master.request_termination(false);
        assert!(!master.wants_dispatch(Instant::now()));
        assert!(!master.request_provisioning().unwrap());
    }

    #[test]
    fn test_record_roundtrip_normalises_in_flight_states() {
        let o = org("org0");
        let mut master = MasterServer::new(o.clone());
        master.request_provisioning().unwrap();
        master.record_dispatch("pool").unwrap();

        let restored = MasterServer::from_record(master.record());
        assert_eq!(restored.state(), MasterState::Created);
        assert!(restored.provision_requested());
        assert_eq!(restored.id(), master.id());

        let mut record = master.record();
        record.state = MasterState::Approved;
        let restored = MasterServer::from_record(record);
        assert_eq!(restored.state(), MasterState::Provisioned);
        assert!(restored.channel().is_none());
    }

    #[test]
    fn test_record_keeps_pending_requests() {
        let mut master = MasterServer::new(org("org0"));
        master.request_provisioning().unwrap();
        let restored = MasterServer::from_record(master.record());
        assert!(restored.provision_requested());
        assert!(restored.termination().is_none());

        let mut record = master.record();
        record.state = MasterState::Provisioned;
        record.provision_requested = false;
        record.termination = Some(TerminationRequest { forced: true });
        let restored = MasterServer::from_record(record.clone());
        assert_eq!(restored.termination(), Some(TerminationRequest { forced: true }));
        assert!(!restored.wants_dispatch(Instant::now()));

        record.state = MasterState::Terminated;
        let restored = MasterServer::from_record(record);
        assert!(restored.termination().is_none());
    }
}
