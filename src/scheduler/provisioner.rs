//! # Master Provisioner
//!
//! The lifecycle scheduler. One actor task owns every capacity counter and
//! runs reconciliation passes on the configured cadence, on request, and
//! whenever a backend call completes. Backend calls run on their own tasks
//! and report back over a completion channel; the actor never awaits one.
//!
//! A pass handles, in order:
//! 1. termination requests, which win over pending provisioning: in-flight
//!    starts are aborted and their capacity released;
//! 2. failed starts whose retry is due;
//! 3. new provisioning requests.
//!
//! Provisioning goes first-fit over backends in registration order. When
//! no backend has room the request simply waits for a later pass.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::cadence::{Cadence, CadenceHandle};
use super::capacity::{BackendStatus, CapacityCounter};
use super::clock::{Clock, TokioClock};
use super::errors::{SchedulerError, SchedulerResult};
use super::retry::RetryPolicy;
use crate::backend::{BackendResult, InstanceHandle, ProvisionedInstance, ProvisioningBackend};
use crate::events::{ListenerRegistry, MasterEvent};
use crate::master::{
    lock_master, MasterRef, MasterRegistry, MasterResult, MasterServer, MasterState, Organization,
    RecordSink,
};

/// Scheduler tunables.
#[derive(Debug, Clone, Default)]
pub struct SchedulerSettings {
    pub cadence: Cadence,
    pub retry: RetryPolicy,
}

enum Command {
    Reconcile,
    Shutdown(oneshot::Sender<()>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopPurpose {
    /// Graceful teardown the entity waits for.
    Graceful,
    /// Forced teardown after a failed graceful one; the entity waits for it.
    Escalated,
    /// Fire-and-forget cleanup; the entity has already moved on.
    Cleanup,
}

enum Completion {
    Started {
        organization: Organization,
        dispatch: Uuid,
        result: BackendResult<ProvisionedInstance>,
    },
    Stopped {
        organization: Organization,
        handle: InstanceHandle,
        purpose: StopPurpose,
        result: BackendResult<()>,
    },
}

struct BackendSlot {
    backend: Arc<dyn ProvisioningBackend>,
    counter: CapacityCounter,
    dispatched: u64,
    failures: u64,
}

struct InFlightStart {
    backend: usize,
    dispatch: Uuid,
    task: AbortHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dispatch {
    Skipped,
    Dispatched,
    NoCapacity,
}

/// Handle to the scheduler task.
pub struct MasterProvisioner {
    registry: Arc<MasterRegistry>,
    commands: mpsc::UnboundedSender<Command>,
    cadence: CadenceHandle,
    status: watch::Receiver<Vec<BackendStatus>>,
    passes: watch::Receiver<u64>,
    task: Mutex<Option<JoinHandle<()>>>,
    requests: Option<Arc<dyn RecordSink>>,
}

impl std::fmt::Debug for MasterProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterProvisioner")
            .field("cadence", &self.cadence.get())
            .field("backends", &*self.status.borrow())
            .finish()
    }
}

impl MasterProvisioner {
    /// Start the scheduler task on the current runtime.
    pub fn spawn(
        registry: Arc<MasterRegistry>,
        events: Arc<ListenerRegistry>,
        backends: Vec<Arc<dyn ProvisioningBackend>>,
        settings: SchedulerSettings,
    ) -> SchedulerResult<Self> {
        Self::spawn_with_clock(registry, events, backends, settings, Arc::new(TokioClock))
    }

    pub fn spawn_with_clock(
        registry: Arc<MasterRegistry>,
        events: Arc<ListenerRegistry>,
        backends: Vec<Arc<dyn ProvisioningBackend>>,
        settings: SchedulerSettings,
        clock: Arc<dyn Clock>,
    ) -> SchedulerResult<Self> {
        if backends.is_empty() {
            return Err(SchedulerError::NoBackends);
        }
        let mut seen = std::collections::HashSet::new();
        for backend in &backends {
            if !seen.insert(backend.name().to_string()) {
                return Err(SchedulerError::DuplicateBackend(backend.name().to_string()));
            }
            if backend.capacity() == 0 {
                warn!(backend = backend.name(), "backend has zero capacity and will never be used");
            }
        }
        settings.cadence.validate()?;
        settings.retry.validate()?;

        let cadence = CadenceHandle::new(settings.cadence);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let slots: Vec<BackendSlot> = backends
            .into_iter()
            .map(|backend| BackendSlot {
                counter: CapacityCounter::new(backend.capacity()),
                backend,
                dispatched: 0,
                failures: 0,
            })
            .collect();
        let (status_tx, status_rx) = watch::channel(statuses(&slots));
        let (passes_tx, passes_rx) = watch::channel(0);

        let actor = Actor {
            registry: registry.clone(),
            events,
            backends: slots,
            retry: settings.retry,
            clock,
            cadence: cadence.clone(),
            starts: HashMap::new(),
            stops: HashMap::new(),
            completions: completion_tx,
            retry_wake: None,
            status: status_tx,
            passes: passes_tx,
        };
        let task = tokio::spawn(actor.run(command_rx, completion_rx));

        Ok(Self {
            registry,
            commands: command_tx,
            cadence,
            status: status_rx,
            passes: passes_rx,
            task: Mutex::new(Some(task)),
            requests: None,
        })
    }

    /// Persist accepted requests through `sink` before they are scheduled.
    pub fn with_record_sink(mut self, sink: Arc<dyn RecordSink>) -> Self {
        self.requests = Some(sink);
        self
    }

    /// Ask for `organization` to be provisioned. Returns `false` when the
    /// request changed nothing.
    pub fn provision(&self, organization: &Organization) -> SchedulerResult<bool> {
        let master = self.registry.get(organization)?;
        let changed = {
            let mut master = lock_master(&master)?;
            let changed = master.request_provisioning()?;
            if changed {
                self.persist_request(&master);
            }
            changed
        };
        if changed {
            self.reconcile_now()?;
        }
        Ok(changed)
    }

    /// Ask for `organization` to be torn down. Returns `false` when the
    /// request changed nothing.
    pub fn terminate(&self, organization: &Organization, forced: bool) -> SchedulerResult<bool> {
        let master = self.registry.get(organization)?;
        let changed = {
            let mut master = lock_master(&master)?;
            let changed = master.request_termination(forced);
            if changed {
                self.persist_request(&master);
            }
            changed
        };
        if changed {
            self.reconcile_now()?;
        }
        Ok(changed)
    }

    fn persist_request(&self, master: &MasterServer) {
        let Some(sink) = &self.requests else { return };
        if let Err(e) = sink.record_changed(&master.record()) {
            warn!(organization = %master.organization(), error = %e, "failed to persist request");
        }
    }

    /// Run a pass as soon as the scheduler is free.
    pub fn reconcile_now(&self) -> SchedulerResult<()> {
        self.commands
            .send(Command::Reconcile)
            .map_err(|_| SchedulerError::Stopped)
    }

    pub fn backend_status(&self) -> Vec<BackendStatus> {
        self.status.borrow().clone()
    }

    /// Runtime-settable cadence.
    pub fn cadence(&self) -> &CadenceHandle {
        &self.cadence
    }

    /// Passes completed so far.
    pub fn passes(&self) -> u64 {
        *self.passes.borrow()
    }

    /// Wait until at least `count` passes have completed.
    pub async fn wait_for_passes(&self, count: u64) -> SchedulerResult<()> {
        let mut passes = self.passes.clone();
        passes
            .wait_for(|n| *n >= count)
            .await
            .map(|_| ())
            .map_err(|_| SchedulerError::Stopped)
    }

    /// Stop the scheduler. In-flight starts are aborted.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
        let task = self.task.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

fn statuses(slots: &[BackendSlot]) -> Vec<BackendStatus> {
    slots
        .iter()
        .map(|slot| BackendStatus {
            name: slot.backend.name().to_string(),
            capacity: slot.counter.max(),
            in_flight: slot.counter.in_flight(),
            peak: slot.counter.peak(),
            dispatched: slot.dispatched,
            failures: slot.failures,
        })
        .collect()
}

struct Actor {
    registry: Arc<MasterRegistry>,
    events: Arc<ListenerRegistry>,
    backends: Vec<BackendSlot>,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    // Held so the cadence watch never closes under the actor.
    cadence: CadenceHandle,
    starts: HashMap<Organization, InFlightStart>,
    /// Stops an entity in `Terminating` is waiting on.
    stops: HashMap<Organization, InstanceHandle>,
    completions: mpsc::UnboundedSender<Completion>,
    retry_wake: Option<Instant>,
    status: watch::Sender<Vec<BackendStatus>>,
    passes: watch::Sender<u64>,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
    ) {
        let clock = self.clock.clone();
        let mut cadence_rx = self.cadence.subscribe();
        let started = clock.now();
        let mut next_pass = started + cadence_rx.borrow_and_update().initial_delay;
        let mut last_pass: Option<Instant> = None;
        info!(backends = self.backends.len(), "master provisioner started");

        loop {
            let deadline = match self.retry_wake {
                Some(at) if at < next_pass => at,
                _ => next_pass,
            };
            let wait = deadline.saturating_duration_since(clock.now());

            tokio::select! {
                _ = clock.sleep(wait) => {
                    let now = clock.now();
                    self.pass();
                    if now >= next_pass {
                        last_pass = Some(now);
                        next_pass = now + self.cadence.get().recurrence_period;
                    }
                }
                command = commands.recv() => match command {
                    Some(Command::Reconcile) => self.pass(),
                    Some(Command::Shutdown(done)) => {
                        self.abort_starts();
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        self.abort_starts();
                        break;
                    }
                },
                Some(completion) = completions.recv() => self.complete(completion),
                changed = cadence_rx.changed() => {
                    if changed.is_ok() {
                        let cadence = *cadence_rx.borrow_and_update();
                        next_pass = match last_pass {
                            Some(at) => at + cadence.recurrence_period,
                            None => started + cadence.initial_delay,
                        };
                        debug!(?cadence, "cadence changed");
                    }
                }
            }
        }
        info!("master provisioner stopped");
    }

    // =========================================================================
    // RECONCILIATION PASS
    // =========================================================================

    fn pass(&mut self) {
        let now = self.clock.now();
        let masters = self.registry.all();

        for master in &masters {
            if let Err(e) = self.reconcile_termination(master) {
                warn!(error = %e, "termination reconciliation failed");
            }
        }

        // Retries first, then new requests.
        'phases: for retries in [true, false] {
            for master in &masters {
                match self.dispatch_due(master, retries, now) {
                    Ok(Dispatch::NoCapacity) => break 'phases,
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "dispatch failed"),
                }
            }
        }

        self.retry_wake = masters
            .iter()
            .filter_map(|m| lock_master(m).ok().and_then(|m| m.retry_at()))
            .min();
        self.publish();
        self.passes.send_modify(|n| *n += 1);
    }

    fn reconcile_termination(&mut self, master: &MasterRef) -> MasterResult<()> {
        let mut master = lock_master(master)?;
        if master.termination().is_none() {
            return Ok(());
        }
        self.terminate_locked(&mut master, None)
    }

    /// Act on the termination request of a locked entity. `orphan` is an
    /// instance that started after the request was made.
    fn terminate_locked(
        &mut self,
        master: &mut MasterServer,
        orphan: Option<InstanceHandle>,
    ) -> MasterResult<()> {
        let Some(request) = master.termination() else {
            return Ok(());
        };
        let organization = master.organization().clone();
        let mut handle = master.handle().cloned().or(orphan);

        if let Some(start) = self.starts.remove(&organization) {
            start.task.abort();
            self.release(start.backend);
            debug!(%organization, "cancelled in-flight start");
        }

        if master.state() != MasterState::Terminating {
            master.begin_terminating()?;
            self.events.fire_master(MasterEvent::Terminating {
                organization: organization.clone(),
                forced: request.forced,
            });
        } else if let Some(in_flight) = self.stops.get(&organization).cloned() {
            if !request.forced {
                return Ok(());
            }
            // Forced request overtakes the graceful stop in flight.
            self.stops.remove(&organization);
            handle = Some(in_flight);
        }

        match (request.forced, handle) {
            (true, handle) => {
                if let Some(handle) = handle {
                    self.spawn_stop(organization, handle, false, StopPurpose::Cleanup);
                }
                self.mark_terminated(master)
            }
            (false, Some(handle)) => {
                self.stops.insert(organization.clone(), handle.clone());
                self.spawn_stop(organization, handle, true, StopPurpose::Graceful);
                Ok(())
            }
            (false, None) => self.mark_terminated(master),
        }
    }

    fn mark_terminated(&self, master: &mut MasterServer) -> MasterResult<()> {
        master.mark_terminated()?;
        self.events.fire_master(MasterEvent::Terminated {
            organization: master.organization().clone(),
        });
        Ok(())
    }

    fn dispatch_due(&mut self, master: &MasterRef, retries: bool, now: Instant) -> MasterResult<Dispatch> {
        let mut master = lock_master(master)?;
        let is_retry = master.state() == MasterState::Provisioning;
        if is_retry != retries
            || !master.wants_dispatch(now)
            || self.starts.contains_key(master.organization())
        {
            return Ok(Dispatch::Skipped);
        }

        let Some(index) = self.backends.iter().position(|s| s.counter.has_room()) else {
            return Ok(Dispatch::NoCapacity);
        };
        let slot = &mut self.backends[index];
        if !slot.counter.try_reserve() {
            return Ok(Dispatch::NoCapacity);
        }
        let backend = slot.backend.clone();

        let first = match master.record_dispatch(backend.name()) {
            Ok(first) => first,
            Err(e) => {
                self.release(index);
                return Err(e);
            }
        };
        self.backends[index].dispatched += 1;

        let organization = master.organization().clone();
        if first {
            self.events.fire_master(MasterEvent::Provisioning {
                organization: organization.clone(),
                backend: backend.name().to_string(),
            });
        } else {
            info!(%organization, backend = backend.name(), attempt = master.attempts(), "retrying master start");
        }

        let dispatch = Uuid::new_v4();
        let completions = self.completions.clone();
        let task_org = organization.clone();
        let task = tokio::spawn(async move {
            let result = backend.start_instance(&task_org).await;
            let _ = completions.send(Completion::Started {
                organization: task_org,
                dispatch,
                result,
            });
        });
        self.starts.insert(
            organization,
            InFlightStart {
                backend: index,
                dispatch,
                task: task.abort_handle(),
            },
        );
        Ok(Dispatch::Dispatched)
    }

    // =========================================================================
    // COMPLETIONS
    // =========================================================================

    fn complete(&mut self, completion: Completion) {
        let outcome = match completion {
            Completion::Started {
                organization,
                dispatch,
                result,
            } => self.start_completed(organization, dispatch, result),
            Completion::Stopped {
                organization,
                handle,
                purpose,
                result,
            } => self.stop_completed(organization, handle, purpose, result),
        };
        if let Err(e) = outcome {
            warn!(error = %e, "failed to apply backend completion");
        }
        // Capacity may have been freed.
        self.pass();
    }

    fn start_completed(
        &mut self,
        organization: Organization,
        dispatch: Uuid,
        result: BackendResult<ProvisionedInstance>,
    ) -> MasterResult<()> {
        let start = match self.starts.get(&organization) {
            Some(start) if start.dispatch == dispatch => self.starts.remove(&organization),
            _ => None,
        };
        let Some(start) = start else {
            // Cancelled while the start was already reporting back.
            if let Ok(instance) = result {
                debug!(%organization, "stopping instance from cancelled start");
                self.spawn_stop(organization, instance.handle, false, StopPurpose::Cleanup);
            }
            return Ok(());
        };
        self.release(start.backend);
        let backend_name = self.backends[start.backend].backend.name().to_string();

        let master_ref = match self.registry.get(&organization) {
            Ok(master) => master,
            Err(e) => {
                if let Ok(instance) = result {
                    self.spawn_stop(organization, instance.handle, false, StopPurpose::Cleanup);
                }
                return Err(e);
            }
        };
        let mut master = lock_master(&master_ref)?;

        if master.termination().is_some() {
            let orphan = result.ok().map(|instance| instance.handle);
            return self.terminate_locked(&mut master, orphan);
        }
        if master.state() != MasterState::Provisioning {
            if let Ok(instance) = result {
                self.spawn_stop(organization, instance.handle, false, StopPurpose::Cleanup);
            }
            return Ok(());
        }

        match result {
            Ok(instance) => {
                let endpoint = instance.endpoint.clone();
                let handle = instance.handle.clone();
                master.mark_provisioned(instance)?;
                self.events.fire_master(MasterEvent::Provisioned {
                    organization,
                    endpoint,
                    handle,
                });
            }
            Err(error) => {
                self.backends[start.backend].failures += 1;
                let attempts = master.attempts();
                if self.retry.should_retry(attempts, &error) {
                    let delay = self.retry.backoff(attempts);
                    warn!(
                        %organization,
                        backend = %backend_name,
                        attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %error,
                        "master start failed, will retry"
                    );
                    master.schedule_retry(self.clock.now() + delay, error.to_string());
                } else {
                    master.fail_provisioning(error.to_string())?;
                    self.events.fire_master(MasterEvent::ProvisioningFailed {
                        organization,
                        backend: Some(backend_name),
                        error: error.to_string(),
                        attempts,
                    });
                }
            }
        }
        Ok(())
    }

    fn stop_completed(
        &mut self,
        organization: Organization,
        handle: InstanceHandle,
        purpose: StopPurpose,
        result: BackendResult<()>,
    ) -> MasterResult<()> {
        if purpose == StopPurpose::Cleanup {
            if let Err(e) = result {
                warn!(%organization, instance = %handle.id, error = %e, "instance cleanup failed");
            }
            return Ok(());
        }

        let waiting = matches!(self.stops.get(&organization), Some(h) if h.id == handle.id);
        if !waiting {
            return Ok(());
        }
        self.stops.remove(&organization);

        let master_ref = self.registry.get(&organization)?;
        let mut master = lock_master(&master_ref)?;
        if master.state() != MasterState::Terminating {
            return Ok(());
        }

        match (purpose, result) {
            (_, Ok(())) => self.mark_terminated(&mut master),
            (StopPurpose::Graceful, Err(e)) => {
                warn!(%organization, error = %e, "graceful stop failed, forcing");
                master.record_error(format!("graceful stop failed: {e}"));
                self.stops.insert(organization.clone(), handle.clone());
                self.spawn_stop(organization, handle, false, StopPurpose::Escalated);
                Ok(())
            }
            (_, Err(e)) => {
                warn!(%organization, error = %e, "forced stop failed");
                master.record_error(format!("forced stop failed: {e}"));
                self.mark_terminated(&mut master)
            }
        }
    }

    // =========================================================================
    // HELPERS
    // =========================================================================

    fn spawn_stop(
        &self,
        organization: Organization,
        handle: InstanceHandle,
        graceful: bool,
        purpose: StopPurpose,
    ) {
        let backend = self
            .backends
            .iter()
            .find(|s| s.backend.name() == handle.backend)
            .map(|s| s.backend.clone());
        let completions = self.completions.clone();
        tokio::spawn(async move {
            let result = match backend {
                Some(backend) => backend.stop_instance(&handle, graceful).await,
                None => Err(crate::backend::BackendError::UnknownInstance(format!(
                    "no backend named {}",
                    handle.backend
                ))),
            };
            let _ = completions.send(Completion::Stopped {
                organization,
                handle,
                purpose,
                result,
            });
        });
    }

    fn release(&mut self, index: usize) {
        if let Some(slot) = self.backends.get_mut(index) {
            if !slot.counter.release() {
                warn!(backend = slot.backend.name(), "capacity released twice");
            }
        }
    }

    fn abort_starts(&mut self) {
        let starts: Vec<InFlightStart> = self.starts.drain().map(|(_, s)| s).collect();
        for start in starts {
            start.task.abort();
            self.release(start.backend);
        }
        self.publish();
    }

    fn publish(&self) {
        self.status.send_replace(statuses(&self.backends));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{PooledBackend, SimulatedProvisioningService};
    use crate::events::{EventListener, EventRecorder};
    use crate::scheduler::ManualClock;
    use std::time::Duration;

    struct Fixture {
        registry: Arc<MasterRegistry>,
        recorder: Arc<EventRecorder>,
        service: Arc<SimulatedProvisioningService>,
        provisioner: MasterProvisioner,
    }

    fn settings() -> SchedulerSettings {
        SchedulerSettings {
            cadence: Cadence::new(Duration::from_millis(10), Duration::from_millis(10)).unwrap(),
            retry: RetryPolicy {
                initial_backoff: Duration::from_millis(5),
                jitter: 0.0,
                ..RetryPolicy::default()
            },
        }
    }

    fn fixture(service: SimulatedProvisioningService, capacity: usize) -> Fixture {
        fixture_with_pools(service, &[("pool", capacity)])
    }

    /// One backend per `(name, capacity)`, all sharing `service`.
    fn fixture_with_pools(service: SimulatedProvisioningService, pools: &[(&str, usize)]) -> Fixture {
        let registry = Arc::new(MasterRegistry::new());
        let recorder = Arc::new(EventRecorder::default());
        let listeners: Vec<Arc<dyn EventListener>> = vec![recorder.clone()];
        let events = Arc::new(ListenerRegistry::new(listeners));
        let service = Arc::new(service);
        let backends: Vec<Arc<dyn ProvisioningBackend>> = pools
            .iter()
            .map(|(name, capacity)| {
                Arc::new(PooledBackend::cloud(*name, *capacity, service.clone()))
                    as Arc<dyn ProvisioningBackend>
            })
            .collect();
        let provisioner =
            MasterProvisioner::spawn(registry.clone(), events, backends, settings()).unwrap();
        Fixture {
            registry,
            recorder,
            service,
            provisioner,
        }
    }

    fn org(i: usize) -> Organization {
        Organization::new(format!("org{i}")).unwrap()
    }

    fn state(registry: &MasterRegistry, org: &Organization) -> MasterState {
        lock_master(&registry.get(org).unwrap()).unwrap().state()
    }

    async fn wait_for(registry: &MasterRegistry, org: &Organization, want: MasterState) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while state(registry, org) != want {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("{org} never reached {want}"));
    }

    #[tokio::test]
    async fn test_capacity_is_never_exceeded() {
        let f = fixture(SimulatedProvisioningService::new(Duration::from_millis(30)), 2);
        for i in 0..6 {
            f.registry.create(org(i)).unwrap();
            assert!(f.provisioner.provision(&org(i)).unwrap());
        }
        for i in 0..6 {
            wait_for(&f.registry, &org(i), MasterState::Provisioned).await;
        }

        let status = &f.provisioner.backend_status()[0];
        assert_eq!(status.in_flight, 0);
        assert_eq!(status.peak, 2);
        assert_eq!(status.dispatched, 6);
        assert!(f.service.stats().peak_starts_in_flight <= 2);
    }

    #[tokio::test]
    async fn test_backends_fill_first_fit_in_registration_order() {
        let f = fixture_with_pools(
            SimulatedProvisioningService::new(Duration::from_millis(300)),
            &[("first", 1), ("second", 2)],
        );
        for i in 0..4 {
            f.registry.create(org(i)).unwrap();
            f.provisioner.provision(&org(i)).unwrap();
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while f
                .provisioner
                .backend_status()
                .iter()
                .map(|s| s.in_flight)
                .sum::<usize>()
                < 3
            {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        let status = f.provisioner.backend_status();
        assert_eq!((status[0].name.as_str(), status[0].in_flight), ("first", 1));
        assert_eq!((status[1].name.as_str(), status[1].in_flight), ("second", 2));
        let waiting: Vec<Organization> = (0..4)
            .map(org)
            .filter(|o| state(&f.registry, o) == MasterState::Created)
            .collect();
        assert_eq!(waiting.len(), 1);
        assert!(lock_master(&f.registry.get(&waiting[0]).unwrap())
            .unwrap()
            .provision_requested());

        for i in 0..4 {
            wait_for(&f.registry, &org(i), MasterState::Provisioned).await;
        }
        let status = f.provisioner.backend_status();
        assert_eq!(status[0].in_flight, 0);
        assert_eq!(status[1].in_flight, 0);
        assert_eq!(status[0].peak, 1);
        assert_eq!(status[1].peak, 2);
        assert_eq!(status[0].dispatched + status[1].dispatched, 4);
        assert_eq!(f.recorder.count_named("master.provisioning"), 4);
    }

    #[tokio::test]
    async fn test_manual_clock_drives_cadence_and_retries() {
        let clock = Arc::new(ManualClock::new());
        let registry = Arc::new(MasterRegistry::new());
        let service = Arc::new(SimulatedProvisioningService::new(Duration::ZERO).with_failures(1));
        let backends: Vec<Arc<dyn ProvisioningBackend>> =
            vec![Arc::new(PooledBackend::cloud("pool", 1, service.clone()))];
        let settings = SchedulerSettings {
            cadence: Cadence::new(Duration::from_secs(60), Duration::from_secs(60)).unwrap(),
            retry: RetryPolicy {
                initial_backoff: Duration::from_secs(5),
                jitter: 0.0,
                ..RetryPolicy::default()
            },
        };
        let provisioner = MasterProvisioner::spawn_with_clock(
            registry.clone(),
            Arc::new(ListenerRegistry::default()),
            backends,
            settings,
            clock.clone(),
        )
        .unwrap();

        // Real time passing does not trigger the initial pass.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(provisioner.passes(), 0);
        clock.advance(Duration::from_secs(60));
        provisioner.wait_for_passes(1).await.unwrap();

        registry.create(org(0)).unwrap();
        provisioner.provision(&org(0)).unwrap();
        let master = registry.get(&org(0)).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while lock_master(&master).unwrap().last_error().is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        // The retry waits for the clock, not for wall time.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(state(&registry, &org(0)), MasterState::Provisioning);
        assert_eq!(lock_master(&master).unwrap().attempts(), 1);

        clock.advance(Duration::from_secs(5));
        wait_for(&registry, &org(0), MasterState::Provisioned).await;
        assert_eq!(lock_master(&master).unwrap().attempts(), 2);
        assert_eq!(service.stats().launched, 1);
    }

    #[tokio::test]
    async fn test_second_request_does_not_double_dispatch() {
        let f = fixture(SimulatedProvisioningService::new(Duration::from_millis(20)), 4);
        f.registry.create(org(0)).unwrap();
        assert!(f.provisioner.provision(&org(0)).unwrap());
        assert!(!f.provisioner.provision(&org(0)).unwrap());
        wait_for(&f.registry, &org(0), MasterState::Provisioned).await;
        assert!(!f.provisioner.provision(&org(0)).unwrap());

        assert_eq!(f.recorder.count_named("master.provisioning"), 1);
        assert_eq!(f.service.stats().launched, 1);
    }

    #[tokio::test]
    async fn test_retries_then_fails_with_diagnostics() {
        let f = fixture(SimulatedProvisioningService::new(Duration::ZERO).with_failures(10), 1);
        f.registry.create(org(0)).unwrap();
        f.provisioner.provision(&org(0)).unwrap();
        wait_for(&f.registry, &org(0), MasterState::ProvisioningFailed).await;

        let snapshot = lock_master(&f.registry.get(&org(0)).unwrap())
            .unwrap()
            .snapshot();
        assert_eq!(snapshot.attempts, 3);
        assert_eq!(snapshot.last_backend.as_deref(), Some("pool"));
        assert!(snapshot.last_error.unwrap().contains("simulated start failure"));
        assert_eq!(f.recorder.count_named("master.provisioning_failed"), 1);
        assert_eq!(f.provisioner.backend_status()[0].in_flight, 0);
        assert_eq!(f.provisioner.backend_status()[0].failures, 3);
    }

    #[tokio::test]
    async fn test_transient_failure_recovers() {
        let f = fixture(SimulatedProvisioningService::new(Duration::ZERO).with_failures(1), 1);
        f.registry.create(org(0)).unwrap();
        f.provisioner.provision(&org(0)).unwrap();
        wait_for(&f.registry, &org(0), MasterState::Provisioned).await;
        assert_eq!(f.recorder.count_named("master.provisioning"), 1);
    }

    #[tokio::test]
    async fn test_termination_wins_over_pending_start() {
        let f = fixture(SimulatedProvisioningService::new(Duration::from_secs(30)), 1);
        f.registry.create(org(0)).unwrap();
        f.provisioner.provision(&org(0)).unwrap();
        wait_for(&f.registry, &org(0), MasterState::Provisioning).await;

        f.provisioner.terminate(&org(0), false).unwrap();
        wait_for(&f.registry, &org(0), MasterState::Terminated).await;

        let names: Vec<&str> = f
            .recorder
            .master_events(&org(0))
            .iter()
            .map(MasterEvent::event_name)
            .collect();
        assert_eq!(
            names,
            vec!["master.provisioning", "master.terminating", "master.terminated"]
        );
        assert_eq!(f.provisioner.backend_status()[0].in_flight, 0);
    }

    #[tokio::test]
    async fn test_terminate_before_dispatch_never_provisions() {
        let f = fixture(SimulatedProvisioningService::new(Duration::ZERO), 1);
        f.registry.create(org(0)).unwrap();
        // Both requests land before the scheduler looks at the entity.
        lock_master(&f.registry.get(&org(0)).unwrap())
            .unwrap()
            .request_provisioning()
            .unwrap();
        f.provisioner.terminate(&org(0), true).unwrap();
        wait_for(&f.registry, &org(0), MasterState::Terminated).await;

        assert_eq!(f.recorder.count_named("master.provisioning"), 0);
        assert_eq!(f.service.stats().launched, 0);
    }

    #[tokio::test]
    async fn test_graceful_stop_failure_escalates() {
        let f = fixture(
            SimulatedProvisioningService::new(Duration::ZERO).with_failing_graceful_stops(),
            1,
        );
        f.registry.create(org(0)).unwrap();
        f.provisioner.provision(&org(0)).unwrap();
        wait_for(&f.registry, &org(0), MasterState::Provisioned).await;

        f.provisioner.terminate(&org(0), false).unwrap();
        wait_for(&f.registry, &org(0), MasterState::Terminated).await;

        let master = f.registry.get(&org(0)).unwrap();
        let master = lock_master(&master).unwrap();
        assert!(master.last_error().unwrap().contains("graceful stop failed"));
        assert!(master.handle().is_none());
        assert_eq!(f.service.stats().running, 0);
    }

    #[tokio::test]
    async fn test_cadence_drives_passes() {
        let f = fixture(SimulatedProvisioningService::new(Duration::ZERO), 1);
        f.provisioner.wait_for_passes(3).await.unwrap();

        f.provisioner
            .cadence()
            .set_recurrence_period(Duration::from_millis(5))
            .unwrap();
        let seen = f.provisioner.passes();
        f.provisioner.wait_for_passes(seen + 2).await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_stops_accepting() {
        let f = fixture(SimulatedProvisioningService::new(Duration::ZERO), 1);
        f.provisioner.shutdown().await;
        f.registry.create(org(0)).unwrap();
        assert_eq!(
            f.provisioner.provision(&org(0)).unwrap_err(),
            SchedulerError::Stopped
        );
    }

    #[test]
    fn test_rejects_duplicate_backends() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let _guard = rt.enter();
        let service = Arc::new(SimulatedProvisioningService::new(Duration::ZERO));
        let a: Arc<dyn ProvisioningBackend> = Arc::new(PooledBackend::cloud("pool", 1, service.clone()));
        let b: Arc<dyn ProvisioningBackend> = Arc::new(PooledBackend::node("pool", 1, service));
        let err = MasterProvisioner::spawn(
            Arc::new(MasterRegistry::new()),
            Arc::new(ListenerRegistry::default()),
            vec![a, b],
            SchedulerSettings::default(),
        )
        .unwrap_err();
        assert_eq!(err, SchedulerError::DuplicateBackend("pool".into()));
    }
}
