//! # Master Agent
//!
//! Master-side runner: dials the coordinator, keeps the channel up, and
//! dials again after refusals, errors and lost connections, backing off
//! between attempts until stopped.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::channel::Channel;
use super::engine::{HandshakeOutcome, ProtocolEngine, DEFAULT_HANDSHAKE_TIMEOUT};
use super::errors::{ConnectError, SecurityError};
use super::listener::{AgentListener, ConnectionAttempt};
use super::tls::TlsConfig;
use crate::events::ListenerRegistry;
use crate::master::Organization;

/// Where and how a master agent dials in.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub organization: Organization,
    pub coordinator_address: String,
    /// DNS name on the coordinator's certificate.
    pub server_name: String,
    /// Organization the coordinator must declare, when pinned.
    pub expected_coordinator: Option<Organization>,
    pub properties: BTreeMap<String, String>,
    pub handshake_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl AgentConfig {
    pub fn new(
        organization: Organization,
        coordinator_address: impl Into<String>,
        server_name: impl Into<String>,
    ) -> Self {
        Self {
            organization,
            coordinator_address: coordinator_address.into(),
            server_name: server_name.into(),
            expected_coordinator: None,
            properties: BTreeMap::new(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(5),
        }
    }
}

/// What the agent is doing right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentStatus {
    Connecting { attempt: u32 },
    Connected { channel_id: Uuid },
    Waiting { last_outcome: String },
    Stopped,
}

/// Accepts a coordinator whose certificate verified, provided its declared
/// organization agrees with the certificate and with the pinned one.
struct CoordinatorTrust {
    expected: Option<Organization>,
}

impl AgentListener for CoordinatorTrust {
    fn on_connecting_to(&self, attempt: &ConnectionAttempt) -> Result<(), ConnectError> {
        attempt.verify_organization_claim()?;
        match &self.expected {
            Some(expected) if expected != &attempt.organization => {
                Err(SecurityError::OrganizationMismatch {
                    declared: attempt.organization.to_string(),
                    certified: expected.to_string(),
                }
                .into())
            }
            _ => Ok(()),
        }
    }

    fn on_connected_to(
        &self,
        _attempt: &ConnectionAttempt,
        _channel: &Channel,
    ) -> Result<(), ConnectError> {
        Ok(())
    }
}

/// The master side of the agent protocol.
pub struct MasterAgent {
    config: AgentConfig,
    engine: ProtocolEngine,
}

impl MasterAgent {
    pub fn new(config: AgentConfig, tls: TlsConfig, events: Arc<ListenerRegistry>) -> Self {
        let listener = Arc::new(CoordinatorTrust {
            expected: config.expected_coordinator.clone(),
        });
        let engine = ProtocolEngine::new(tls, config.organization.clone(), listener, events)
            .with_properties(config.properties.clone())
            .with_handshake_timeout(config.handshake_timeout);
        Self { config, engine }
    }

    /// Run the agent on its own task.
    pub fn spawn(self) -> AgentHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (status_tx, status_rx) = watch::channel(AgentStatus::Connecting { attempt: 0 });
        let (channel_tx, channel_rx) = watch::channel(None);
        let organization = self.config.organization.clone();
        let task = tokio::spawn(self.run(stop_rx, status_tx, channel_tx));
        AgentHandle {
            organization,
            stop: stop_tx,
            status: status_rx,
            channel: channel_rx,
            task,
        }
    }

    async fn run(
        self,
        mut stop: watch::Receiver<bool>,
        status: watch::Sender<AgentStatus>,
        current: watch::Sender<Option<Channel>>,
    ) {
        let organization = &self.config.organization;
        let mut backoff = self.config.initial_backoff;
        let mut attempt = 0u32;

        loop {
            if *stop.borrow() {
                break;
            }
            attempt += 1;
            status.send_replace(AgentStatus::Connecting { attempt });

            let outcome = tokio::select! {
                outcome = self.engine.connect(&self.config.coordinator_address, &self.config.server_name) => outcome,
                _ = stop.wait_for(|s| *s) => break,
            };

            let last_outcome = match outcome {
                HandshakeOutcome::Connected { channel, .. } => {
                    info!(%organization, channel = %channel.id(), "master agent connected");
                    backoff = self.config.initial_backoff;
                    status.send_replace(AgentStatus::Connected {
                        channel_id: channel.id(),
                    });
                    current.send_replace(Some(channel.clone()));

                    let stopped = tokio::select! {
                        reason = channel.closed() => {
                            info!(%organization, %reason, "master agent channel closed");
                            false
                        }
                        _ = stop.wait_for(|s| *s) => {
                            channel.close("master stopping");
                            true
                        }
                    };
                    current.send_replace(None);
                    if stopped {
                        break;
                    }
                    format!("channel {} closed", channel.id())
                }
                HandshakeOutcome::Refused(refusal) => {
                    debug!(%organization, reason = %refusal.reason, "master agent refused");
                    format!("refused: {}", refusal.reason)
                }
                HandshakeOutcome::Errored(failure) => {
                    warn!(%organization, error = %failure, "master agent connection failed");
                    format!("error: {failure}")
                }
            };

            status.send_replace(AgentStatus::Waiting { last_outcome });
            let jitter = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 10);
            let wait = backoff + Duration::from_millis(jitter);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = stop.wait_for(|s| *s) => break,
            }
            backoff = (backoff * 2).min(self.config.max_backoff);
        }

        status.send_replace(AgentStatus::Stopped);
        debug!(%organization, "master agent stopped");
    }
}

/// Control handle for a running [`MasterAgent`].
#[derive(Debug)]
pub struct AgentHandle {
    organization: Organization,
    stop: watch::Sender<bool>,
    status: watch::Receiver<AgentStatus>,
    channel: watch::Receiver<Option<Channel>>,
    task: JoinHandle<()>,
}

impl AgentHandle {
    pub fn organization(&self) -> &Organization {
        &self.organization
    }

    pub fn status(&self) -> AgentStatus {
        self.status.borrow().clone()
    }

    /// The live channel, while connected.
    pub fn channel(&self) -> Option<Channel> {
        self.channel.borrow().clone()
    }

    /// Stop dialing and close any live channel.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    /// Wait until connected, up to `timeout`.
    pub async fn wait_connected(&self, timeout: Duration) -> Option<Uuid> {
        let mut status = self.status.clone();
        let connected = tokio::time::timeout(
            timeout,
            status.wait_for(|s| matches!(s, AgentStatus::Connected { .. })),
        )
        .await
        .ok()?
        .ok()?
        .clone();
        match connected {
            AgentStatus::Connected { channel_id } => Some(channel_id),
            _ => None,
        }
    }

    /// Stop and wait for the agent task to end.
    pub async fn shutdown(self) {
        self.stop();
        let _ = self.task.await;
    }
}
