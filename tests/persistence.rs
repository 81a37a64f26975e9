//! Restart from a JSON state file
//!
//! Connections never survive a restart: restored masters wait for their
//! agents to dial in again, and interrupted starts are dispatched again.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{master_tls, org, wait_until, Fleet, FleetOptions, WAIT};
use metafleet::events::{ConnectionEvent, LifecycleEvent};
use metafleet::master::{JsonFileStore, MasterState, MasterStore};
use metafleet::protocol::IdentityIssuer;

fn store(path: &std::path::Path) -> Option<Arc<dyn MasterStore>> {
    Some(Arc::new(JsonFileStore::new(path)))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_restart_restores_masters_without_channels() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let issuer = Arc::new(IdentityIssuer::generate("test CA").unwrap());
    let org0_tls = master_tls(&issuer, "org0");
    let org1_tls = master_tls(&issuer, "org1");

    let first = Fleet::start_with_issuer(
        FleetOptions {
            store: store(&path),
            agents: false,
            ..FleetOptions::default()
        },
        issuer.clone(),
    )
    .await;
    let connected = [org("org0"), org("org1")];
    first.provision(&connected);
    first.coordinator.create_master(org("org2")).unwrap();
    assert!(first.wait_for_all_of(&connected, MasterState::Provisioned).await);

    let (agent0, _) = first.dial_with("org0", org0_tls.clone());
    let (agent1, _) = first.dial_with("org1", org1_tls);
    assert!(first.wait_for_all_of(&connected, MasterState::Approved).await);
    let fingerprint = first
        .coordinator
        .master(&connected[0])
        .unwrap()
        .identity_fingerprint;
    assert!(fingerprint.is_some());

    first.shutdown().await;
    agent0.shutdown().await;
    agent1.shutdown().await;
    assert!(wait_until(WAIT, || disconnects_settled(&path)).await);
    assert_eq!(JsonFileStore::new(&path).load().unwrap().len(), 3);

    let second = Fleet::start_with_issuer(
        FleetOptions {
            store: store(&path),
            agents: false,
            ..FleetOptions::default()
        },
        issuer,
    )
    .await;
    for organization in &connected {
        let master = second.coordinator.master(organization).unwrap();
        assert_eq!(master.state, MasterState::Provisioned);
        assert!(!master.approved);
        assert!(master.channel_id.is_none());
        assert!(master.endpoint.is_some());
    }
    assert_eq!(
        second.coordinator.master(&connected[0]).unwrap().identity_fingerprint,
        fingerprint
    );
    assert_eq!(second.state(&org("org2")), MasterState::Created);
    assert_eq!(second.coordinator.provisioned_masters().unwrap().len(), 2);

    // The pinned certificate is required to reconnect.
    let (impostor, _) = second.dial("org0", "org0");
    assert!(
        wait_until(WAIT, || second.recorder.count(|e| matches!(
            e,
            LifecycleEvent::Connection(ConnectionEvent::Error { security: true, .. })
        )) >= 1)
        .await
    );
    impostor.shutdown().await;
    assert_eq!(second.state(&connected[0]), MasterState::Provisioned);

    let (agent0, _) = second.dial_with("org0", org0_tls);
    assert!(second.wait_for_state(&connected[0], MasterState::Approved).await);

    // A restored master can still be torn down through the new backend.
    second.coordinator.terminate(&connected[1], false).unwrap();
    assert!(second.wait_for_state(&connected[1], MasterState::Terminated).await);

    agent0.shutdown().await;
    second.shutdown().await;
}

/// Every persisted master has left `Approved`.
fn disconnects_settled(path: &std::path::Path) -> bool {
    JsonFileStore::new(path)
        .load()
        .map(|records| records.iter().all(|r| r.state != MasterState::Approved))
        .unwrap_or(false)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_interrupted_start_is_dispatched_again() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let issuer = Arc::new(IdentityIssuer::generate("test CA").unwrap());

    let first = Fleet::start_with_issuer(
        FleetOptions {
            store: store(&path),
            start_delay: Duration::from_secs(30),
            ..FleetOptions::default()
        },
        issuer.clone(),
    )
    .await;
    let org0 = org("org0");
    first.provision(std::slice::from_ref(&org0));
    assert!(first.wait_for_state(&org0, MasterState::Provisioning).await);
    first.shutdown().await;

    let records = JsonFileStore::new(&path).load().unwrap();
    assert_eq!(records[0].state, MasterState::Provisioning);

    let second = Fleet::start_with_issuer(
        FleetOptions {
            store: store(&path),
            ..FleetOptions::default()
        },
        issuer,
    )
    .await;
    assert!(second.wait_for_state(&org0, MasterState::Approved).await);
    assert_eq!(second.coordinator.backend_status()[0].dispatched, 1);

    second.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_request_waiting_on_capacity_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let issuer = Arc::new(IdentityIssuer::generate("test CA").unwrap());

    let first = Fleet::start_with_issuer(
        FleetOptions {
            store: store(&path),
            capacity: 1,
            start_delay: Duration::from_secs(30),
            ..FleetOptions::default()
        },
        issuer.clone(),
    )
    .await;
    let (org0, org1) = (org("org0"), org("org1"));
    first.provision(&[org0.clone(), org1.clone()]);
    assert!(first.wait_for_state(&org0, MasterState::Provisioning).await);
    assert_eq!(first.state(&org1), MasterState::Created);
    first.shutdown().await;

    let records = JsonFileStore::new(&path).load().unwrap();
    let queued = records.iter().find(|r| r.organization == org1).unwrap();
    assert_eq!(queued.state, MasterState::Created);
    assert!(queued.provision_requested);

    let second = Fleet::start_with_issuer(
        FleetOptions {
            store: store(&path),
            ..FleetOptions::default()
        },
        issuer,
    )
    .await;
    assert!(second.wait_for_all_of(&[org0, org1], MasterState::Approved).await);
    assert_eq!(second.coordinator.backend_status()[0].dispatched, 2);

    second.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_terminated_masters_stay_terminated() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");

    let first = Fleet::start(FleetOptions {
        store: store(&path),
        ..FleetOptions::default()
    })
    .await;
    let org0 = org("org0");
    first.provision(std::slice::from_ref(&org0));
    assert!(first.wait_for_state(&org0, MasterState::Approved).await);
    first.coordinator.terminate(&org0, true).unwrap();
    assert!(first.wait_for_state(&org0, MasterState::Terminated).await);
    first.shutdown().await;

    let second = Fleet::start(FleetOptions {
        store: store(&path),
        ..FleetOptions::default()
    })
    .await;
    assert_eq!(second.state(&org0), MasterState::Terminated);
    assert!(second.coordinator.provisioned_masters().unwrap().is_empty());
    assert_eq!(second.coordinator.backend_status()[0].dispatched, 0);

    second.shutdown().await;
}
