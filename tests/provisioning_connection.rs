//! Provisioning and connection, end to end
//!
//! Masters are created, started by the scheduler on a pooled backend and
//! dial back over mutual TLS until every one of them is Approved.

mod common;

use std::time::Duration;

use common::{org, orgs, Fleet, FleetOptions, WAIT};
use metafleet::events::MasterEvent;
use metafleet::master::MasterState;

async fn provision_and_connect(n: usize, options: FleetOptions) {
    let capacity = options.capacity;
    let fleet = Fleet::start(options).await;
    let organizations = orgs(n);
    fleet.provision(&organizations);

    assert!(
        fleet.wait_for_all(MasterState::Approved).await,
        "masters: {:?}",
        fleet.coordinator.masters().unwrap()
    );

    // Capacity is never exceeded and is fully released.
    let status = &fleet.coordinator.backend_status()[0];
    assert!(status.peak <= capacity, "peak {} > {}", status.peak, capacity);
    assert_eq!(status.in_flight, 0);
    assert_eq!(status.dispatched, n as u64);
    assert!(fleet.service.stats().peak_starts_in_flight <= capacity);

    assert_eq!(fleet.coordinator.connected_masters(), n);
    assert_eq!(fleet.coordinator.provisioned_masters().unwrap().len(), n);
    for organization in &organizations {
        let master = fleet.coordinator.master(organization).unwrap();
        assert!(master.approved);
        assert!(master.channel_id.is_some());
        assert!(master.identity_fingerprint.is_some());
        assert!(fleet.coordinator.channel(organization).unwrap().is_some());
    }

    fleet.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_master_connects() {
    provision_and_connect(1, FleetOptions::default()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_masters_connect() {
    provision_and_connect(2, FleetOptions::default()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_four_masters_fill_capacity() {
    provision_and_connect(4, FleetOptions::default()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_eight_masters_wait_for_capacity() {
    provision_and_connect(
        8,
        FleetOptions {
            start_delay: Duration::from_millis(100),
            ..FleetOptions::default()
        },
    )
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_node_pool_provisions() {
    provision_and_connect(
        4,
        FleetOptions {
            node_pool: true,
            capacity: 2,
            ..FleetOptions::default()
        },
    )
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lifecycle_events_in_order() {
    let fleet = Fleet::start(FleetOptions::default()).await;
    let organization = org("org0");
    fleet.provision(std::slice::from_ref(&organization));
    assert!(fleet.wait_for_state(&organization, MasterState::Approved).await);

    let names: Vec<&str> = fleet
        .master_events(&organization)
        .iter()
        .map(MasterEvent::event_name)
        .collect();
    assert_eq!(
        names,
        vec![
            "master.created",
            "master.provisioning",
            "master.provisioned",
            "master.approved"
        ]
    );
    assert_eq!(fleet.recorder.count_named("connection.connecting_to"), 1);
    assert_eq!(fleet.recorder.count_named("connection.connected_to"), 1);

    fleet.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_transient_start_failures_are_retried() {
    let fleet = Fleet::start(FleetOptions {
        start_failures: 2,
        ..FleetOptions::default()
    })
    .await;
    let organization = org("org0");
    fleet.provision(std::slice::from_ref(&organization));

    assert!(fleet.wait_for_state(&organization, MasterState::Approved).await);
    let master = fleet.coordinator.master(&organization).unwrap();
    assert_eq!(master.attempts, 3);
    assert_eq!(fleet.service.stats().failed, 2);

    fleet.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_exhausted_retries_fail_provisioning() {
    let fleet = Fleet::start(FleetOptions {
        start_failures: 10,
        ..FleetOptions::default()
    })
    .await;
    let organization = org("org0");
    fleet.provision(std::slice::from_ref(&organization));

    assert!(
        fleet
            .wait_for_state(&organization, MasterState::ProvisioningFailed)
            .await
    );
    let master = fleet.coordinator.master(&organization).unwrap();
    assert_eq!(master.attempts, 3);
    assert!(master.last_error.is_some());
    assert_eq!(fleet.coordinator.backend_status()[0].in_flight, 0);
    assert!(fleet.master_events(&organization).iter().any(|e| matches!(
        e,
        MasterEvent::ProvisioningFailed { attempts: 3, .. }
    )));

    fleet.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_channel_carries_messages_both_ways() {
    let fleet = Fleet::start(FleetOptions {
        agents: false,
        ..FleetOptions::default()
    })
    .await;
    let organization = org("org0");
    fleet.provision(std::slice::from_ref(&organization));
    assert!(fleet.wait_for_state(&organization, MasterState::Provisioned).await);

    let (agent, _) = fleet.dial("org0", "org0");
    assert!(agent.wait_connected(WAIT).await.is_some());
    assert!(fleet.wait_for_state(&organization, MasterState::Approved).await);

    assert!(common::wait_until(WAIT, || agent.channel().is_some()).await);
    let coordinator_side = fleet.coordinator.channel(&organization).unwrap().unwrap();
    let master_side = agent.channel().unwrap();
    assert_eq!(coordinator_side.id(), master_side.id());

    coordinator_side
        .send(serde_json::json!({ "op": "configure" }))
        .unwrap();
    assert_eq!(
        master_side.recv().await,
        Some(serde_json::json!({ "op": "configure" }))
    );
    master_side.send(serde_json::json!({ "ok": true })).unwrap();
    assert_eq!(
        coordinator_side.recv().await,
        Some(serde_json::json!({ "ok": true }))
    );

    agent.shutdown().await;
    fleet.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lost_channel_reverts_to_provisioned_and_reconnects() {
    let fleet = Fleet::start(FleetOptions {
        agents: false,
        ..FleetOptions::default()
    })
    .await;
    let organization = org("org0");
    fleet.provision(std::slice::from_ref(&organization));
    assert!(fleet.wait_for_state(&organization, MasterState::Provisioned).await);

    let (agent, _) = fleet.dial("org0", "org0");
    let first = agent.wait_connected(WAIT).await.unwrap();
    assert!(fleet.wait_for_state(&organization, MasterState::Approved).await);

    // Coordinator drops the channel; the agent dials again.
    fleet
        .coordinator
        .channel(&organization)
        .unwrap()
        .unwrap()
        .close("test");
    assert!(
        common::wait_until(WAIT, || fleet.recorder.count_named("master.disconnected") == 1).await
    );
    assert!(
        common::wait_until(WAIT, || {
            fleet
                .coordinator
                .master(&organization)
                .unwrap()
                .channel_id
                .is_some_and(|id| id != first)
        })
        .await
    );
    assert_eq!(fleet.state(&organization), MasterState::Approved);
    assert_eq!(fleet.coordinator.connected_masters(), 1);

    agent.shutdown().await;
    fleet.shutdown().await;
}
