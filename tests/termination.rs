//! Termination precedence and teardown
//!
//! Termination wins over any pending or in-flight start, and graceful stops
//! that fail are escalated to forced ones.

mod common;

use std::time::Duration;

use common::{org, orgs, wait_until, Fleet, FleetOptions, WAIT};
use metafleet::events::MasterEvent;
use metafleet::master::MasterState;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_graceful_termination_of_connected_masters() {
    let fleet = Fleet::start(FleetOptions::default()).await;
    let organizations = orgs(3);
    fleet.provision(&organizations);
    assert!(fleet.wait_for_all(MasterState::Approved).await);

    for organization in &organizations {
        assert!(fleet.coordinator.terminate(organization, false).unwrap());
    }
    assert!(fleet.wait_for_all(MasterState::Terminated).await);

    assert_eq!(fleet.coordinator.connected_masters(), 0);
    assert!(fleet.coordinator.provisioned_masters().unwrap().is_empty());
    assert!(wait_until(WAIT, || fleet.service.stats().running == 0).await);
    for organization in &organizations {
        let master = fleet.coordinator.master(organization).unwrap();
        assert!(!master.approved);
        assert!(master.channel_id.is_none());
        assert!(fleet.coordinator.channel(organization).unwrap().is_none());

        let events = fleet.master_events(organization);
        assert!(matches!(
            events.iter().rev().nth(1),
            Some(MasterEvent::Terminating { forced: false, .. })
        ));
        assert!(matches!(events.last(), Some(MasterEvent::Terminated { .. })));
    }

    fleet.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_forced_termination_wins_over_in_flight_start() {
    let fleet = Fleet::start(FleetOptions {
        capacity: 1,
        start_delay: Duration::from_secs(5),
        ..FleetOptions::default()
    })
    .await;
    let org0 = org("org0");
    fleet.provision(std::slice::from_ref(&org0));
    assert!(fleet.wait_for_state(&org0, MasterState::Provisioning).await);

    fleet.coordinator.terminate(&org0, true).unwrap();
    assert!(fleet.wait_for_state(&org0, MasterState::Terminated).await);

    let names: Vec<&str> = fleet
        .master_events(&org0)
        .iter()
        .map(MasterEvent::event_name)
        .collect();
    assert_eq!(
        names,
        vec![
            "master.created",
            "master.provisioning",
            "master.terminating",
            "master.terminated"
        ]
    );
    // The slot is free again.
    assert!(wait_until(WAIT, || fleet.coordinator.backend_status()[0].in_flight == 0).await);

    fleet.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_terminating_before_dispatch_never_starts() {
    let fleet = Fleet::start(FleetOptions {
        capacity: 1,
        start_delay: Duration::from_secs(5),
        ..FleetOptions::default()
    })
    .await;
    let organizations = orgs(2);
    fleet.provision(&organizations);

    // org0 holds the only slot, org1 waits for it.
    assert!(fleet.wait_for_state(&organizations[0], MasterState::Provisioning).await);
    assert_eq!(fleet.state(&organizations[1]), MasterState::Created);

    fleet.coordinator.terminate(&organizations[1], false).unwrap();
    assert!(fleet.wait_for_state(&organizations[1], MasterState::Terminated).await);
    assert!(!fleet
        .master_events(&organizations[1])
        .iter()
        .any(|e| matches!(e, MasterEvent::Provisioning { .. })));
    assert_eq!(fleet.coordinator.backend_status()[0].dispatched, 1);

    fleet.coordinator.terminate(&organizations[0], true).unwrap();
    assert!(fleet.wait_for_all(MasterState::Terminated).await);

    fleet.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_graceful_stop_escalates_to_forced() {
    let fleet = Fleet::start(FleetOptions {
        failing_graceful_stops: true,
        ..FleetOptions::default()
    })
    .await;
    let org0 = org("org0");
    fleet.provision(std::slice::from_ref(&org0));
    assert!(fleet.wait_for_state(&org0, MasterState::Approved).await);

    fleet.coordinator.terminate(&org0, false).unwrap();
    assert!(fleet.wait_for_state(&org0, MasterState::Terminated).await);

    let master = fleet.coordinator.master(&org0).unwrap();
    assert!(master
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("graceful stop failed")));
    assert!(wait_until(WAIT, || fleet.service.stats().running == 0).await);
    assert_eq!(fleet.coordinator.connected_masters(), 0);

    fleet.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_forced_request_overtakes_slow_graceful_stop() {
    let fleet = Fleet::start(FleetOptions {
        stop_delay: Duration::from_secs(10),
        ..FleetOptions::default()
    })
    .await;
    let org0 = org("org0");
    fleet.provision(std::slice::from_ref(&org0));
    assert!(fleet.wait_for_state(&org0, MasterState::Approved).await);

    fleet.coordinator.terminate(&org0, false).unwrap();
    assert!(fleet.wait_for_state(&org0, MasterState::Terminating).await);

    fleet.coordinator.terminate(&org0, true).unwrap();
    assert!(fleet.wait_for_state(&org0, MasterState::Terminated).await);

    fleet.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_terminated_organization_can_be_recreated() {
    let fleet = Fleet::start(FleetOptions::default()).await;
    let org0 = org("org0");
    fleet.provision(std::slice::from_ref(&org0));
    assert!(fleet.wait_for_state(&org0, MasterState::Approved).await);
    let first_id = fleet.coordinator.master(&org0).unwrap().id;

    fleet.coordinator.terminate(&org0, true).unwrap();
    assert!(fleet.wait_for_state(&org0, MasterState::Terminated).await);

    fleet.provision(std::slice::from_ref(&org0));
    assert!(fleet.wait_for_state(&org0, MasterState::Approved).await);
    assert_ne!(fleet.coordinator.master(&org0).unwrap().id, first_id);

    fleet.shutdown().await;
}
