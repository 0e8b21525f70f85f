//! ServerManager automaton and connector selection tests.

mod mock_support;

use loragw_rs::connector::{Connector, MockConnector};
use loragw_rs::constants::{GWMP_PROTOCOL_VERSION, GWMP_PULL_DATA};
use loragw_rs::server::{NodeInterface, ServerManager};
use loragw_rs::{AutomatonState, GatewayError};
use mock_support::test_settings;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_test::assert_ok;

fn node_interface() -> NodeInterface {
    let (session_events, _session_rx) = mpsc::channel(16);
    let (downlinks, _downlink_rx) = mpsc::channel(16);
    // The receivers are dropped: these tests only exercise the server
    // side, session events go nowhere.
    NodeInterface {
        session_events,
        downlinks,
    }
}

#[tokio::test]
async fn handshake_failover_selects_second_connector() {
    let first = MockConnector::new("mock0").fail_send_receive();
    let second = MockConnector::new("mock1");
    let manager = ServerManager::new(vec![
        first.clone() as Arc<dyn Connector>,
        second.clone() as Arc<dyn Connector>,
    ]);

    manager
        .initialize(test_settings(2, 4, 0), None)
        .await
        .unwrap();

    assert_eq!(manager.active_connector(), Some(1));
    assert_eq!(manager.connector_active_flags(), vec![false, true]);
    assert_eq!(first.state(), AutomatonState::Terminated);
    assert_eq!(second.state(), AutomatonState::Idle);
    // Both connectors were probed.
    assert_eq!(first.probe_datagrams().len(), 1);
    assert_eq!(second.probe_datagrams().len(), 1);
}

#[tokio::test]
async fn network_join_failure_also_moves_to_next_connector() {
    let first = MockConnector::new("mock0").fail_initialize();
    let second = MockConnector::new("mock1");
    let manager = ServerManager::new(vec![
        first.clone() as Arc<dyn Connector>,
        second.clone() as Arc<dyn Connector>,
    ]);

    manager
        .initialize(test_settings(2, 4, 0), None)
        .await
        .unwrap();

    assert_eq!(manager.active_connector(), Some(1));
    // The dead connector was never probed.
    assert!(first.probe_datagrams().is_empty());
}

#[tokio::test]
async fn initialization_fails_when_no_connector_reaches_the_server() {
    let first = MockConnector::new("mock0").fail_send_receive();
    let second = MockConnector::new("mock1").fail_initialize();
    let manager = ServerManager::new(vec![
        first as Arc<dyn Connector>,
        second as Arc<dyn Connector>,
    ]);

    let result = manager.initialize(test_settings(2, 4, 0), None).await;
    assert!(matches!(result, Err(GatewayError::HandshakeFailed)));
    assert_eq!(manager.active_connector(), None);
    assert_eq!(manager.state(), AutomatonState::Created);
}

#[tokio::test]
async fn handshake_probe_is_a_forced_keepalive() {
    let mock = MockConnector::new("mock0");
    let manager = ServerManager::new(vec![mock.clone() as Arc<dyn Connector>]);
    manager
        .initialize(test_settings(1, 4, 0), None)
        .await
        .unwrap();

    let probes = mock.probe_datagrams();
    assert_eq!(probes.len(), 1);
    assert_eq!(probes[0].len(), 12);
    assert_eq!(probes[0][0], GWMP_PROTOCOL_VERSION);
    assert_eq!(probes[0][3], GWMP_PULL_DATA);
    // Heartbeats were disabled: the probe happened regardless.
}

#[tokio::test]
async fn attach_completes_initialization() {
    let mock = MockConnector::new("mock0");
    let manager = ServerManager::new(vec![mock as Arc<dyn Connector>]);

    manager
        .initialize(test_settings(1, 4, 0), None)
        .await
        .unwrap();
    assert_eq!(manager.state(), AutomatonState::Initialized);

    manager.attach(node_interface()).await.unwrap();
    assert_eq!(manager.state(), AutomatonState::Idle);

    assert_ok!(manager.start(false).await);
    assert_eq!(manager.state(), AutomatonState::Running);
}

#[tokio::test]
async fn commands_are_rejected_in_wrong_states() {
    let mock = MockConnector::new("mock0");
    let manager = ServerManager::new(vec![mock as Arc<dyn Connector>]);

    // Nothing initialized yet.
    assert!(matches!(
        manager.start(false).await,
        Err(GatewayError::InvalidState(_))
    ));
    assert!(matches!(
        manager.stop(false).await,
        Err(GatewayError::InvalidState(_))
    ));
    // Forced stop of an already stopped automaton is a no-op.
    manager.stop(true).await.unwrap();

    manager
        .initialize(test_settings(1, 4, 0), Some(node_interface()))
        .await
        .unwrap();
    assert_eq!(manager.state(), AutomatonState::Idle);

    // Initialize is only allowed from Created or Error.
    assert!(matches!(
        manager.initialize(test_settings(1, 4, 0), None).await,
        Err(GatewayError::InvalidState(_))
    ));
}

#[tokio::test]
async fn stop_returns_to_idle_and_start_again_works() {
    let mock = MockConnector::new("mock0");
    let manager = ServerManager::new(vec![mock.clone() as Arc<dyn Connector>]);
    manager
        .initialize(test_settings(1, 4, 0), Some(node_interface()))
        .await
        .unwrap();

    manager.start(false).await.unwrap();
    assert_eq!(mock.state(), AutomatonState::Running);

    manager.stop(false).await.unwrap();
    assert_eq!(manager.state(), AutomatonState::Idle);
    assert_eq!(mock.state(), AutomatonState::Idle);

    manager.start(false).await.unwrap();
    assert_eq!(manager.state(), AutomatonState::Running);
    // Starting again while running is only accepted when forced.
    assert!(manager.start(false).await.is_err());
    manager.start(true).await.unwrap();
}

#[tokio::test]
async fn settings_must_cover_every_installed_connector() {
    let manager = ServerManager::new(vec![
        MockConnector::new("mock0") as Arc<dyn Connector>,
        MockConnector::new("mock1") as Arc<dyn Connector>,
    ]);
    let result = manager.initialize(test_settings(1, 4, 0), None).await;
    assert!(matches!(result, Err(GatewayError::Settings(_))));
}
