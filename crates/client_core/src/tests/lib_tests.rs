use std::time::Duration;

use shared::{
    domain::{ConnectionState, ZkPath},
    error::{CloseError, ConnectError, NodeError},
};
use tokio::time::timeout;

use super::*;
use crate::transport::MemoryEnsemble;

const WAIT: Duration = Duration::from_secs(2);

fn client_for(ensemble: &MemoryEnsemble, settings: ClientSettings) -> Arc<ZkClient> {
    ZkClient::with_connector(settings, Arc::new(ensemble.clone()))
}

async fn wait_for_state(client: &ZkClient, expected: ConnectionState) {
    let mut state = client.subscribe_state();
    timeout(WAIT, state.wait_for(|current| *current == expected))
        .await
        .expect("state change in time")
        .expect("state channel open");
}

#[tokio::test]
async fn config_scenario_round_trips_through_set_and_remove() {
    let ensemble = MemoryEnsemble::new();
    let client = client_for(&ensemble, ClientSettings::default());

    client.connect("127.0.0.1:2181").await.expect("connect");
    assert_eq!(client.state(), ConnectionState::Connected);

    client.create("/config", b"v1").await.expect("create");
    client.set_data("/config", b"v2").await.expect("set");
    let (data, stat) = client.get_data("/config").await.expect("get");
    assert_eq!(data, b"v2");
    assert_eq!(stat.version, 1);

    client.remove_recursive("/config").await.expect("remove");
    let err = client.get_data("/config").await.expect_err("gone");
    assert_eq!(
        err,
        NodeError::NoSuchNode {
            path: ZkPath::parse("/config").expect("path")
        }
    );
}

#[tokio::test]
async fn operations_without_a_session_fail_without_any_request() {
    let ensemble = MemoryEnsemble::new();
    let client = client_for(&ensemble, ClientSettings::default());

    assert_eq!(
        client.get_data("/config").await,
        Err(NodeError::SessionExpired)
    );
    assert_eq!(
        client.create("/config", b"v1").await,
        Err(NodeError::SessionExpired)
    );
    assert_eq!(client.expand("/").await, Err(NodeError::SessionExpired));
    assert_eq!(ensemble.total_requests(), 0);
}

#[tokio::test]
async fn a_missing_session_is_reported_before_argument_checks() {
    let ensemble = MemoryEnsemble::new();
    let client = client_for(&ensemble, ClientSettings::default());

    assert_eq!(client.create("/", b"").await, Err(NodeError::SessionExpired));
    assert_eq!(
        client.remove_recursive("/").await,
        Err(NodeError::SessionExpired)
    );
    assert_eq!(
        client.set_acl("/config", &[]).await,
        Err(NodeError::SessionExpired)
    );
    assert_eq!(ensemble.total_requests(), 0);
}

#[tokio::test]
async fn close_is_accepted_once_per_handle() {
    let ensemble = MemoryEnsemble::new();
    let client = client_for(&ensemble, ClientSettings::default());

    let handle = client.connect("127.0.0.1:2181").await.expect("connect");
    client.expand("/").await.expect("expand");
    client.close(handle).await.expect("close");

    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(ensemble.session_ids().is_empty());
    assert!(!client.is_cached(&ZkPath::root()).await);
    assert_eq!(client.close(handle).await, Err(CloseError::AlreadyClosed));
}

#[tokio::test]
async fn reconnect_closes_the_previous_session_and_retires_its_handle() {
    let ensemble = MemoryEnsemble::new();
    let client = client_for(&ensemble, ClientSettings::default());

    let first = client.connect("127.0.0.1:2181").await.expect("first");
    let second = client.connect("127.0.0.1:2181").await.expect("second");

    assert_ne!(first.generation(), second.generation());
    assert_eq!(ensemble.session_ids(), vec![second.session_id()]);
    assert_eq!(client.close(first).await, Err(CloseError::AlreadyClosed));
    client.close(second).await.expect("close current");
}

#[tokio::test]
async fn server_expiry_clears_cache_and_blocks_operations() {
    let ensemble = MemoryEnsemble::new();
    ensemble.seed("/app", b"").expect("seed");
    let client = client_for(&ensemble, ClientSettings::default());

    let handle = client.connect("127.0.0.1:2181").await.expect("connect");
    client.expand("/").await.expect("expand");
    assert!(client.is_cached(&ZkPath::root()).await);

    ensemble.expire_session(handle.session_id());
    wait_for_state(&client, ConnectionState::Expired).await;

    assert!(!client.is_cached(&ZkPath::root()).await);
    assert_eq!(client.get_data("/app").await, Err(NodeError::SessionExpired));

    client.close(handle).await.expect("close expired session");
    assert_eq!(client.close(handle).await, Err(CloseError::AlreadyClosed));
}

#[tokio::test]
async fn transport_loss_moves_session_to_expired() {
    let ensemble = MemoryEnsemble::new();
    let client = client_for(&ensemble, ClientSettings::default());

    client.connect("127.0.0.1:2181").await.expect("connect");
    ensemble.drop_connections();

    wait_for_state(&client, ConnectionState::Expired).await;
    assert_eq!(client.exists("/").await, Err(NodeError::SessionExpired));
}

#[tokio::test]
async fn slow_handshake_times_out() {
    let ensemble = MemoryEnsemble::new();
    ensemble.set_connect_delay(Some(Duration::from_secs(5)));
    let settings = ClientSettings {
        connect_timeout: Duration::from_millis(50),
        ..ClientSettings::default()
    };
    let client = client_for(&ensemble, settings);

    let err = client
        .connect("127.0.0.1:2181")
        .await
        .expect_err("timeout");
    assert_eq!(
        err,
        ConnectError::Timeout {
            timeout: Duration::from_millis(50)
        }
    );
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn malformed_connection_strings_are_rejected_before_connecting() {
    let ensemble = MemoryEnsemble::new();
    let client = client_for(&ensemble, ClientSettings::default());

    let err = client.connect("localhost").await.expect_err("invalid");
    assert!(matches!(err, ConnectError::InvalidConnectString { .. }));
    assert!(ensemble.session_ids().is_empty());
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn refused_connections_report_unreachable() {
    let ensemble = MemoryEnsemble::new();
    ensemble.refuse_connections(true);
    let client = client_for(&ensemble, ClientSettings::default());

    let err = client.connect("127.0.0.1:2181").await.expect_err("refused");
    assert!(matches!(err, ConnectError::Unreachable { .. }));
}

#[tokio::test]
async fn rejected_credentials_fail_the_connect() {
    let ensemble = MemoryEnsemble::new();
    ensemble.reject_auth(true);
    let client = client_for(&ensemble, ClientSettings::default());

    let err = client.connect("127.0.0.1:2181").await.expect_err("auth failed");
    assert_eq!(
        err,
        ConnectError::AuthFailed {
            hosts: "127.0.0.1:2181".into()
        }
    );
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(client.session_handle().await, None);
    assert!(ensemble.session_ids().is_empty());

    ensemble.reject_auth(false);
    client.connect("127.0.0.1:2181").await.expect("accepted");
    assert_eq!(client.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn state_changes_are_published_as_client_events() {
    let ensemble = MemoryEnsemble::new();
    let client = client_for(&ensemble, ClientSettings::default());
    let mut events = client.subscribe_events();

    let handle = client.connect_default().await.expect("connect");
    client.close(handle).await.expect("close");

    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ClientEvent::SessionStateChanged(state) = event {
            states.push(state);
        }
    }
    assert_eq!(
        states,
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Disconnected
        ]
    );
}
