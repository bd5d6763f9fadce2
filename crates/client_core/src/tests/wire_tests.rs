use shared::protocol::{JuteWriter, OpCode, AUTH_XID, NOTIFICATION_XID};
use tokio::net::TcpListener;

use super::*;

/// What the scripted server does with one decoded request.
enum Reply {
    Body(Vec<u8>),
    Error(ErrorCode),
    BodyThenNotify(Vec<u8>, RawWatchEvent),
    Hangup,
}

fn reply_frame(xid: i32, err: i32, body: &[u8]) -> Vec<u8> {
    let mut w = JuteWriter::new();
    ReplyHeader { xid, zxid: 7, err }.write(&mut w);
    let mut payload = w.into_inner();
    payload.extend_from_slice(body);
    let mut frame = (payload.len() as i32).to_be_bytes().to_vec();
    frame.extend_from_slice(&payload);
    frame
}

fn notification_frame(event: &RawWatchEvent) -> Vec<u8> {
    let mut w = JuteWriter::new();
    ReplyHeader {
        xid: NOTIFICATION_XID,
        zxid: -1,
        err: 0,
    }
    .write(&mut w);
    event.write(&mut w);
    w.into_frame()
}

fn stat_body(stat: &Stat) -> Vec<u8> {
    let mut w = JuteWriter::new();
    w.write_stat(stat);
    w.into_inner()
}

async fn scripted_server<F>(timeout_ms: i32, handler: F) -> ConnectString
where
    F: FnMut(&Request) -> Reply + Send + 'static,
{
    greeting_server(timeout_ms, Vec::new(), handler).await
}

/// Accepts one client, answers the handshake with `timeout_ms`, writes the
/// `greeting` frames, then serves requests through `handler`. Pings and
/// close-session are answered directly.
async fn greeting_server<F>(
    timeout_ms: i32,
    greeting: Vec<Vec<u8>>,
    mut handler: F,
) -> ConnectString
where
    F: FnMut(&Request) -> Reply + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let hello = read_frame(&mut reader).await.expect("connect request");
        let request = ConnectRequest::decode(&hello).expect("decode connect");
        assert_eq!(request.session_id, 0);
        let response = ConnectResponse {
            protocol_version: 0,
            timeout_ms,
            session_id: 0x42,
            password: vec![0; 16],
            read_only: false,
        };
        write_half
            .write_all(&response.to_frame())
            .await
            .expect("connect response");
        for frame in greeting {
            write_half.write_all(&frame).await.expect("greeting");
        }

        while let Ok(payload) = read_frame(&mut reader).await {
            let (xid, request) = Request::decode(&payload).expect("decode request");
            let frames = match request {
                Request::Ping => vec![reply_frame(PING_XID, 0, &[])],
                Request::CloseSession => vec![reply_frame(xid, 0, &[])],
                ref other => match handler(other) {
                    Reply::Body(body) => vec![reply_frame(xid, 0, &body)],
                    Reply::Error(code) => vec![reply_frame(xid, code.code(), &[])],
                    Reply::BodyThenNotify(body, event) => {
                        vec![reply_frame(xid, 0, &body), notification_frame(&event)]
                    }
                    Reply::Hangup => return,
                },
            };
            for frame in frames {
                if write_half.write_all(&frame).await.is_err() {
                    return;
                }
            }
        }
    });

    ConnectString::parse(&addr.to_string()).expect("connect string")
}

fn path(raw: &str) -> ZkPath {
    ZkPath::parse(raw).expect("valid path")
}

async fn next_event(connection: &mut Connection) -> RawWatchEvent {
    timeout(Duration::from_secs(2), connection.events.recv())
        .await
        .expect("in time")
        .expect("event")
}

#[tokio::test]
async fn handshake_negotiates_session_and_reads_data() {
    let target = scripted_server(6_000, |request| match request {
        Request::GetData { path, watch } => {
            assert_eq!(path, "/config");
            assert!(!watch);
            let mut w = JuteWriter::new();
            w.write_buffer(Some(b"v1".as_slice())).write_stat(&Stat {
                version: 4,
                data_length: 2,
                ..Stat::default()
            });
            Reply::Body(w.into_inner())
        }
        other => panic!("unexpected request {:?}", other.op_code()),
    })
    .await;

    let connection = WireConnector
        .connect(&target, Duration::from_secs(30))
        .await
        .expect("connect");
    assert_eq!(connection.negotiated_timeout, Duration::from_secs(6));
    assert_eq!(connection.coordinator.session_id(), 0x42);

    let (data, stat) = connection
        .coordinator
        .get_data(&path("/config"), false)
        .await
        .expect("get data");
    assert_eq!(data, b"v1");
    assert_eq!(stat.version, 4);

    connection.coordinator.close().await.expect("close");
}

#[tokio::test]
async fn error_replies_map_to_codes_and_exists_absorbs_no_node() {
    let target = scripted_server(6_000, |request| match request.op_code() {
        OpCode::Exists | OpCode::Delete => Reply::Error(ErrorCode::NoNode),
        OpCode::SetData => Reply::Error(ErrorCode::BadVersion),
        OpCode::SetAcl => Reply::Body(stat_body(&Stat {
            aversion: 2,
            ..Stat::default()
        })),
        other => panic!("unexpected request {other:?}"),
    })
    .await;

    let connection = WireConnector
        .connect(&target, Duration::from_secs(30))
        .await
        .expect("connect");
    let zk = &connection.coordinator;

    assert_eq!(zk.exists(&path("/gone"), true).await, Ok(None));
    assert_eq!(
        zk.delete(&path("/gone"), -1).await,
        Err(ServerError::Code(ErrorCode::NoNode))
    );
    assert_eq!(
        zk.set_data(&path("/v"), b"x", 3).await,
        Err(ServerError::Code(ErrorCode::BadVersion))
    );
    let stat = zk
        .set_acl(&path("/v"), &AclEntry::open_unsafe(), -1)
        .await
        .expect("set acl");
    assert_eq!(stat.aversion, 2);
}

#[tokio::test]
async fn notifications_are_forwarded_to_the_event_channel() {
    let target = scripted_server(6_000, |request| match request {
        Request::GetChildren { path, watch: true } => {
            let mut w = JuteWriter::new();
            w.write_i32(1).write_str("child").write_stat(&Stat::default());
            Reply::BodyThenNotify(
                w.into_inner(),
                RawWatchEvent {
                    event_type: 4,
                    state: 3,
                    path: path.clone(),
                },
            )
        }
        other => panic!("unexpected request {:?}", other.op_code()),
    })
    .await;

    let mut connection = WireConnector
        .connect(&target, Duration::from_secs(30))
        .await
        .expect("connect");

    let (children, _) = connection
        .coordinator
        .get_children(&path("/svc"), true)
        .await
        .expect("children");
    assert_eq!(children, vec!["child"]);

    assert_eq!(
        next_event(&mut connection).await,
        RawWatchEvent::session_state(KeeperState::SyncConnected.code())
    );
    let event = next_event(&mut connection).await;
    assert_eq!(
        event,
        RawWatchEvent {
            event_type: 4,
            state: 3,
            path: "/svc".into(),
        }
    );
}

#[tokio::test]
async fn server_hangup_fails_pending_requests_and_reports_disconnect() {
    let target = scripted_server(6_000, |_| Reply::Hangup).await;

    let mut connection = WireConnector
        .connect(&target, Duration::from_secs(30))
        .await
        .expect("connect");

    assert_eq!(
        connection.coordinator.get_data(&path("/a"), false).await,
        Err(ServerError::ConnectionLoss)
    );
    assert_eq!(
        next_event(&mut connection).await.state,
        KeeperState::SyncConnected.code()
    );
    let event = next_event(&mut connection).await;
    assert_eq!(
        event,
        RawWatchEvent::session_state(KeeperState::Disconnected.code())
    );
    assert_eq!(
        connection.coordinator.exists(&path("/a"), false).await,
        Err(ServerError::ConnectionLoss)
    );
}

#[tokio::test]
async fn zero_negotiated_timeout_means_the_session_was_rejected() {
    let target = scripted_server(0, |_| Reply::Hangup).await;

    let err = WireConnector
        .connect(&target, Duration::from_secs(30))
        .await
        .err()
        .expect("rejected");
    assert!(matches!(err, ConnectError::SessionRejected { .. }));
}

#[tokio::test]
async fn closed_ports_are_unreachable() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let target = ConnectString::parse(&addr.to_string()).expect("connect string");
    let err = WireConnector
        .connect(&target, Duration::from_secs(30))
        .await
        .err()
        .expect("unreachable");
    match err {
        ConnectError::Unreachable { hosts, .. } => assert_eq!(hosts, addr.to_string()),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn requests_after_close_fail_fast() {
    let target = scripted_server(6_000, |_| Reply::Body(Vec::new())).await;
    let connection = WireConnector
        .connect(&target, Duration::from_secs(30))
        .await
        .expect("connect");

    connection.coordinator.close().await.expect("close");
    connection.coordinator.close().await.expect("second close is a no-op");
    assert_eq!(
        connection.coordinator.delete(&path("/a"), -1).await,
        Err(ServerError::ConnectionLoss)
    );
}

#[tokio::test]
async fn rejected_credentials_surface_as_an_auth_failed_state() {
    let target = greeting_server(
        6_000,
        vec![reply_frame(AUTH_XID, ErrorCode::AuthFailed.code(), &[])],
        |_| Reply::Body(Vec::new()),
    )
    .await;

    let mut connection = WireConnector
        .connect(&target, Duration::from_secs(30))
        .await
        .expect("handshake itself succeeds");

    assert_eq!(
        next_event(&mut connection).await.state,
        KeeperState::SyncConnected.code()
    );
    assert_eq!(
        next_event(&mut connection).await,
        RawWatchEvent::session_state(KeeperState::AuthFailed.code())
    );
}
