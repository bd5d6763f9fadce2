use std::{
    collections::HashMap,
    io,
    sync::{
        atomic::{AtomicBool, AtomicI32, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use shared::{
    domain::{AclEntry, ConnectString, CreateMode, HostPort, KeeperState, Stat, ZkPath},
    error::{ConnectError, ErrorCode, ServerError},
    protocol::{
        check_frame_len, decode_acl, decode_children, decode_created_path, decode_data,
        decode_stat, ConnectRequest, ConnectResponse, JuteReader, RawWatchEvent, ReplyHeader,
        Request, AUTH_XID, NOTIFICATION_XID, PING_XID,
    },
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::{mpsc, oneshot, Mutex},
    task::JoinHandle,
    time::{interval, timeout, MissedTickBehavior},
};
use tracing::{debug, info, trace, warn};

use super::{Connection, Connector, Coordinator};

const CLOSE_GRACE: Duration = Duration::from_millis(500);
const MIN_PING_INTERVAL: Duration = Duration::from_millis(100);

type ReplySender = oneshot::Sender<Result<Vec<u8>, ServerError>>;
type PendingReplies = Arc<Mutex<HashMap<i32, ReplySender>>>;

/// Connects over TCP, trying each host of the connection string in order.
#[derive(Debug, Default, Clone)]
pub struct WireConnector;

#[async_trait]
impl Connector for WireConnector {
    async fn connect(
        &self,
        target: &ConnectString,
        session_timeout: Duration,
    ) -> Result<Connection, ConnectError> {
        let mut last_reason = String::from("no hosts to try");
        for host in target.hosts() {
            let stream = match TcpStream::connect((host.host.as_str(), host.port)).await {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(host = %host, "session: tcp connect failed: {err}");
                    last_reason = err.to_string();
                    continue;
                }
            };
            match handshake(stream, host, session_timeout).await {
                Ok(connection) => return Ok(connection),
                Err(ConnectError::Unreachable { reason, .. }) => {
                    warn!(host = %host, "session: handshake failed: {reason}");
                    last_reason = reason;
                }
                Err(err) => return Err(err),
            }
        }
        Err(ConnectError::Unreachable {
            hosts: target.to_string(),
            reason: last_reason,
        })
    }
}

async fn handshake(
    stream: TcpStream,
    host: &HostPort,
    session_timeout: Duration,
) -> Result<Connection, ConnectError> {
    let unreachable_err = |err: &dyn std::fmt::Display| ConnectError::Unreachable {
        hosts: host.to_string(),
        reason: err.to_string(),
    };

    let _ = stream.set_nodelay(true);
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let timeout_ms = i32::try_from(session_timeout.as_millis()).unwrap_or(i32::MAX);
    write_half
        .write_all(&ConnectRequest::new_session(timeout_ms).to_frame())
        .await
        .map_err(|err| unreachable_err(&err))?;

    let payload = read_frame(&mut reader)
        .await
        .map_err(|err| unreachable_err(&err))?;
    let response = ConnectResponse::decode(&payload).map_err(|err| unreachable_err(&err))?;
    if response.timeout_ms <= 0 {
        return Err(ConnectError::SessionRejected {
            host: host.to_string(),
        });
    }

    let negotiated_timeout = Duration::from_millis(response.timeout_ms as u64);
    info!(
        host = %host,
        session_id = %format!("{:#x}", response.session_id),
        negotiated_ms = response.timeout_ms,
        "session: established"
    );

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let _ = events_tx.send(RawWatchEvent::session_state(
        KeeperState::SyncConnected.code(),
    ));
    let session = WireSession::start(
        response.session_id,
        reader,
        write_half,
        events_tx,
        negotiated_timeout,
    );

    Ok(Connection {
        coordinator: Arc::new(session),
        events: events_rx,
        negotiated_timeout,
    })
}

pub(crate) async fn read_frame<R>(reader: &mut R) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_i32().await?;
    let len = check_frame_len(len).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

/// One live session over a split TCP stream. A reader task resolves pending
/// replies by xid and forwards notifications; a writer task drains outbound
/// frames; a ping task keeps the session alive.
pub struct WireSession {
    session_id: i64,
    next_xid: AtomicI32,
    pending: PendingReplies,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    closed: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WireSession {
    fn start(
        session_id: i64,
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
        events: mpsc::UnboundedSender<RawWatchEvent>,
        negotiated_timeout: Duration,
    ) -> Self {
        let pending: PendingReplies = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let closing = Arc::new(AtomicBool::new(false));
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        let reader_task = tokio::spawn(read_loop(
            reader,
            Arc::clone(&pending),
            events,
            Arc::clone(&closed),
            Arc::clone(&closing),
        ));
        let writer_task = tokio::spawn(write_loop(writer, outbound_rx));
        let ping_task = tokio::spawn(ping_loop(
            outbound.clone(),
            (negotiated_timeout / 3).max(MIN_PING_INTERVAL),
        ));

        Self {
            session_id,
            next_xid: AtomicI32::new(1),
            pending,
            outbound,
            closed,
            closing,
            tasks: Mutex::new(vec![reader_task, writer_task, ping_task]),
        }
    }

    async fn submit(&self, request: Request) -> Result<Vec<u8>, ServerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ServerError::ConnectionLoss);
        }
        let xid = self.next_xid.fetch_add(1, Ordering::SeqCst);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().await.insert(xid, reply_tx);

        // the reader may have drained `pending` between the first check and the insert
        if self.closed.load(Ordering::SeqCst) || self.outbound.send(request.to_frame(xid)).is_err()
        {
            self.pending.lock().await.remove(&xid);
            return Err(ServerError::ConnectionLoss);
        }
        trace!(xid, op = ?request.op_code(), "wire: request sent");
        reply_rx.await.unwrap_or(Err(ServerError::ConnectionLoss))
    }
}

async fn read_loop(
    mut reader: BufReader<OwnedReadHalf>,
    pending: PendingReplies,
    events: mpsc::UnboundedSender<RawWatchEvent>,
    closed: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
) {
    loop {
        let payload = match read_frame(&mut reader).await {
            Ok(payload) => payload,
            Err(err) => {
                if !closing.load(Ordering::SeqCst) {
                    warn!("wire: connection lost: {err}");
                }
                break;
            }
        };
        let mut r = JuteReader::new(&payload);
        let header = match ReplyHeader::read(&mut r) {
            Ok(header) => header,
            Err(err) => {
                warn!("wire: malformed reply header, dropping connection: {err}");
                break;
            }
        };
        match header.xid {
            NOTIFICATION_XID => match RawWatchEvent::decode(&mut r) {
                Ok(event) => {
                    debug!(
                        event_type = event.event_type,
                        state = event.state,
                        path = %event.path,
                        "wire: notification"
                    );
                    let _ = events.send(event);
                }
                Err(err) => warn!("wire: dropping malformed notification: {err}"),
            },
            PING_XID => trace!("wire: ping reply"),
            AUTH_XID if header.err != 0 => {
                warn!(err = header.err, "wire: server rejected client credentials");
                let _ = events.send(RawWatchEvent::session_state(
                    KeeperState::AuthFailed.code(),
                ));
            }
            AUTH_XID => trace!("wire: auth accepted"),
            xid => {
                let Some(reply_tx) = pending.lock().await.remove(&xid) else {
                    warn!(xid, "wire: reply for unknown request");
                    continue;
                };
                let result = match ErrorCode::from_code(header.err) {
                    None => Ok(r.rest().to_vec()),
                    Some(code) => Err(ServerError::Code(code)),
                };
                let _ = reply_tx.send(result);
            }
        }
    }

    closed.store(true, Ordering::SeqCst);
    for (_, reply_tx) in pending.lock().await.drain() {
        let _ = reply_tx.send(Err(ServerError::ConnectionLoss));
    }
    if !closing.load(Ordering::SeqCst) {
        let _ = events.send(RawWatchEvent::session_state(
            KeeperState::Disconnected.code(),
        ));
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut outbound: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(frame) = outbound.recv().await {
        if let Err(err) = writer.write_all(&frame).await {
            warn!("wire: write failed: {err}");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn ping_loop(outbound: mpsc::UnboundedSender<Vec<u8>>, every: Duration) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if outbound.send(Request::Ping.to_frame(PING_XID)).is_err() {
            break;
        }
    }
}

#[async_trait]
impl Coordinator for WireSession {
    fn session_id(&self) -> i64 {
        self.session_id
    }

    async fn get_children(
        &self,
        path: &ZkPath,
        watch: bool,
    ) -> Result<(Vec<String>, Stat), ServerError> {
        let body = self
            .submit(Request::GetChildren {
                path: path.to_string(),
                watch,
            })
            .await?;
        Ok(decode_children(&body)?)
    }

    async fn get_data(&self, path: &ZkPath, watch: bool) -> Result<(Vec<u8>, Stat), ServerError> {
        let body = self
            .submit(Request::GetData {
                path: path.to_string(),
                watch,
            })
            .await?;
        Ok(decode_data(&body)?)
    }

    async fn exists(&self, path: &ZkPath, watch: bool) -> Result<Option<Stat>, ServerError> {
        let reply = self
            .submit(Request::Exists {
                path: path.to_string(),
                watch,
            })
            .await;
        match reply {
            Ok(body) => Ok(Some(decode_stat(&body)?)),
            Err(ServerError::Code(ErrorCode::NoNode)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn set_data(
        &self,
        path: &ZkPath,
        data: &[u8],
        version: i32,
    ) -> Result<Stat, ServerError> {
        let body = self
            .submit(Request::SetData {
                path: path.to_string(),
                data: data.to_vec(),
                version,
            })
            .await?;
        Ok(decode_stat(&body)?)
    }

    async fn get_acl(&self, path: &ZkPath) -> Result<(Vec<AclEntry>, Stat), ServerError> {
        let body = self
            .submit(Request::GetAcl {
                path: path.to_string(),
            })
            .await?;
        Ok(decode_acl(&body)?)
    }

    async fn set_acl(
        &self,
        path: &ZkPath,
        acl: &[AclEntry],
        version: i32,
    ) -> Result<Stat, ServerError> {
        let body = self
            .submit(Request::SetAcl {
                path: path.to_string(),
                acl: acl.to_vec(),
                version,
            })
            .await?;
        Ok(decode_stat(&body)?)
    }

    async fn create(
        &self,
        path: &ZkPath,
        data: &[u8],
        acl: &[AclEntry],
        mode: CreateMode,
    ) -> Result<String, ServerError> {
        let body = self
            .submit(Request::Create {
                path: path.to_string(),
                data: data.to_vec(),
                acl: acl.to_vec(),
                flags: mode.flags(),
            })
            .await?;
        Ok(decode_created_path(&body)?)
    }

    async fn delete(&self, path: &ZkPath, version: i32) -> Result<(), ServerError> {
        self.submit(Request::Delete {
            path: path.to_string(),
            version,
        })
        .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), ServerError> {
        if self.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if !self.closed.load(Ordering::SeqCst) {
            match timeout(CLOSE_GRACE, self.submit(Request::CloseSession)).await {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => debug!("wire: close-session request failed: {err}"),
                Err(_) => debug!("wire: no close-session reply within {CLOSE_GRACE:?}"),
            }
        }

        self.closed.store(true, Ordering::SeqCst);
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        for (_, reply_tx) in self.pending.lock().await.drain() {
            let _ = reply_tx.send(Err(ServerError::ConnectionLoss));
        }
        info!(
            session_id = %format!("{:#x}", self.session_id),
            "session: closed"
        );
        Ok(())
    }
}

#[cfg(test)]
#[path = "../tests/wire_tests.rs"]
mod tests;
