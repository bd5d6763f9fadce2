use std::{sync::Arc, time::Duration};

use serde::Serialize;
use shared::{
    domain::{ConnectString, ConnectionState, KeeperState},
    error::{CloseError, ConnectError, NodeError},
    protocol::RawWatchEvent,
};
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
    time::{timeout_at, Instant},
};
use tracing::{debug, info, warn};

use crate::transport::{Connector, Coordinator, EventReceiver};

/// Identifies one established session. Handles from an earlier connect stay
/// distinguishable after a reconnect through their generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SessionHandle {
    generation: u64,
    session_id: i64,
}

impl SessionHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn session_id(&self) -> i64 {
        self.session_id
    }
}

struct ActiveSession {
    handle: SessionHandle,
    coordinator: Arc<dyn Coordinator>,
    relay: Option<JoinHandle<()>>,
    negotiated_timeout: Duration,
    expired: bool,
}

impl ActiveSession {
    async fn shutdown(mut self) {
        if let Some(relay) = self.relay.take() {
            relay.abort();
        }
        if let Err(err) = self.coordinator.close().await {
            debug!(
                generation = self.handle.generation,
                "session: close request failed: {err}"
            );
        }
    }
}

#[derive(Default)]
struct SessionSlot {
    generation: u64,
    active: Option<ActiveSession>,
}

/// Owns the single session: connect, close, expiry and the published state.
pub struct SessionManager {
    connector: Arc<dyn Connector>,
    session_timeout: Duration,
    connect_timeout: Duration,
    slot: Mutex<SessionSlot>,
    state_tx: watch::Sender<ConnectionState>,
}

impl SessionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        session_timeout: Duration,
        connect_timeout: Duration,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector,
            session_timeout,
            connect_timeout,
            slot: Mutex::new(SessionSlot::default()),
            state_tx,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    /// Opens a new session, closing any active one first. Resolves only once
    /// the server has confirmed the session or the connect timeout elapsed.
    pub async fn connect(
        &self,
        raw: &str,
    ) -> Result<(SessionHandle, EventReceiver), ConnectError> {
        let target = ConnectString::parse(raw)?;

        let (generation, previous) = {
            let mut slot = self.slot.lock().await;
            slot.generation += 1;
            (slot.generation, slot.active.take())
        };
        if let Some(previous) = previous {
            info!(
                generation = previous.handle.generation,
                "session: closing previous session before reconnect"
            );
            previous.shutdown().await;
        }
        self.set_state(ConnectionState::Connecting);
        info!(hosts = %target, generation, "session: connecting");

        let deadline = Instant::now() + self.connect_timeout;
        let attempt = timeout_at(
            deadline,
            self.connector.connect(&target, self.session_timeout),
        )
        .await;
        let mut connection = match attempt {
            Ok(Ok(connection)) => connection,
            Ok(Err(err)) => {
                warn!(hosts = %target, "session: connect failed: {err}");
                self.settle_failed_attempt(generation).await;
                return Err(err);
            }
            Err(_) => {
                warn!(hosts = %target, timeout = ?self.connect_timeout, "session: connect timed out");
                self.settle_failed_attempt(generation).await;
                return Err(ConnectError::Timeout {
                    timeout: self.connect_timeout,
                });
            }
        };

        let confirmed = timeout_at(deadline, confirm_session(&mut connection.events, &target))
            .await
            .unwrap_or(Err(ConnectError::Timeout {
                timeout: self.connect_timeout,
            }));
        if let Err(err) = confirmed {
            warn!(hosts = %target, "session: not confirmed: {err}");
            let _ = connection.coordinator.close().await;
            self.settle_failed_attempt(generation).await;
            return Err(err);
        }

        let mut slot = self.slot.lock().await;
        if slot.generation != generation {
            drop(slot);
            let _ = connection.coordinator.close().await;
            return Err(ConnectError::Unreachable {
                hosts: target.to_string(),
                reason: "superseded by a newer connect".to_string(),
            });
        }
        let handle = SessionHandle {
            generation,
            session_id: connection.coordinator.session_id(),
        };
        slot.active = Some(ActiveSession {
            handle,
            coordinator: connection.coordinator,
            relay: None,
            negotiated_timeout: connection.negotiated_timeout,
            expired: false,
        });
        drop(slot);

        self.set_state(ConnectionState::Connected);
        info!(
            generation,
            session_id = %format!("{:#x}", handle.session_id),
            negotiated = ?connection.negotiated_timeout,
            "session: connected"
        );
        Ok((handle, connection.events))
    }

    async fn settle_failed_attempt(&self, generation: u64) {
        if self.slot.lock().await.generation == generation {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    /// Registers the relay task for `generation`; aborts it if that session is
    /// already gone.
    pub(crate) async fn attach_relay(&self, generation: u64, relay: JoinHandle<()>) {
        let mut slot = self.slot.lock().await;
        match slot.active.as_mut() {
            Some(active) if active.handle.generation == generation => {
                active.relay = Some(relay);
            }
            _ => relay.abort(),
        }
    }

    pub async fn close(&self, handle: SessionHandle) -> Result<(), CloseError> {
        let active = {
            let mut slot = self.slot.lock().await;
            let owned = slot
                .active
                .as_ref()
                .is_some_and(|active| active.handle == handle);
            if owned {
                slot.active.take()
            } else {
                None
            }
        };
        let Some(active) = active else {
            return Err(CloseError::AlreadyClosed);
        };
        active.shutdown().await;
        self.set_state(ConnectionState::Disconnected);
        info!(generation = handle.generation, "session: closed");
        Ok(())
    }

    /// Marks the session of `generation` expired and releases its transport.
    /// Returns false when that session is no longer the active one.
    pub(crate) async fn expire(&self, generation: u64) -> bool {
        let coordinator = {
            let mut slot = self.slot.lock().await;
            match slot.active.as_mut() {
                Some(active) if active.handle.generation == generation && !active.expired => {
                    active.expired = true;
                    Arc::clone(&active.coordinator)
                }
                _ => return false,
            }
        };
        self.set_state(ConnectionState::Expired);
        warn!(generation, "session: expired");
        if let Err(err) = coordinator.close().await {
            debug!(generation, "session: releasing expired transport failed: {err}");
        }
        true
    }

    /// The live coordinator and its generation, or `SessionExpired` when no
    /// connected session exists.
    pub(crate) async fn coordinator(&self) -> Result<(u64, Arc<dyn Coordinator>), NodeError> {
        let slot = self.slot.lock().await;
        match slot.active.as_ref() {
            Some(active) if !active.expired => {
                Ok((active.handle.generation, Arc::clone(&active.coordinator)))
            }
            _ => Err(NodeError::SessionExpired),
        }
    }

    pub(crate) async fn is_current(&self, generation: u64) -> bool {
        let slot = self.slot.lock().await;
        slot.generation == generation
            && slot
                .active
                .as_ref()
                .is_some_and(|active| !active.expired)
    }

    pub async fn handle(&self) -> Option<SessionHandle> {
        self.slot
            .lock()
            .await
            .active
            .as_ref()
            .map(|active| active.handle)
    }

    pub async fn negotiated_timeout(&self) -> Option<Duration> {
        self.slot
            .lock()
            .await
            .active
            .as_ref()
            .filter(|active| !active.expired)
            .map(|active| active.negotiated_timeout)
    }
}

/// Waits for the first session state the server pushes after the handshake.
/// Only SyncConnected makes the session usable.
async fn confirm_session(
    events: &mut EventReceiver,
    target: &ConnectString,
) -> Result<(), ConnectError> {
    while let Some(event) = events.recv().await {
        if event.event_type != RawWatchEvent::NONE_TYPE {
            debug!(path = %event.path, "session: node event before confirmation ignored");
            continue;
        }
        return match KeeperState::from_code(event.state) {
            Some(KeeperState::SyncConnected) => Ok(()),
            Some(KeeperState::AuthFailed) => Err(ConnectError::AuthFailed {
                hosts: target.to_string(),
            }),
            Some(state) => Err(ConnectError::Unreachable {
                hosts: target.to_string(),
                reason: format!("session ended before it was confirmed: {state:?}"),
            }),
            None => {
                warn!(state = event.state, "session: unknown state before confirmation");
                continue;
            }
        };
    }
    Err(ConnectError::Unreachable {
        hosts: target.to_string(),
        reason: "connection closed before the session was confirmed".to_string(),
    })
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
