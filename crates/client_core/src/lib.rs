use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use shared::{
    domain::{ChangeRecord, ConnectionState, KeeperState, ZkPath},
    error::{CloseError, ConnectError},
};
use tokio::sync::{broadcast, watch as state_watch, Mutex};
use tracing::info;

pub mod cache;
pub mod config;
mod ops;
pub mod session;
pub mod transport;
pub mod watch;

pub use cache::{SearchResult, TreeNode};
pub use config::ClientSettings;
pub use ops::CreateOptions;
pub use session::SessionHandle;
pub use watch::{EventLog, LogEntry, WatchKind, WatchState};

use cache::TreeCache;
use session::SessionManager;
use transport::{Connector, WireConnector};
use watch::WatchRegistry;

#[derive(Debug, Clone)]
pub enum ClientEvent {
    SessionStateChanged(ConnectionState),
    NodeChanged(ChangeRecord),
    Log(LogEntry),
    Error(String),
}

/// Session, node operations, watch relay and tree cache behind one handle.
pub struct ZkClient {
    settings: ClientSettings,
    auto_refresh: AtomicBool,
    session: SessionManager,
    cache: Mutex<TreeCache>,
    watches: Mutex<WatchRegistry>,
    log: EventLog,
    events: broadcast::Sender<ClientEvent>,
}

impl ZkClient {
    pub fn new(settings: ClientSettings) -> Arc<Self> {
        Self::with_connector(settings, Arc::new(WireConnector))
    }

    pub fn with_connector(settings: ClientSettings, connector: Arc<dyn Connector>) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            auto_refresh: AtomicBool::new(settings.auto_refresh),
            session: SessionManager::new(
                connector,
                settings.session_timeout,
                settings.connect_timeout,
            ),
            cache: Mutex::new(TreeCache::default()),
            watches: Mutex::new(WatchRegistry::default()),
            log: EventLog::new(settings.event_log_capacity),
            events,
            settings,
        })
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_state(&self) -> state_watch::Receiver<ConnectionState> {
        self.session.subscribe_state()
    }

    pub fn state(&self) -> ConnectionState {
        self.session.state()
    }

    /// Shared handle to the relay's log; clearing it clears it for everyone.
    pub fn event_log(&self) -> EventLog {
        self.log.clone()
    }

    pub fn auto_refresh(&self) -> bool {
        self.auto_refresh.load(Ordering::SeqCst)
    }

    /// Applies to reads issued from now on; watches already armed keep their
    /// state until they fire.
    pub fn set_auto_refresh(&self, enabled: bool) {
        self.auto_refresh.store(enabled, Ordering::SeqCst);
    }

    pub async fn session_handle(&self) -> Option<SessionHandle> {
        self.session.handle().await
    }

    pub async fn connect(self: &Arc<Self>, raw: &str) -> Result<SessionHandle, ConnectError> {
        self.publish_state(ConnectionState::Connecting);
        let result = self.session.connect(raw).await;
        self.reset_session_state().await;
        let (handle, events) = match result {
            Ok(connected) => connected,
            Err(err) => {
                self.publish_state(self.state());
                let _ = self.events.send(ClientEvent::Error(err.to_string()));
                return Err(err);
            }
        };

        let confirmed = KeeperState::SyncConnected;
        self.log_event(format!("session {confirmed:?}[{}]", confirmed.code()));
        let relay = tokio::spawn(watch::run_relay(
            Arc::downgrade(self),
            handle.generation(),
            events,
        ));
        self.session.attach_relay(handle.generation(), relay).await;
        self.publish_state(ConnectionState::Connected);
        Ok(handle)
    }

    /// Connects to the configured connection string.
    pub async fn connect_default(self: &Arc<Self>) -> Result<SessionHandle, ConnectError> {
        let raw = self.settings.connect_string.clone();
        self.connect(&raw).await
    }

    pub async fn close(&self, handle: SessionHandle) -> Result<(), CloseError> {
        self.session.close(handle).await?;
        self.reset_session_state().await;
        self.publish_state(ConnectionState::Disconnected);
        Ok(())
    }

    pub(crate) async fn expire(&self, generation: u64) {
        if self.session.expire(generation).await {
            self.reset_session_state().await;
            self.publish_state(ConnectionState::Expired);
        }
    }

    async fn reset_session_state(&self) {
        self.cache.lock().await.clear();
        self.watches.lock().await.clear();
    }

    fn publish_state(&self, state: ConnectionState) {
        info!(%state, "client: session state");
        let _ = self.events.send(ClientEvent::SessionStateChanged(state));
    }

    pub async fn watch_state(&self, path: &str, kind: WatchKind) -> Option<WatchState> {
        let path = ZkPath::parse(path).ok()?;
        self.watches.lock().await.state(&path, kind)
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
