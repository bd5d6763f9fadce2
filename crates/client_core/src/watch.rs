//! One-shot watch bookkeeping, the bounded event log, and the task that relays
//! server notifications into cache invalidations and client events.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::{Arc, Mutex, PoisonError, Weak},
};

use chrono::{DateTime, Local};
use serde::Serialize;
use shared::{
    domain::{ChangeKind, ChangeRecord, KeeperState, ZkPath},
    error::NodeError,
    protocol::RawWatchEvent,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{transport::EventReceiver, ClientEvent, ZkClient};

pub const DEFAULT_LOG_CAPACITY: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub at: DateTime<Local>,
    pub message: String,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:   {}",
            self.at.format("%Y-%m-%d %H:%M:%S %3f"),
            self.message
        )
    }
}

/// Ring buffer of the most recent relay messages. Clones share the buffer.
#[derive(Debug, Clone)]
pub struct EventLog {
    entries: Arc<Mutex<VecDeque<LogEntry>>>,
    capacity: usize,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn push(&self, message: impl Into<String>) -> LogEntry {
        let entry = LogEntry {
            at: Local::now(),
            message: message.into(),
        };
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry.clone());
        entry
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Oldest first, one entry per line.
    pub fn render(&self) -> String {
        self.entries()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchKind {
    Data,
    Children,
}

impl WatchKind {
    /// Watch kinds a server notification of `kind` consumes.
    pub fn triggered_by(kind: ChangeKind) -> &'static [WatchKind] {
        match kind {
            ChangeKind::Created | ChangeKind::DataChanged => &[WatchKind::Data],
            ChangeKind::ChildrenChanged => &[WatchKind::Children],
            ChangeKind::Deleted => &[WatchKind::Data, WatchKind::Children],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchState {
    /// The watched read is in flight. A notification may already consume it.
    Pending,
    Armed,
    Fired,
    Lapsed,
}

/// Client-side mirror of the watches the server holds for this session.
#[derive(Debug, Default)]
pub struct WatchRegistry {
    watches: HashMap<(ZkPath, WatchKind), WatchState>,
}

impl WatchRegistry {
    /// Records a watch before the read that requests it is sent. Returns the
    /// previous state so a failed read can put it back.
    pub fn begin(&mut self, path: &ZkPath, kind: WatchKind) -> Option<WatchState> {
        self.watches
            .insert((path.clone(), kind), WatchState::Pending)
    }

    /// The watched read succeeded. Only a still pending entry becomes armed;
    /// one the relay fired in the meantime keeps its state.
    pub fn confirm(&mut self, path: &ZkPath, kind: WatchKind) -> bool {
        match self.watches.get_mut(&(path.clone(), kind)) {
            Some(state) if *state == WatchState::Pending => {
                *state = WatchState::Armed;
                true
            }
            _ => false,
        }
    }

    /// The watched read failed, so the server holds no new watch. A watch
    /// armed before the read is still in place.
    pub fn abandon(&mut self, path: &ZkPath, kind: WatchKind, previous: Option<WatchState>) {
        if let Some(state) = self.watches.get_mut(&(path.clone(), kind)) {
            if *state == WatchState::Pending {
                *state = match previous {
                    Some(WatchState::Armed) => WatchState::Armed,
                    _ => WatchState::Lapsed,
                };
            }
        }
    }

    /// Moves every armed or pending watch that `kind` triggers on `path` to
    /// `Fired` and returns the kinds that fired.
    pub fn fire(&mut self, path: &ZkPath, kind: ChangeKind) -> Vec<WatchKind> {
        WatchKind::triggered_by(kind)
            .iter()
            .copied()
            .filter(|watch_kind| {
                match self.watches.get_mut(&(path.clone(), *watch_kind)) {
                    Some(state) if matches!(*state, WatchState::Armed | WatchState::Pending) => {
                        *state = WatchState::Fired;
                        true
                    }
                    _ => false,
                }
            })
            .collect()
    }

    pub fn lapse(&mut self, path: &ZkPath, kind: WatchKind) {
        if let Some(state) = self.watches.get_mut(&(path.clone(), kind)) {
            *state = WatchState::Lapsed;
        }
    }

    pub fn state(&self, path: &ZkPath, kind: WatchKind) -> Option<WatchState> {
        self.watches.get(&(path.clone(), kind)).copied()
    }

    pub fn armed(&self) -> usize {
        self.watches
            .values()
            .filter(|state| **state == WatchState::Armed)
            .count()
    }

    pub fn clear(&mut self) {
        self.watches.clear();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayedEvent {
    Session(KeeperState),
    Change(ChangeRecord),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedEvent {
    #[error("unknown event type {0}")]
    UnknownType(i32),
    #[error("unknown session state {0}")]
    UnknownState(i32),
    #[error("invalid event path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },
}

pub fn decode_event(raw: &RawWatchEvent) -> Result<RelayedEvent, MalformedEvent> {
    if raw.event_type == RawWatchEvent::NONE_TYPE {
        return KeeperState::from_code(raw.state)
            .map(RelayedEvent::Session)
            .ok_or(MalformedEvent::UnknownState(raw.state));
    }
    let kind =
        ChangeKind::from_code(raw.event_type).ok_or(MalformedEvent::UnknownType(raw.event_type))?;
    let path = ZkPath::parse(raw.path.as_str()).map_err(|err| MalformedEvent::InvalidPath {
        path: raw.path.clone(),
        reason: err.to_string(),
    })?;
    Ok(RelayedEvent::Change(ChangeRecord { path, kind }))
}

/// Drains one session's notifications. Exits when the session ends, the
/// client is dropped, or a newer session supersedes `generation`.
pub(crate) async fn run_relay(client: Weak<ZkClient>, generation: u64, mut events: EventReceiver) {
    while let Some(raw) = events.recv().await {
        let Some(client) = client.upgrade() else {
            break;
        };
        if !client.session.is_current(generation).await {
            debug!(generation, "relay: session superseded, stopping");
            break;
        }
        match decode_event(&raw) {
            Ok(RelayedEvent::Session(state)) => {
                client.log_event(format!("session {state:?}[{}]", state.code()));
                if state.is_fatal() {
                    info!(generation, ?state, "relay: session ended by server state");
                    client.expire(generation).await;
                    break;
                }
            }
            Ok(RelayedEvent::Change(change)) => client.apply_change(generation, change).await,
            Err(err) => {
                warn!(
                    event_type = raw.event_type,
                    state = raw.state,
                    path = %raw.path,
                    "relay: dropping malformed event: {err}"
                );
                client.log_event(format!("dropped malformed event: {err}"));
            }
        }
    }
    debug!(generation, "relay: stopped");
}

impl ZkClient {
    pub(crate) fn log_event(&self, message: String) {
        let entry = self.log.push(message);
        let _ = self.events.send(ClientEvent::Log(entry));
    }

    /// Applies one node notification: log it, consume the watches it fires,
    /// invalidate exactly that cache entry, publish it, then re-arm or lapse.
    pub(crate) async fn apply_change(&self, generation: u64, change: ChangeRecord) {
        self.log_event(change.to_string());
        let fired = {
            let mut watches = self.watches.lock().await;
            watches.fire(&change.path, change.kind)
        };
        {
            let mut cache = self.cache.lock().await;
            cache.invalidate(&change.path);
        }
        let _ = self.events.send(ClientEvent::NodeChanged(change.clone()));

        for kind in fired {
            if !self.auto_refresh() {
                self.watches.lock().await.lapse(&change.path, kind);
                continue;
            }
            if let Err(err) = self.rearm(generation, &change.path, kind).await {
                if !self.session.is_current(generation).await {
                    return;
                }
                self.watches.lock().await.lapse(&change.path, kind);
                self.log_event(format!("watch on {} lapsed: {err}", change.path));
            }
        }
    }

    async fn rearm(
        &self,
        generation: u64,
        path: &ZkPath,
        kind: WatchKind,
    ) -> Result<(), NodeError> {
        let (current, coordinator) = self.session.coordinator().await?;
        if current != generation {
            return Err(NodeError::SessionExpired);
        }
        let previous = self.begin_watch(generation, path, kind).await;
        let result = match kind {
            WatchKind::Data => coordinator.exists(path, true).await.map(|_| ()),
            WatchKind::Children => coordinator.get_children(path, true).await.map(|_| ()),
        };
        self.settle_watch(generation, path, kind, previous, result.is_ok())
            .await;
        result.map_err(|err| NodeError::from_server(path, err))
    }

    /// Registers the watch a read is about to request, before it goes out.
    pub(crate) async fn begin_watch(
        &self,
        generation: u64,
        path: &ZkPath,
        kind: WatchKind,
    ) -> Option<WatchState> {
        if self.session.is_current(generation).await {
            self.watches.lock().await.begin(path, kind)
        } else {
            None
        }
    }

    pub(crate) async fn settle_watch(
        &self,
        generation: u64,
        path: &ZkPath,
        kind: WatchKind,
        previous: Option<WatchState>,
        succeeded: bool,
    ) {
        if !self.session.is_current(generation).await {
            return;
        }
        let mut watches = self.watches.lock().await;
        if succeeded {
            watches.confirm(path, kind);
        } else {
            watches.abandon(path, kind, previous);
        }
    }
}

#[cfg(test)]
#[path = "tests/watch_tests.rs"]
mod tests;
