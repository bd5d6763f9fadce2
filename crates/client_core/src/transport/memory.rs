use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use shared::{
    domain::{AclEntry, ChangeKind, ConnectString, CreateMode, KeeperState, Stat, ZkPath},
    error::{ConnectError, ErrorCode, ServerError},
    protocol::{OpCode, RawWatchEvent},
};
use tokio::sync::mpsc;
use tracing::debug;

use super::{Connection, Connector, Coordinator};

const FIRST_SESSION_ID: i64 = 0x1000_0000_0000_0001;

#[derive(Debug, Clone)]
struct MemNode {
    data: Vec<u8>,
    acl: Vec<AclEntry>,
    stat: Stat,
    children: BTreeSet<String>,
}

#[derive(Debug)]
struct EnsembleState {
    nodes: BTreeMap<String, MemNode>,
    zxid: i64,
    next_session: i64,
    sessions: HashMap<i64, mpsc::UnboundedSender<RawWatchEvent>>,
    data_watches: HashMap<String, HashSet<i64>>,
    child_watches: HashMap<String, HashSet<i64>>,
    requests: HashMap<OpCode, usize>,
    delete_faults: HashMap<String, ErrorCode>,
    connect_delay: Option<Duration>,
    refuse: bool,
    reject_auth: bool,
}

impl EnsembleState {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_string(),
            MemNode {
                data: Vec::new(),
                acl: AclEntry::open_unsafe(),
                stat: Stat::default(),
                children: BTreeSet::new(),
            },
        );
        Self {
            nodes,
            zxid: 0,
            next_session: FIRST_SESSION_ID,
            sessions: HashMap::new(),
            data_watches: HashMap::new(),
            child_watches: HashMap::new(),
            requests: HashMap::new(),
            delete_faults: HashMap::new(),
            connect_delay: None,
            refuse: false,
            reject_auth: false,
        }
    }

    fn begin(&mut self, session_id: i64, op: OpCode) -> Result<(), ServerError> {
        *self.requests.entry(op).or_default() += 1;
        if self.sessions.contains_key(&session_id) {
            Ok(())
        } else {
            Err(ServerError::ConnectionLoss)
        }
    }

    fn node(&self, path: &ZkPath) -> Result<&MemNode, ServerError> {
        self.nodes
            .get(path.as_str())
            .ok_or(ServerError::Code(ErrorCode::NoNode))
    }

    fn node_mut(&mut self, path: &ZkPath) -> Result<&mut MemNode, ServerError> {
        self.nodes
            .get_mut(path.as_str())
            .ok_or(ServerError::Code(ErrorCode::NoNode))
    }

    fn next_zxid(&mut self) -> i64 {
        self.zxid += 1;
        self.zxid
    }

    fn insert_node(
        &mut self,
        path: &ZkPath,
        data: &[u8],
        acl: &[AclEntry],
        mode: CreateMode,
        owner: i64,
    ) -> Result<ZkPath, ServerError> {
        let parent_path = path
            .parent()
            .ok_or(ServerError::Code(ErrorCode::NodeExists))?;
        let parent = self.node(&parent_path)?;
        if parent.stat.ephemeral_owner != 0 {
            return Err(ServerError::Code(ErrorCode::NoChildrenForEphemerals));
        }
        if acl.is_empty() {
            return Err(ServerError::Code(ErrorCode::InvalidAcl));
        }

        let actual = if mode.is_sequential() {
            let raw = format!("{path}{:010}", parent.stat.cversion);
            ZkPath::parse(raw).map_err(|_| ServerError::Code(ErrorCode::BadArguments))?
        } else {
            path.clone()
        };
        if self.nodes.contains_key(actual.as_str()) {
            return Err(ServerError::Code(ErrorCode::NodeExists));
        }

        let zxid = self.next_zxid();
        let now = Utc::now().timestamp_millis();
        let stat = Stat {
            czxid: zxid,
            mzxid: zxid,
            ctime: now,
            mtime: now,
            ephemeral_owner: if mode.is_ephemeral() { owner } else { 0 },
            data_length: data.len() as i32,
            pzxid: zxid,
            ..Stat::default()
        };
        self.nodes.insert(
            actual.to_string(),
            MemNode {
                data: data.to_vec(),
                acl: acl.to_vec(),
                stat,
                children: BTreeSet::new(),
            },
        );

        let parent = self.node_mut(&parent_path)?;
        parent.children.insert(actual.name().to_string());
        parent.stat.cversion += 1;
        parent.stat.num_children = parent.children.len() as i32;
        parent.stat.pzxid = zxid;

        self.fire(&actual, ChangeKind::Created);
        self.fire(&parent_path, ChangeKind::ChildrenChanged);
        Ok(actual)
    }

    fn remove_node(&mut self, path: &ZkPath, version: i32) -> Result<(), ServerError> {
        let Some(parent_path) = path.parent() else {
            return Err(ServerError::Code(ErrorCode::BadArguments));
        };
        if let Some(code) = self.delete_faults.get(path.as_str()) {
            return Err(ServerError::Code(*code));
        }
        let node = self.node(path)?;
        if !node.children.is_empty() {
            return Err(ServerError::Code(ErrorCode::NotEmpty));
        }
        if version != -1 && node.stat.version != version {
            return Err(ServerError::Code(ErrorCode::BadVersion));
        }
        self.nodes.remove(path.as_str());

        let zxid = self.next_zxid();
        let parent = self.node_mut(&parent_path)?;
        parent.children.remove(path.name());
        parent.stat.cversion += 1;
        parent.stat.num_children = parent.children.len() as i32;
        parent.stat.pzxid = zxid;

        self.fire(path, ChangeKind::Deleted);
        self.fire(&parent_path, ChangeKind::ChildrenChanged);
        Ok(())
    }

    /// Consumes the one-shot watches `kind` triggers on `path`.
    fn fire(&mut self, path: &ZkPath, kind: ChangeKind) {
        let mut watchers = HashSet::new();
        if matches!(
            kind,
            ChangeKind::Created | ChangeKind::Deleted | ChangeKind::DataChanged
        ) {
            watchers.extend(self.data_watches.remove(path.as_str()).unwrap_or_default());
        }
        if matches!(kind, ChangeKind::ChildrenChanged | ChangeKind::Deleted) {
            watchers.extend(self.child_watches.remove(path.as_str()).unwrap_or_default());
        }
        for session_id in watchers {
            if let Some(events) = self.sessions.get(&session_id) {
                let _ = events.send(RawWatchEvent {
                    event_type: kind.code(),
                    state: KeeperState::SyncConnected.code(),
                    path: path.to_string(),
                });
            }
        }
    }

    fn end_session(&mut self, session_id: i64) {
        self.sessions.remove(&session_id);
        for watchers in self
            .data_watches
            .values_mut()
            .chain(self.child_watches.values_mut())
        {
            watchers.remove(&session_id);
        }
        let owned: Vec<ZkPath> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.stat.ephemeral_owner == session_id)
            .filter_map(|(path, _)| ZkPath::parse(path.as_str()).ok())
            .collect();
        for path in owned {
            let _ = self.remove_node(&path, -1);
        }
    }
}

/// In-process ensemble speaking the same request semantics as a real server:
/// one-shot watches, versions, ephemeral owners and sequential names. Clones
/// share state, so a test can keep one handle for inspection and fault
/// injection while the client owns another.
#[derive(Debug, Clone)]
pub struct MemoryEnsemble {
    state: Arc<Mutex<EnsembleState>>,
}

impl Default for MemoryEnsemble {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEnsemble {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(EnsembleState::new())),
        }
    }

    fn state(&self) -> MutexGuard<'_, EnsembleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates `path` and any missing ancestors as persistent nodes without
    /// counting requests or firing watches.
    pub fn seed(&self, path: &str, data: &[u8]) -> Result<(), ServerError> {
        let path = ZkPath::parse(path).map_err(|_| ServerError::Code(ErrorCode::BadArguments))?;
        let mut state = self.state();
        let mut chain = Vec::new();
        let mut cursor = Some(path.clone());
        while let Some(current) = cursor {
            if current.is_root() || state.nodes.contains_key(current.as_str()) {
                break;
            }
            cursor = current.parent();
            chain.push(current);
        }
        let watches = (
            std::mem::take(&mut state.data_watches),
            std::mem::take(&mut state.child_watches),
        );
        let mut result = Ok(());
        for node in chain.into_iter().rev() {
            let payload: &[u8] = if node == path { data } else { &[] };
            if let Err(err) =
                state.insert_node(&node, payload, &AclEntry::open_unsafe(), CreateMode::Persistent, 0)
            {
                result = Err(err);
                break;
            }
        }
        state.data_watches = watches.0;
        state.child_watches = watches.1;
        result
    }

    pub fn contains(&self, path: &str) -> bool {
        self.state().nodes.contains_key(path)
    }

    pub fn data(&self, path: &str) -> Option<Vec<u8>> {
        self.state().nodes.get(path).map(|node| node.data.clone())
    }

    pub fn request_count(&self, op: OpCode) -> usize {
        self.state().requests.get(&op).copied().unwrap_or(0)
    }

    pub fn total_requests(&self) -> usize {
        self.state().requests.values().sum()
    }

    pub fn has_data_watch(&self, path: &str) -> bool {
        self.state()
            .data_watches
            .get(path)
            .is_some_and(|watchers| !watchers.is_empty())
    }

    pub fn has_child_watch(&self, path: &str) -> bool {
        self.state()
            .child_watches
            .get(path)
            .is_some_and(|watchers| !watchers.is_empty())
    }

    /// Makes every delete of `path` fail with `code`.
    pub fn fail_delete(&self, path: &str, code: ErrorCode) {
        self.state().delete_faults.insert(path.to_string(), code);
    }

    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        self.state().connect_delay = delay;
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.state().refuse = refuse;
    }

    /// New sessions are answered with an AuthFailed state instead of
    /// SyncConnected and never become usable.
    pub fn reject_auth(&self, reject: bool) {
        self.state().reject_auth = reject;
    }

    pub fn session_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.state().sessions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Server-side expiry: notifies the session, then drops its watches and
    /// ephemeral nodes.
    pub fn expire_session(&self, session_id: i64) {
        let mut state = self.state();
        if let Some(events) = state.sessions.get(&session_id) {
            let _ = events.send(RawWatchEvent::session_state(KeeperState::Expired.code()));
        }
        state.end_session(session_id);
    }

    /// Transport loss for every connected session. Ephemeral nodes survive.
    pub fn drop_connections(&self) {
        let mut state = self.state();
        for (_, events) in state.sessions.drain() {
            let _ = events.send(RawWatchEvent::session_state(
                KeeperState::Disconnected.code(),
            ));
        }
    }

    /// Delivers an arbitrary notification, bypassing watch bookkeeping.
    pub fn inject_event(&self, session_id: i64, event: RawWatchEvent) -> bool {
        self.state()
            .sessions
            .get(&session_id)
            .is_some_and(|events| events.send(event).is_ok())
    }
}

#[async_trait]
impl Connector for MemoryEnsemble {
    async fn connect(
        &self,
        target: &ConnectString,
        session_timeout: Duration,
    ) -> Result<Connection, ConnectError> {
        let (refuse, delay) = {
            let state = self.state();
            (state.refuse, state.connect_delay)
        };
        if refuse {
            return Err(ConnectError::Unreachable {
                hosts: target.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session_id = {
            let mut state = self.state();
            let session_id = state.next_session;
            state.next_session += 1;
            if state.reject_auth {
                let _ = events_tx.send(RawWatchEvent::session_state(
                    KeeperState::AuthFailed.code(),
                ));
            } else {
                let _ = events_tx.send(RawWatchEvent::session_state(
                    KeeperState::SyncConnected.code(),
                ));
                state.sessions.insert(session_id, events_tx);
            }
            session_id
        };
        debug!(
            session_id = %format!("{session_id:#x}"),
            "memory: session established"
        );

        Ok(Connection {
            coordinator: Arc::new(MemorySession {
                ensemble: self.clone(),
                session_id,
                closed: AtomicBool::new(false),
            }),
            events: events_rx,
            negotiated_timeout: session_timeout,
        })
    }
}

struct MemorySession {
    ensemble: MemoryEnsemble,
    session_id: i64,
    closed: AtomicBool,
}

impl MemorySession {
    fn begin(&self, op: OpCode) -> Result<MutexGuard<'_, EnsembleState>, ServerError> {
        let mut state = self.ensemble.state();
        state.begin(self.session_id, op)?;
        Ok(state)
    }
}

#[async_trait]
impl Coordinator for MemorySession {
    fn session_id(&self) -> i64 {
        self.session_id
    }

    async fn get_children(
        &self,
        path: &ZkPath,
        watch: bool,
    ) -> Result<(Vec<String>, Stat), ServerError> {
        let mut state = self.begin(OpCode::GetChildren2)?;
        let node = state.node(path)?;
        let children = node.children.iter().cloned().collect();
        let stat = node.stat;
        if watch {
            state
                .child_watches
                .entry(path.to_string())
                .or_default()
                .insert(self.session_id);
        }
        Ok((children, stat))
    }

    async fn get_data(&self, path: &ZkPath, watch: bool) -> Result<(Vec<u8>, Stat), ServerError> {
        let mut state = self.begin(OpCode::GetData)?;
        let node = state.node(path)?;
        let reply = (node.data.clone(), node.stat);
        if watch {
            state
                .data_watches
                .entry(path.to_string())
                .or_default()
                .insert(self.session_id);
        }
        Ok(reply)
    }

    async fn exists(&self, path: &ZkPath, watch: bool) -> Result<Option<Stat>, ServerError> {
        let mut state = self.begin(OpCode::Exists)?;
        let stat = state.nodes.get(path.as_str()).map(|node| node.stat);
        if watch {
            state
                .data_watches
                .entry(path.to_string())
                .or_default()
                .insert(self.session_id);
        }
        Ok(stat)
    }

    async fn set_data(
        &self,
        path: &ZkPath,
        data: &[u8],
        version: i32,
    ) -> Result<Stat, ServerError> {
        let mut state = self.begin(OpCode::SetData)?;
        let current = state.node(path)?.stat.version;
        if version != -1 && current != version {
            return Err(ServerError::Code(ErrorCode::BadVersion));
        }
        let zxid = state.next_zxid();
        let node = state.node_mut(path)?;
        node.data = data.to_vec();
        node.stat.version += 1;
        node.stat.mzxid = zxid;
        node.stat.mtime = Utc::now().timestamp_millis();
        node.stat.data_length = data.len() as i32;
        let stat = node.stat;
        state.fire(path, ChangeKind::DataChanged);
        Ok(stat)
    }

    async fn get_acl(&self, path: &ZkPath) -> Result<(Vec<AclEntry>, Stat), ServerError> {
        let state = self.begin(OpCode::GetAcl)?;
        let node = state.node(path)?;
        Ok((node.acl.clone(), node.stat))
    }

    async fn set_acl(
        &self,
        path: &ZkPath,
        acl: &[AclEntry],
        version: i32,
    ) -> Result<Stat, ServerError> {
        let mut state = self.begin(OpCode::SetAcl)?;
        if acl.is_empty() {
            return Err(ServerError::Code(ErrorCode::InvalidAcl));
        }
        let node = state.node_mut(path)?;
        if version != -1 && node.stat.aversion != version {
            return Err(ServerError::Code(ErrorCode::BadVersion));
        }
        node.acl = acl.to_vec();
        node.stat.aversion += 1;
        Ok(node.stat)
    }

    async fn create(
        &self,
        path: &ZkPath,
        data: &[u8],
        acl: &[AclEntry],
        mode: CreateMode,
    ) -> Result<String, ServerError> {
        let mut state = self.begin(OpCode::Create)?;
        let created = state.insert_node(path, data, acl, mode, self.session_id)?;
        Ok(created.to_string())
    }

    async fn delete(&self, path: &ZkPath, version: i32) -> Result<(), ServerError> {
        let mut state = self.begin(OpCode::Delete)?;
        state.remove_node(path, version)
    }

    async fn close(&self) -> Result<(), ServerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut state = self.ensemble.state();
        *state.requests.entry(OpCode::CloseSession).or_default() += 1;
        state.end_session(self.session_id);
        Ok(())
    }
}

#[cfg(test)]
#[path = "../tests/memory_tests.rs"]
mod tests;
