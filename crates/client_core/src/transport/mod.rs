//! Seam between the session façade and whatever actually talks to the
//! ensemble: the TCP wire client in production, the in-process ensemble in
//! tests and offline demos.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use shared::{
    domain::{AclEntry, ConnectString, CreateMode, Stat, ZkPath},
    error::{ConnectError, ServerError},
    protocol::RawWatchEvent,
};
use tokio::sync::mpsc;

pub mod memory;
pub mod wire;

pub use memory::MemoryEnsemble;
pub use wire::WireConnector;

/// Notifications pushed by the server for one session, in delivery order.
pub type EventReceiver = mpsc::UnboundedReceiver<RawWatchEvent>;

pub struct Connection {
    pub coordinator: Arc<dyn Coordinator>,
    pub events: EventReceiver,
    pub negotiated_timeout: Duration,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        target: &ConnectString,
        session_timeout: Duration,
    ) -> Result<Connection, ConnectError>;
}

/// Requests over one established session. A `version` of -1 skips the
/// optimistic-concurrency check.
#[async_trait]
pub trait Coordinator: Send + Sync {
    fn session_id(&self) -> i64;

    async fn get_children(
        &self,
        path: &ZkPath,
        watch: bool,
    ) -> Result<(Vec<String>, Stat), ServerError>;

    async fn get_data(&self, path: &ZkPath, watch: bool) -> Result<(Vec<u8>, Stat), ServerError>;

    /// Arms a data watch even when the node is absent.
    async fn exists(&self, path: &ZkPath, watch: bool) -> Result<Option<Stat>, ServerError>;

    async fn set_data(&self, path: &ZkPath, data: &[u8], version: i32)
        -> Result<Stat, ServerError>;

    async fn get_acl(&self, path: &ZkPath) -> Result<(Vec<AclEntry>, Stat), ServerError>;

    async fn set_acl(
        &self,
        path: &ZkPath,
        acl: &[AclEntry],
        version: i32,
    ) -> Result<Stat, ServerError>;

    /// Returns the path actually created (differs for sequential modes).
    async fn create(
        &self,
        path: &ZkPath,
        data: &[u8],
        acl: &[AclEntry],
        mode: CreateMode,
    ) -> Result<String, ServerError>;

    async fn delete(&self, path: &ZkPath, version: i32) -> Result<(), ServerError>;

    /// Ends the session and releases the connection. Idempotent.
    async fn close(&self) -> Result<(), ServerError>;
}
