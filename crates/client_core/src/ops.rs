use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use shared::{
    domain::{AclEntry, CreateMode, Stat, ZkPath},
    error::{ErrorCode, NodeError, ServerError},
};
use tracing::{debug, info, warn};

use crate::{
    watch::{WatchKind, WatchState},
    ZkClient,
};

const ANY_VERSION: i32 = -1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOptions {
    pub mode: CreateMode,
    pub acl: Vec<AclEntry>,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            mode: CreateMode::Persistent,
            acl: AclEntry::open_unsafe(),
        }
    }
}

impl ZkClient {
    pub(crate) async fn fetch_children(
        &self,
        path: &ZkPath,
    ) -> Result<(u64, Vec<String>), NodeError> {
        let (generation, coordinator) = self.session.coordinator().await?;
        let watch = self.auto_refresh();
        let previous = self
            .watch_before_read(watch, generation, path, WatchKind::Children)
            .await;
        let reply = coordinator.get_children(path, watch).await;
        if watch {
            self.settle_watch(generation, path, WatchKind::Children, previous, reply.is_ok())
                .await;
        }
        let (mut children, _) = reply.map_err(|err| NodeError::from_server(path, err))?;
        children.sort();
        Ok((generation, children))
    }

    async fn watch_before_read(
        &self,
        watch: bool,
        generation: u64,
        path: &ZkPath,
        kind: WatchKind,
    ) -> Option<WatchState> {
        if watch {
            self.begin_watch(generation, path, kind).await
        } else {
            None
        }
    }

    /// Sorted child names, read straight from the server.
    pub async fn get_children(&self, path: &str) -> Result<Vec<String>, NodeError> {
        let path = ZkPath::parse(path)?;
        let (_, children) = self.fetch_children(&path).await?;
        Ok(children)
    }

    pub async fn get_data(&self, path: &str) -> Result<(Vec<u8>, Stat), NodeError> {
        let path = ZkPath::parse(path)?;
        let (generation, coordinator) = self.session.coordinator().await?;
        let watch = self.auto_refresh();
        let previous = self
            .watch_before_read(watch, generation, &path, WatchKind::Data)
            .await;
        let reply = coordinator.get_data(&path, watch).await;
        if watch {
            self.settle_watch(generation, &path, WatchKind::Data, previous, reply.is_ok())
                .await;
        }
        reply.map_err(|err| NodeError::from_server(&path, err))
    }

    /// `None` when the node is absent. With auto-refresh on, a data watch is
    /// armed either way so creation is noticed.
    pub async fn exists(&self, path: &str) -> Result<Option<Stat>, NodeError> {
        let path = ZkPath::parse(path)?;
        let (generation, coordinator) = self.session.coordinator().await?;
        let watch = self.auto_refresh();
        let previous = self
            .watch_before_read(watch, generation, &path, WatchKind::Data)
            .await;
        let reply = coordinator.exists(&path, watch).await;
        if watch {
            self.settle_watch(generation, &path, WatchKind::Data, previous, reply.is_ok())
                .await;
        }
        reply.map_err(|err| NodeError::from_server(&path, err))
    }

    /// Unconditional overwrite.
    pub async fn set_data(&self, path: &str, data: &[u8]) -> Result<Stat, NodeError> {
        let path = ZkPath::parse(path)?;
        let (_, coordinator) = self.session.coordinator().await?;
        let stat = coordinator
            .set_data(&path, data, ANY_VERSION)
            .await
            .map_err(|err| NodeError::from_server(&path, err))?;
        debug!(path = %path, version = stat.version, "ops: data set");
        Ok(stat)
    }

    pub async fn get_acl(&self, path: &str) -> Result<Vec<AclEntry>, NodeError> {
        let path = ZkPath::parse(path)?;
        let (_, coordinator) = self.session.coordinator().await?;
        let (acl, _) = coordinator
            .get_acl(&path)
            .await
            .map_err(|err| NodeError::from_server(&path, err))?;
        Ok(acl)
    }

    pub async fn set_acl(&self, path: &str, acl: &[AclEntry]) -> Result<Stat, NodeError> {
        let path = ZkPath::parse(path)?;
        let (_, coordinator) = self.session.coordinator().await?;
        if acl.is_empty() {
            return Err(NodeError::InvalidAcl { path });
        }
        coordinator
            .set_acl(&path, acl, ANY_VERSION)
            .await
            .map_err(|err| NodeError::from_server(&path, err))
    }

    /// Persistent node with the open ACL. Parents are never created.
    pub async fn create(&self, path: &str, data: &[u8]) -> Result<(), NodeError> {
        self.create_with(path, data, CreateOptions::default())
            .await
            .map(|_| ())
    }

    /// Creates `name` under `parent`.
    pub async fn create_child(
        &self,
        parent: &str,
        name: &str,
        data: &[u8],
    ) -> Result<ZkPath, NodeError> {
        let parent = ZkPath::parse(parent)?;
        let path = parent.child(name)?;
        self.create_with(path.as_str(), data, CreateOptions::default())
            .await
    }

    /// Returns the path actually created, which differs from `path` for
    /// sequential modes.
    pub async fn create_with(
        &self,
        path: &str,
        data: &[u8],
        options: CreateOptions,
    ) -> Result<ZkPath, NodeError> {
        let path = ZkPath::parse(path)?;
        let (generation, coordinator) = self.session.coordinator().await?;
        let Some(parent) = path.parent() else {
            return Err(NodeError::NodeExists { path });
        };
        if options.acl.is_empty() {
            return Err(NodeError::InvalidAcl { path });
        }
        let created = coordinator
            .create(&path, data, &options.acl, options.mode)
            .await
            .map_err(|err| match err {
                ServerError::Code(ErrorCode::NoNode) => NodeError::NoSuchNode {
                    path: parent.clone(),
                },
                other => NodeError::from_server(&path, other),
            })?;
        let created = ZkPath::parse(created)?;

        if self.session.is_current(generation).await {
            self.cache.lock().await.invalidate(&parent);
        }
        info!(path = %created, mode = ?options.mode, "ops: node created");
        Ok(created)
    }

    /// Deletes `path` and everything below it, leaves first. There is no
    /// rollback: a failure after some deletions is reported as
    /// `PartialDeleteFailure`.
    pub async fn remove_recursive(&self, path: &str) -> Result<(), NodeError> {
        let path = ZkPath::parse(path)?;
        let (generation, coordinator) = self.session.coordinator().await?;
        if path.is_root() {
            return Err(NodeError::invalid_path(
                path.as_str(),
                "the root node cannot be removed",
            ));
        }

        let mut order = vec![path.clone()];
        let mut queue = VecDeque::from([path.clone()]);
        while let Some(current) = queue.pop_front() {
            let children = match coordinator.get_children(&current, false).await {
                Ok((children, _)) => children,
                Err(ServerError::Code(ErrorCode::NoNode)) if current != path => continue,
                Err(err) => return Err(NodeError::from_server(&current, err)),
            };
            for name in children {
                let child = current.child(&name)?;
                order.push(child.clone());
                queue.push_back(child);
            }
        }

        let mut last_deleted: Option<ZkPath> = None;
        let mut gone = Vec::new();
        for target in order.iter().rev() {
            match coordinator.delete(target, ANY_VERSION).await {
                Ok(()) => {
                    last_deleted = Some(target.clone());
                    gone.push(target);
                }
                Err(ServerError::Code(ErrorCode::NoNode)) if *target != path => {
                    debug!(path = %target, "ops: descendant already gone");
                    gone.push(target);
                }
                Err(err) => {
                    let source = NodeError::from_server(target, err);
                    warn!(path = %path, failed = %target, "ops: recursive delete stopped: {source}");
                    if self.session.is_current(generation).await {
                        let mut cache = self.cache.lock().await;
                        for removed in &gone {
                            cache.remove_subtree(removed);
                        }
                    }
                    return Err(match last_deleted {
                        None => source,
                        Some(last) => NodeError::PartialDeleteFailure {
                            path: path.clone(),
                            last_deleted: Some(last),
                            failed: target.clone(),
                            source: Box::new(source),
                        },
                    });
                }
            }
        }

        if self.session.is_current(generation).await {
            self.cache.lock().await.remove_subtree(&path);
        }
        info!(path = %path, removed = order.len(), "ops: subtree removed");
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/ops_tests.rs"]
mod tests;
