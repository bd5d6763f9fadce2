use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::Serialize;
use shared::{domain::ZkPath, error::NodeError};
use tracing::debug;

use crate::ZkClient;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheEntry {
    pub children: BTreeSet<String>,
    pub loaded: bool,
    pub invalidated: bool,
}

/// Lazily populated mirror of the parts of the tree that have been expanded.
/// Parent/child links are derived from path structure.
#[derive(Debug, Default)]
pub struct TreeCache {
    entries: BTreeMap<ZkPath, CacheEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SearchResult {
    /// Cached paths whose full path contains the query, in path order.
    pub matches: Vec<ZkPath>,
    /// Ancestors to expand so every match is visible, without duplicates.
    pub expand: Vec<ZkPath>,
}

/// Nested view of the cached tree for rendering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreeNode {
    pub path: ZkPath,
    pub name: String,
    pub loaded: bool,
    pub children: Vec<TreeNode>,
}

impl TreeCache {
    pub fn get(&self, path: &ZkPath) -> Option<&CacheEntry> {
        self.entries.get(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, path: &ZkPath) -> bool {
        self.entries.contains_key(path)
    }

    pub fn needs_fetch(&self, path: &ZkPath) -> bool {
        self.entries
            .get(path)
            .map_or(true, |entry| !entry.loaded || entry.invalidated)
    }

    /// Children of a loaded, valid entry.
    pub fn cached_children(&self, path: &ZkPath) -> Option<Vec<String>> {
        self.entries
            .get(path)
            .filter(|entry| entry.loaded && !entry.invalidated)
            .map(|entry| entry.children.iter().cloned().collect())
    }

    /// Overwrites the children of `path`, dropping cached subtrees of children
    /// that no longer exist.
    pub fn store_children(&mut self, path: &ZkPath, children: impl IntoIterator<Item = String>) {
        let children: BTreeSet<String> = children.into_iter().collect();
        let vanished: Vec<String> = self
            .entries
            .get(path)
            .map(|entry| entry.children.difference(&children).cloned().collect())
            .unwrap_or_default();
        for name in vanished {
            if let Ok(child) = path.child(&name) {
                self.drop_subtree(&child);
            }
        }
        self.entries.insert(
            path.clone(),
            CacheEntry {
                children,
                loaded: true,
                invalidated: false,
            },
        );
    }

    /// Marks only `path` stale; a no-op for paths never expanded.
    pub fn invalidate(&mut self, path: &ZkPath) -> bool {
        match self.entries.get_mut(path) {
            Some(entry) => {
                entry.invalidated = true;
                true
            }
            None => false,
        }
    }

    /// Drops `path`, every cached descendant, and the name from its parent's
    /// children.
    pub fn remove_subtree(&mut self, path: &ZkPath) {
        self.drop_subtree(path);
        if let Some(parent) = path.parent() {
            if let Some(entry) = self.entries.get_mut(&parent) {
                entry.children.remove(path.name());
            }
        }
    }

    fn drop_subtree(&mut self, path: &ZkPath) {
        self.entries
            .retain(|cached, _| cached != path && !cached.is_descendant_of(path));
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Every known path: expanded entries plus the children they list.
    fn known_paths(&self) -> BTreeSet<ZkPath> {
        let mut known = BTreeSet::new();
        for (path, entry) in &self.entries {
            known.insert(path.clone());
            for name in &entry.children {
                if let Ok(child) = path.child(name) {
                    known.insert(child);
                }
            }
        }
        known
    }

    pub fn search(&self, query: &str) -> SearchResult {
        if query.is_empty() {
            return SearchResult::default();
        }
        let matches: Vec<ZkPath> = self
            .known_paths()
            .into_iter()
            .filter(|path| path.as_str().contains(query))
            .collect();
        let expand: BTreeSet<ZkPath> = matches.iter().filter_map(ZkPath::parent).collect();
        SearchResult {
            matches,
            expand: expand.into_iter().collect(),
        }
    }

    pub fn snapshot(&self, root: &ZkPath) -> TreeNode {
        let entry = self.entries.get(root);
        let children = entry
            .map(|entry| {
                entry
                    .children
                    .iter()
                    .filter_map(|name| root.child(name).ok())
                    .map(|child| self.snapshot(&child))
                    .collect()
            })
            .unwrap_or_default();
        TreeNode {
            path: root.clone(),
            name: if root.is_root() {
                "/".to_string()
            } else {
                root.name().to_string()
            },
            loaded: entry.is_some_and(|entry| entry.loaded),
            children,
        }
    }
}

impl ZkClient {
    /// Children of `path`, served from the cache unless the entry is absent
    /// or invalidated.
    pub async fn expand(&self, path: &str) -> Result<Vec<String>, NodeError> {
        let path = ZkPath::parse(path)?;
        self.expand_path(&path).await
    }

    pub(crate) async fn expand_path(&self, path: &ZkPath) -> Result<Vec<String>, NodeError> {
        if let Some(children) = self.cache.lock().await.cached_children(path) {
            return Ok(children);
        }
        match self.fetch_children(path).await {
            Ok((generation, children)) => {
                if self.session.is_current(generation).await {
                    self.cache
                        .lock()
                        .await
                        .store_children(path, children.iter().cloned());
                }
                Ok(children)
            }
            Err(err) => {
                if err.is_no_node() {
                    debug!(path = %path, "cache: node vanished, dropping subtree");
                    self.cache.lock().await.remove_subtree(path);
                }
                Err(err)
            }
        }
    }

    /// Re-reads `path` even when the cached entry is valid.
    pub async fn refresh(&self, path: &str) -> Result<Vec<String>, NodeError> {
        let path = ZkPath::parse(path)?;
        self.cache.lock().await.invalidate(&path);
        self.expand_path(&path).await
    }

    /// Expands breadth-first from `root` down to `depth` levels below it.
    pub async fn load_tree(&self, root: &str, depth: usize) -> Result<TreeNode, NodeError> {
        let root = ZkPath::parse(root)?;
        let mut queue = VecDeque::from([(root.clone(), 0usize)]);
        while let Some((path, level)) = queue.pop_front() {
            let children = match self.expand_path(&path).await {
                Ok(children) => children,
                Err(err) if err.is_no_node() && path != root => continue,
                Err(err) => return Err(err),
            };
            if level + 1 > depth {
                continue;
            }
            for name in children {
                queue.push_back((path.child(&name)?, level + 1));
            }
        }
        Ok(self.snapshot(&root).await)
    }

    pub async fn search(&self, query: &str) -> SearchResult {
        self.cache.lock().await.search(query)
    }

    pub async fn snapshot(&self, root: &ZkPath) -> TreeNode {
        self.cache.lock().await.snapshot(root)
    }

    pub async fn is_cached(&self, path: &ZkPath) -> bool {
        self.cache.lock().await.contains(path)
    }

    pub async fn is_invalidated(&self, path: &ZkPath) -> bool {
        self.cache
            .lock()
            .await
            .get(path)
            .is_some_and(|entry| entry.invalidated)
    }
}

#[cfg(test)]
#[path = "tests/cache_tests.rs"]
mod tests;
