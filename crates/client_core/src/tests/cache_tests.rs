use std::{sync::Arc, time::Duration};

use shared::protocol::{OpCode, RawWatchEvent};
use tokio::time::timeout;

use super::*;
use crate::{transport::MemoryEnsemble, ClientEvent, ClientSettings};

fn path(raw: &str) -> ZkPath {
    ZkPath::parse(raw).expect("valid path")
}

fn names(raw: &[&str]) -> Vec<String> {
    raw.iter().map(|name| name.to_string()).collect()
}

async fn connected(ensemble: &MemoryEnsemble) -> Arc<ZkClient> {
    let client = ZkClient::with_connector(ClientSettings::default(), Arc::new(ensemble.clone()));
    client.connect("127.0.0.1:2181").await.expect("connect");
    client
}

#[test]
fn store_children_prunes_descendants_of_vanished_children() {
    let mut cache = TreeCache::default();
    cache.store_children(&ZkPath::root(), names(&["a", "b"]));
    cache.store_children(&path("/a"), names(&["x"]));
    cache.store_children(&path("/a/x"), names(&["deep"]));
    cache.store_children(&path("/b"), Vec::new());

    cache.store_children(&ZkPath::root(), names(&["b", "c"]));

    assert!(!cache.contains(&path("/a")));
    assert!(!cache.contains(&path("/a/x")));
    assert!(cache.contains(&path("/b")));
    assert_eq!(
        cache.cached_children(&ZkPath::root()),
        Some(names(&["b", "c"]))
    );
}

#[test]
fn invalidate_touches_only_the_named_entry() {
    let mut cache = TreeCache::default();
    cache.store_children(&ZkPath::root(), names(&["a"]));
    cache.store_children(&path("/a"), names(&["b"]));
    cache.store_children(&path("/a/b"), names(&["c"]));

    assert!(cache.invalidate(&path("/a/b")));
    assert!(!cache.invalidate(&path("/never/expanded")));

    assert!(cache.needs_fetch(&path("/a/b")));
    assert!(!cache.needs_fetch(&path("/a")));
    assert!(!cache.needs_fetch(&ZkPath::root()));
    assert_eq!(cache.cached_children(&path("/a/b")), None);
}

#[test]
fn remove_subtree_also_unlinks_the_name_from_its_parent() {
    let mut cache = TreeCache::default();
    cache.store_children(&ZkPath::root(), names(&["app", "application"]));
    cache.store_children(&path("/app"), names(&["db"]));
    cache.store_children(&path("/app/db"), Vec::new());
    cache.store_children(&path("/application"), Vec::new());

    cache.remove_subtree(&path("/app"));

    assert!(!cache.contains(&path("/app")));
    assert!(!cache.contains(&path("/app/db")));
    assert!(cache.contains(&path("/application")));
    assert_eq!(
        cache.cached_children(&ZkPath::root()),
        Some(names(&["application"]))
    );
}

#[test]
fn search_matches_names_and_lists_parents_once() {
    let mut cache = TreeCache::default();
    cache.store_children(&ZkPath::root(), names(&["app", "db-main"]));
    cache.store_children(&path("/app"), names(&["db-primary", "db-replica", "web"]));

    let result = cache.search("db");

    assert_eq!(
        result.matches,
        vec![
            path("/app/db-primary"),
            path("/app/db-replica"),
            path("/db-main")
        ]
    );
    assert_eq!(result.expand, vec![ZkPath::root(), path("/app")]);
    assert_eq!(cache.search(""), SearchResult::default());
}

#[test]
fn search_matches_across_path_segments() {
    let mut cache = TreeCache::default();
    cache.store_children(&ZkPath::root(), names(&["app", "db"]));
    cache.store_children(&path("/app"), names(&["config", "web"]));
    cache.store_children(&path("/app/config"), names(&["db", "cache"]));

    let result = cache.search("config/db");

    assert_eq!(result.matches, vec![path("/app/config/db")]);
    assert_eq!(result.expand, vec![path("/app/config")]);
    assert_eq!(
        cache.search("app/web").matches,
        vec![path("/app/web")]
    );
}

#[test]
fn snapshot_nests_children_and_flags_unloaded_nodes() {
    let mut cache = TreeCache::default();
    cache.store_children(&ZkPath::root(), names(&["app", "locks"]));
    cache.store_children(&path("/app"), names(&["db"]));

    let tree = cache.snapshot(&ZkPath::root());

    assert_eq!(tree.name, "/");
    assert!(tree.loaded);
    let app = &tree.children[0];
    assert_eq!(app.name, "app");
    assert!(app.loaded);
    assert_eq!(app.children[0].path, path("/app/db"));
    assert!(!app.children[0].loaded);
    assert!(!tree.children[1].loaded);
}

#[tokio::test]
async fn expanding_twice_fetches_once() {
    let ensemble = MemoryEnsemble::new();
    ensemble.seed("/app/db", b"").expect("seed");
    let client = connected(&ensemble).await;

    let first = client.expand("/app").await.expect("first");
    let second = client.expand("/app").await.expect("second");

    assert_eq!(first, second);
    assert_eq!(ensemble.request_count(OpCode::GetChildren2), 1);
}

#[tokio::test]
async fn refresh_refetches_a_valid_entry() {
    let ensemble = MemoryEnsemble::new();
    ensemble.seed("/app/db", b"").expect("seed");
    let client = connected(&ensemble).await;

    client.expand("/app").await.expect("expand");
    ensemble.seed("/app/web", b"").expect("seed");
    assert_eq!(client.expand("/app").await.expect("cached"), vec!["db"]);

    assert_eq!(
        client.refresh("/app").await.expect("refresh"),
        vec!["db", "web"]
    );
    assert_eq!(ensemble.request_count(OpCode::GetChildren2), 2);
}

#[tokio::test]
async fn change_event_invalidates_only_its_own_path() {
    let ensemble = MemoryEnsemble::new();
    ensemble.seed("/a/b/c", b"").expect("seed");
    let client = connected(&ensemble).await;
    let handle = client.session_handle().await.expect("handle");
    let mut events = client.subscribe_events();

    for node in ["/", "/a", "/a/b"] {
        client.expand(node).await.expect("expand");
    }

    assert!(ensemble.inject_event(
        handle.session_id(),
        RawWatchEvent {
            event_type: 4,
            state: 3,
            path: "/a/b".into(),
        },
    ));
    timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(ClientEvent::NodeChanged(change)) = events.recv().await {
                assert_eq!(change.path, path("/a/b"));
                break;
            }
        }
    })
    .await
    .expect("change relayed");

    assert!(client.is_invalidated(&path("/a/b")).await);
    assert!(!client.is_invalidated(&path("/a")).await);
    assert!(!client.is_invalidated(&ZkPath::root()).await);
    assert!(client.is_cached(&path("/a/b")).await);
}

#[tokio::test]
async fn expanding_a_vanished_node_drops_it_from_the_cache() {
    let ensemble = MemoryEnsemble::new();
    ensemble.seed("/gone/child", b"").expect("seed");
    let client = connected(&ensemble).await;
    let other = connected(&ensemble).await;

    client.expand("/").await.expect("root");
    client.expand("/gone").await.expect("gone");
    client.expand("/gone/child").await.expect("child");
    other.remove_recursive("/gone").await.expect("remove elsewhere");

    assert!(client.refresh("/gone").await.expect_err("vanished").is_no_node());
    assert!(!client.is_cached(&path("/gone")).await);
    assert!(!client.is_cached(&path("/gone/child")).await);
    assert_eq!(
        client.snapshot(&ZkPath::root()).await.children,
        Vec::<TreeNode>::new()
    );
}

#[tokio::test]
async fn load_tree_stops_at_the_requested_depth() {
    let ensemble = MemoryEnsemble::new();
    ensemble.seed("/a/b/c/d", b"").expect("seed");
    let client = connected(&ensemble).await;

    let tree = client.load_tree("/", 1).await.expect("load");

    assert!(tree.loaded);
    let a = &tree.children[0];
    assert!(a.loaded);
    assert_eq!(a.children[0].path, path("/a/b"));
    assert!(!a.children[0].loaded);
    assert!(!client.is_cached(&path("/a/b")).await);
}

#[tokio::test]
async fn search_on_the_client_covers_loaded_nodes_only() {
    let ensemble = MemoryEnsemble::new();
    ensemble.seed("/app/config/db", b"").expect("seed");
    let client = connected(&ensemble).await;

    client.load_tree("/", 1).await.expect("load");
    assert!(client.search("db").await.matches.is_empty());

    client.load_tree("/", 3).await.expect("load deeper");
    assert_eq!(
        client.search("db").await.matches,
        vec![path("/app/config/db")]
    );
}
