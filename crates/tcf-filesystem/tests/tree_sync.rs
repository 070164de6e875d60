use std::{
    sync::{Arc, mpsc},
    time::Duration,
};

use parking_lot::Mutex;
use tcf_core::{
    ChannelError, CoreConfig, Dispatcher, Peer,
    services::filesystem::{FileAttrs, FileSystemError, StatusCode},
};
use tcf_filesystem::{NodeId, QueryState, TreeError, TreeSynchronizer};
use tcf_test_utils::{MemFileSystem, SimChannelManager, dispatcher};

struct Fixture {
    dispatcher: Dispatcher,
    fs: Arc<MemFileSystem>,
    manager: Arc<SimChannelManager>,
    sync: TreeSynchronizer,
}

fn fixture() -> Fixture {
    let dispatcher = dispatcher();
    let fs = Arc::new(MemFileSystem::new(dispatcher.clone()));
    let manager =
        Arc::new(SimChannelManager::new(dispatcher.clone()).with_file_system(Arc::clone(&fs)));
    let sync = TreeSynchronizer::new(
        dispatcher.clone(),
        manager.clone(),
        Peer::new("TCP:10.0.0.2:1534", "board"),
        &CoreConfig::default(),
    );
    Fixture {
        dispatcher,
        fs,
        manager,
        sync,
    }
}

impl Fixture {
    fn names(&self, node: NodeId) -> Vec<String> {
        self.sync
            .tree()
            .read()
            .children(node)
            .map(|n| n.name().to_string())
            .collect()
    }

    fn state(&self, node: NodeId) -> QueryState {
        self.sync.tree().read().get(node).unwrap().query_state()
    }

    async fn root_dir(&self) -> NodeId {
        self.sync.find_node("/").await.unwrap()
    }

    fn settle(&self) {
        self.dispatcher.invoke_and_wait(|| ()).unwrap();
    }
}

#[tokio::test]
async fn test_paged_listing_round_trip() {
    let f = fixture();
    for i in 0..10 {
        f.fs.add_file(&format!("/data/f{i:02}"), b"x", 0);
    }
    f.fs.set_page_size(3);

    let data = f.sync.find_node("/data").await.unwrap();
    assert_eq!(f.state(data), QueryState::Unqueried);

    f.sync.query(data).await.unwrap();

    assert_eq!(f.state(data), QueryState::Queried);
    assert_eq!(f.names(data).len(), 10);
    assert_eq!(f.fs.call_count("readdir"), 1 + 4);
    assert_eq!(f.fs.open_handles(), 0);
    assert_eq!(f.manager.open_channels(), 0);
    assert_eq!(f.manager.open_count(), f.manager.close_count());
}

#[tokio::test]
async fn test_concurrent_requests_share_one_query() {
    let f = fixture();
    f.fs.add_file("/a", b"", 0);
    let root_dir = f.root_dir().await;
    let opens_before = f.manager.open_count();

    f.manager.hold_opens();
    let results = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..2 {
        let results = Arc::clone(&results);
        f.sync.query_children(
            root_dir,
            Box::new(move |r: Result<(), TreeError>| results.lock().push(r)),
        );
    }
    f.settle();

    assert_eq!(f.manager.open_count(), opens_before + 1);
    assert_eq!(f.state(root_dir), QueryState::Querying);

    f.manager.release_opens();
    let third = f.sync.query(root_dir);
    // the third request arrives after the first has settled or joins it
    third.await.unwrap();

    assert_eq!(*results.lock(), vec![Ok(()), Ok(())]);
    assert_eq!(f.names(root_dir), ["a"]);
    assert_eq!(f.manager.open_channels(), 0);
}

#[tokio::test]
async fn test_channel_failure_allows_retry() {
    let f = fixture();
    f.fs.add_file("/a", b"", 0);
    let root_dir = f.root_dir().await;

    f.manager
        .fail_opens(Some(ChannelError::NotResponding("board".into())));
    let err = f.sync.query(root_dir).await.unwrap_err();
    assert_eq!(
        err,
        TreeError::Channel(ChannelError::NotResponding("board".into()))
    );
    assert_eq!(f.state(root_dir), QueryState::Unqueried);

    f.manager.fail_opens(None);
    f.sync.query(root_dir).await.unwrap();
    assert_eq!(f.state(root_dir), QueryState::Queried);
    assert_eq!(f.names(root_dir), ["a"]);
}

#[tokio::test]
async fn test_opendir_failure_marks_queried_and_closes_channel() {
    let f = fixture();
    f.fs.add_dir("/locked");
    let locked = f.sync.find_node("/locked").await.unwrap();

    f.fs.fail_path(
        "opendir",
        "/locked",
        FileSystemError::remote(StatusCode::PermissionDenied, "denied"),
    );
    let err = f.sync.query(locked).await.unwrap_err();
    assert!(matches!(err, TreeError::FileSystem { ref path, .. } if path == "/locked"));
    assert_eq!(f.state(locked), QueryState::Queried);
    assert!(f.names(locked).is_empty());
    assert_eq!(f.manager.open_channels(), 0);
}

#[tokio::test]
async fn test_readdir_failure_keeps_partial_children() {
    let f = fixture();
    for name in ["a", "b", "c", "d"] {
        f.fs.add_file(&format!("/d/{name}"), b"", 0);
    }
    f.fs.set_page_size(2);
    let d = f.sync.find_node("/d").await.unwrap();

    f.fs.fail_nth(
        "readdir",
        2,
        FileSystemError::remote(StatusCode::ConnectionLost, "lost"),
    );
    let err = f.sync.query(d).await.unwrap_err();
    assert!(matches!(err, TreeError::FileSystem { .. }));
    assert_eq!(f.names(d), ["a", "b"]);
    assert_eq!(f.state(d), QueryState::Queried);
    assert_eq!(f.fs.open_handles(), 0);
    assert_eq!(f.manager.open_channels(), 0);
}

#[tokio::test]
async fn test_refresh_reconciles_children() {
    let f = fixture();
    f.fs.add_file("/w/keep", b"1", 0);
    f.fs.add_file("/w/gone", b"2", 0);
    let w = f.sync.find_node("/w").await.unwrap();
    f.sync.query(w).await.unwrap();
    let keep = f.sync.tree().read().child_by_name(w, "keep").unwrap();

    f.fs.delete("/w/gone");
    f.fs.add_file("/w/new", b"3", 0);
    f.sync.query(w).await.unwrap();

    assert_eq!(f.names(w), ["keep", "new"]);
    assert_eq!(f.sync.tree().read().child_by_name(w, "keep"), Some(keep));
}

#[tokio::test]
async fn test_empty_pages() {
    let f = fixture();
    f.fs.add_file("/p/one", b"", 0);
    f.fs.add_dir("/empty");
    let p = f.sync.find_node("/p").await.unwrap();
    f.sync.query(p).await.unwrap();

    // a transient empty page before the data does not clear anything
    f.fs.set_leading_empty_page(true);
    f.sync.query(p).await.unwrap();
    assert_eq!(f.names(p), ["one"]);

    // a genuinely empty directory ends with no children
    let empty = f.sync.find_node("/empty").await.unwrap();
    f.sync.query(empty).await.unwrap();
    assert_eq!(f.state(empty), QueryState::Queried);
    assert!(f.names(empty).is_empty());

    f.fs.delete("/p/one");
    f.sync.query(p).await.unwrap();
    assert!(f.names(p).is_empty());
}

#[tokio::test]
async fn test_query_file_is_rejected() {
    let f = fixture();
    f.fs.add_file("/f.txt", b"", 0);
    let file = f.sync.find_node("/f.txt").await.unwrap();
    assert_eq!(
        f.sync.query(file).await,
        Err(TreeError::NotADirectory("/f.txt".into()))
    );
}

#[tokio::test]
async fn test_find_node_uses_cache_until_removed() {
    let f = fixture();
    f.fs.add_file("/etc/hosts", b"", 0);

    let hosts = f.sync.find_node("/etc/hosts").await.unwrap();
    let path = f.sync.tree().read().path(hosts);
    assert_eq!(path.as_deref(), Some("/etc/hosts"));

    let opens = f.manager.open_count();
    assert_eq!(f.sync.find_node("/etc/hosts").await.unwrap(), hosts);
    assert_eq!(f.manager.open_count(), opens);

    f.fs.delete("/etc/hosts");
    let etc = f.sync.find_node("/etc").await.unwrap();
    f.sync.query(etc).await.unwrap();
    assert_eq!(
        f.sync.find_node("/etc/hosts").await,
        Err(TreeError::PathNotFound("/etc/hosts".into()))
    );
}

#[tokio::test]
async fn test_ghosts_are_confirmed_or_dropped() {
    let f = fixture();
    f.fs.add_file("/srv/live", b"", 0);
    let root_dir = f.root_dir().await;

    let snapshot: tcf_filesystem::NodeSnapshot = serde_json::from_str(
        r#"{"name":"srv","kind":"directory","children":[
            {"name":"live","kind":"file"},
            {"name":"stale","kind":"file"}]}"#,
    )
    .unwrap();
    let srv = f.sync.restore(root_dir, snapshot).await.unwrap();
    let (live, stale) = {
        let tree = f.sync.tree().read();
        (
            tree.child_by_name(srv, "live").unwrap(),
            tree.child_by_name(srv, "stale").unwrap(),
        )
    };
    assert!(f.sync.tree().read().get(live).unwrap().is_ghost());

    let attrs = f.sync.refresh(srv).await.unwrap();
    assert!(attrs.is_directory());
    assert!(!f.sync.tree().read().get(srv).unwrap().is_ghost());

    f.sync.query(srv).await.unwrap();
    let tree = f.sync.tree().read();
    assert!(!tree.get(live).unwrap().is_ghost());
    assert!(tree.get(stale).is_none());
}

#[test]
fn test_blocking_callers_can_drive_queries() {
    let f = fixture();
    f.fs.add_file("/x/y", b"", 0);

    let x = tokio_test::block_on(f.sync.find_node("/x")).unwrap();
    tokio_test::block_on(f.sync.query(x)).unwrap();
    assert_eq!(f.names(x), ["y"]);
}

#[test]
fn test_remote_close_during_query_is_an_error() {
    let f = fixture();
    f.fs.add_file("/r/a", b"", 0);
    f.fs.add_file("/r/b", b"", 0);
    let r = tokio_test::block_on(f.sync.find_node("/r")).unwrap();
    tokio_test::block_on(f.sync.query(r)).unwrap();
    f.fs.add_file("/r/c", b"", 0);
    let reads = f.fs.call_count("readdir");

    f.manager.hold_opens();
    let (tx, rx) = mpsc::channel();
    f.sync.query_children(
        r,
        Box::new(move |result: Result<(), TreeError>| {
            let _ = tx.send(result);
        }),
    );
    f.settle();
    f.manager.release_opens();
    f.manager
        .close_remotely(ChannelError::Closed("peer reset".into()));

    let result = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(
        result,
        Err(TreeError::Channel(ChannelError::Closed("peer reset".into())))
    );

    // replies that arrive after the close do not continue the listing
    f.settle();
    f.settle();
    assert_eq!(f.fs.call_count("readdir"), reads);
    assert!(rx.try_recv().is_err());
    assert_eq!(f.state(r), QueryState::Queried);
    assert_eq!(f.names(r), ["a", "b"]);
    assert_eq!(f.manager.open_channels(), 0);
    assert_eq!(f.manager.open_count(), f.manager.close_count());
}

#[test]
fn test_remote_close_during_refresh_is_an_error() {
    let f = fixture();
    f.fs.add_file("/s", b"", 0);
    let s = tokio_test::block_on(f.sync.find_node("/s")).unwrap();

    f.manager.hold_opens();
    let (tx, rx) = mpsc::channel();
    f.sync.refresh_attributes(
        s,
        Box::new(move |result: Result<FileAttrs, TreeError>| {
            let _ = tx.send(result);
        }),
    );
    f.settle();
    f.manager.release_opens();
    f.manager
        .close_remotely(ChannelError::Closed("peer reset".into()));

    let result = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(
        result,
        Err(TreeError::Channel(ChannelError::Closed("peer reset".into())))
    );
    f.settle();
    assert!(rx.try_recv().is_err());
    assert_eq!(f.manager.open_channels(), 0);
}
