use std::{
    fs,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tcf_core::{
    ChannelError, CoreConfig, Peer,
    services::filesystem::{FileSystemError, StatusCode},
};
use tcf_filesystem::{
    CancellableMonitor, NullMonitor, ProgressMonitor, TransferEngine, TransferError,
    TransferItem, TransferOutcome,
};
use tcf_test_utils::{MemFileSystem, SimChannelManager, dispatcher};
use tempfile::TempDir;

const MTIME: i64 = 1_600_000_000_000;

struct Fixture {
    fs: Arc<MemFileSystem>,
    manager: Arc<SimChannelManager>,
    engine: TransferEngine,
    peer: Peer,
    host: TempDir,
}

fn fixture() -> Fixture {
    let dispatcher = dispatcher();
    let fs = Arc::new(MemFileSystem::new(dispatcher.clone()));
    let manager =
        Arc::new(SimChannelManager::new(dispatcher.clone()).with_file_system(Arc::clone(&fs)));
    let config = CoreConfig {
        transfer_chunk_size: 4,
        ..CoreConfig::default()
    };
    let engine = TransferEngine::new(dispatcher, manager.clone(), &config);
    Fixture {
        fs,
        manager,
        engine,
        peer: Peer::new("TCP:10.0.0.2:1534", "board"),
        host: tempfile::tempdir().unwrap(),
    }
}

impl Fixture {
    fn run(&self, item: &TransferItem, monitor: &dyn ProgressMonitor) -> TransferOutcome {
        self.engine.transfer(&self.peer, item, monitor)
    }

    fn assert_channels_closed(&self) {
        assert_eq!(self.manager.open_count(), self.manager.close_count());
        assert_eq!(self.manager.open_channels(), 0);
        assert_eq!(self.fs.open_handles(), 0);
    }

    fn host_files(&self) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(self.host.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

fn modified_ms(path: &Path) -> i64 {
    let modified = fs::metadata(path).unwrap().modified().unwrap();
    i64::try_from(modified.duration_since(UNIX_EPOCH).unwrap().as_millis()).unwrap()
}

/// Cancels once `limit` units of work have been reported.
struct CancelAfter {
    limit: u64,
    worked: AtomicU64,
}

impl CancelAfter {
    fn new(limit: u64) -> Self {
        Self {
            limit,
            worked: AtomicU64::new(0),
        }
    }
}

impl ProgressMonitor for CancelAfter {
    fn worked(&self, work: u64) {
        self.worked.fetch_add(work, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.worked.load(Ordering::SeqCst) >= self.limit
    }
}

#[test]
fn test_download_copies_contents_and_mtime() {
    let f = fixture();
    f.fs.add_file("/var/log/messages", b"kernel: booted\n", MTIME);
    let destination = f.host.path().join("messages.txt");

    let monitor = CancellableMonitor::new();
    let outcome = f.run(
        &TransferItem::to_host("/var/log/messages", &destination),
        &monitor,
    );

    assert!(outcome.is_completed(), "{outcome:?}");
    assert_eq!(fs::read(&destination).unwrap(), b"kernel: booted\n");
    assert_eq!(modified_ms(&destination), MTIME);
    assert_eq!(f.host_files(), vec!["messages.txt"]);
    assert!(monitor.task().contains("/var/log/messages"));
    assert_eq!(monitor.total_worked(), 1000);
    assert!(monitor.sub_task_text().starts_with("15B of 15B at "));
    f.assert_channels_closed();
}

#[test]
fn test_upload_copies_contents_and_mtime() {
    let f = fixture();
    f.fs.add_dir("/tmp");
    let source = f.host.path().join("app.bin");
    fs::write(&source, b"\x7fELF payload").unwrap();

    let outcome = f.run(&TransferItem::to_target(&source, "/tmp"), &NullMonitor);

    assert!(outcome.is_completed(), "{outcome:?}");
    assert_eq!(f.fs.file("/tmp/app.bin").unwrap(), b"\x7fELF payload");
    assert_eq!(f.fs.mtime("/tmp/app.bin"), Some(modified_ms(&source)));
    f.assert_channels_closed();
}

#[test]
fn test_repeated_transfers_are_identical() {
    let f = fixture();
    f.fs.add_dir("/tmp");
    let source = f.host.path().join("config.ini");
    fs::write(&source, b"[net]\naddr=10.0.0.2\n").unwrap();
    let item = TransferItem::to_target(&source, "/tmp");

    assert!(f.run(&item, &NullMonitor).is_completed());
    let first = (f.fs.file("/tmp/config.ini"), f.fs.mtime("/tmp/config.ini"));
    assert!(f.run(&item, &NullMonitor).is_completed());
    let second = (f.fs.file("/tmp/config.ini"), f.fs.mtime("/tmp/config.ini"));

    assert_eq!(first, second);
    assert_eq!(f.manager.open_count(), 2);
    f.assert_channels_closed();
}

#[test]
fn test_empty_file_round_trip() {
    let f = fixture();
    f.fs.add_file("/etc/empty", b"", MTIME);
    let destination = f.host.path().join("empty");

    let outcome = f.run(&TransferItem::to_host("/etc/empty", &destination), &NullMonitor);

    assert!(outcome.is_completed(), "{outcome:?}");
    assert!(fs::read(&destination).unwrap().is_empty());
    f.assert_channels_closed();
}

#[test]
fn test_upload_into_directory_appends_file_name() {
    let f = fixture();
    f.fs.add_dir("/opt/bin");
    let source = f.host.path().join("tool");
    fs::write(&source, b"#!/bin/sh\n").unwrap();

    let outcome = f.run(&TransferItem::to_target(&source, "/opt/bin"), &NullMonitor);

    assert!(outcome.is_completed(), "{outcome:?}");
    assert_eq!(f.fs.file("/opt/bin/tool").unwrap(), b"#!/bin/sh\n");
}

#[test]
fn test_upload_to_missing_path_appends_file_name() {
    let f = fixture();
    f.fs.add_dir("/data");
    let source = f.host.path().join("blob");
    fs::write(&source, b"1234").unwrap();

    // stat fails, so the target is taken to be a directory that the open
    // then reports as missing
    let outcome = f.run(&TransferItem::to_target(&source, "/data/new"), &NullMonitor);

    match outcome.error() {
        Some(TransferError::Remote { path, source }) => {
            assert_eq!(path, "/data/new/blob");
            assert_eq!(source.status(), Some(StatusCode::NoSuchFile));
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    f.assert_channels_closed();
}

#[test]
fn test_download_into_directory_appends_file_name() {
    let f = fixture();
    f.fs.add_file("/boot/vmlinuz", b"kernel image", MTIME);

    let outcome = f.run(
        &TransferItem::to_host("/boot/vmlinuz", f.host.path()),
        &NullMonitor,
    );

    assert!(outcome.is_completed(), "{outcome:?}");
    assert_eq!(
        fs::read(f.host.path().join("vmlinuz")).unwrap(),
        b"kernel image"
    );
}

#[test]
fn test_download_creates_missing_parent_directories() {
    let f = fixture();
    f.fs.add_file("/etc/hosts", b"127.0.0.1 localhost\n", MTIME);
    let destination = f.host.path().join("board").join("etc").join("hosts");

    let outcome = f.run(&TransferItem::to_host("/etc/hosts", &destination), &NullMonitor);

    assert!(outcome.is_completed(), "{outcome:?}");
    assert_eq!(fs::read(&destination).unwrap(), b"127.0.0.1 localhost\n");
}

#[test]
fn test_disabled_item_opens_no_channel() {
    let f = fixture();
    let item = TransferItem::to_host("/missing", f.host.path().join("x")).with_enabled(false);

    assert!(f.run(&item, &NullMonitor).is_completed());
    assert_eq!(f.manager.open_count(), 0);
    assert!(f.fs.calls().is_empty());
}

#[test]
fn test_cancel_before_start_leaves_nothing() {
    let f = fixture();
    f.fs.add_file("/var/data", b"abcdefgh", MTIME);
    let destination = f.host.path().join("data");
    let monitor = CancellableMonitor::new();
    monitor.cancel();

    let outcome = f.run(&TransferItem::to_host("/var/data", &destination), &monitor);

    assert!(outcome.is_cancelled());
    assert!(!destination.exists());
    assert_eq!(f.fs.call_count("open"), 0);
    f.assert_channels_closed();
}

#[test]
fn test_cancelled_download_keeps_existing_file() {
    let f = fixture();
    f.fs.add_file("/var/data", b"0123456789abcdef", MTIME);
    let destination = f.host.path().join("data");
    fs::write(&destination, b"original").unwrap();

    let monitor = CancelAfter::new(1);
    let outcome = f.run(&TransferItem::to_host("/var/data", &destination), &monitor);

    assert!(outcome.is_cancelled(), "{outcome:?}");
    assert_eq!(fs::read(&destination).unwrap(), b"original");
    assert_eq!(f.host_files(), vec!["data"]);
    assert_eq!(f.fs.call_count("read"), 1);
    f.assert_channels_closed();
}

#[test]
fn test_cancelled_upload_removes_partial_target() {
    let f = fixture();
    f.fs.add_dir("/tmp");
    let source = f.host.path().join("big");
    fs::write(&source, b"0123456789abcdef").unwrap();

    let monitor = CancelAfter::new(1);
    let outcome = f.run(&TransferItem::to_target(&source, "/tmp"), &monitor);

    assert!(outcome.is_cancelled(), "{outcome:?}");
    assert!(!f.fs.exists("/tmp/big"));
    assert_eq!(f.fs.call_count("write"), 1);
    assert_eq!(f.fs.call_count("remove"), 1);
    f.assert_channels_closed();
}

#[test]
fn test_failed_write_removes_partial_target() {
    let f = fixture();
    f.fs.add_dir("/tmp");
    let source = f.host.path().join("big");
    fs::write(&source, b"0123456789").unwrap();
    f.fs.fail_nth(
        "write",
        2,
        FileSystemError::remote(StatusCode::Failure, "disk full"),
    );

    let outcome = f.run(&TransferItem::to_target(&source, "/tmp"), &NullMonitor);

    match outcome.error() {
        Some(TransferError::Remote { path, source }) => {
            assert_eq!(path, "/tmp/big");
            assert_eq!(
                *source,
                FileSystemError::remote(StatusCode::Failure, "disk full")
            );
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(!f.fs.exists("/tmp/big"));
    f.assert_channels_closed();
}

#[test]
fn test_failed_open_leaves_existing_target() {
    let f = fixture();
    f.fs.add_file("/tmp/keep", b"keep me", MTIME);
    f.fs.fail_path(
        "open",
        "/tmp/keep",
        FileSystemError::remote(StatusCode::PermissionDenied, "read-only"),
    );
    let source = f.host.path().join("keep");
    fs::write(&source, b"new").unwrap();

    let outcome = f.run(&TransferItem::to_target(&source, "/tmp/keep"), &NullMonitor);

    assert!(matches!(outcome.error(), Some(TransferError::Remote { .. })));
    assert_eq!(f.fs.file("/tmp/keep").unwrap(), b"keep me");
    assert_eq!(f.fs.call_count("remove"), 0);
}

#[test]
fn test_empty_read_before_eof_fails_download() {
    let f = fixture();
    f.fs.add_file("/var/data", b"0123456789", MTIME);
    f.fs.set_stalled_reads(true);
    let destination = f.host.path().join("data");
    fs::write(&destination, b"previous").unwrap();

    let outcome = f.run(&TransferItem::to_host("/var/data", &destination), &NullMonitor);

    assert!(matches!(
        outcome.error(),
        Some(TransferError::Remote { path, source: FileSystemError::Local(_) })
            if path == "/var/data"
    ));
    assert_eq!(fs::read(&destination).unwrap(), b"previous");
    assert_eq!(f.host_files(), ["data"]);
    f.assert_channels_closed();
}

#[test]
fn test_failed_read_leaves_no_partial_download() {
    let f = fixture();
    f.fs.add_file("/var/data", b"0123456789", MTIME);
    f.fs.fail_nth(
        "read",
        2,
        FileSystemError::remote(StatusCode::Failure, "i/o error"),
    );
    let destination = f.host.path().join("data");

    let outcome = f.run(&TransferItem::to_host("/var/data", &destination), &NullMonitor);

    assert!(matches!(
        outcome.error(),
        Some(TransferError::Remote { path, .. }) if path == "/var/data"
    ));
    assert!(f.host_files().is_empty());
    f.assert_channels_closed();
}

#[test]
fn test_missing_local_source() {
    let f = fixture();
    let source = f.host.path().join("nope");

    let outcome = f.run(&TransferItem::to_target(&source, "/tmp/nope"), &NullMonitor);

    match outcome.error() {
        Some(TransferError::Local { path, .. }) => assert_eq!(path, &source),
        other => panic!("unexpected outcome {other:?}"),
    }
    f.assert_channels_closed();
}

#[test]
fn test_channel_failure_is_reported() {
    let f = fixture();
    f.manager
        .fail_opens(Some(ChannelError::NotResponding("board".to_string())));

    let outcome = f.run(
        &TransferItem::to_host("/etc/hosts", f.host.path().join("hosts")),
        &NullMonitor,
    );

    assert!(matches!(
        outcome.error(),
        Some(TransferError::Channel(ChannelError::NotResponding(_)))
    ));
}

#[test]
fn test_transfer_with_callback_reports_outcome() {
    let f = fixture();
    f.fs.add_file("/etc/motd", b"welcome", MTIME);
    let destination = f.host.path().join("motd");
    let (tx, rx) = std::sync::mpsc::channel();

    let handle = f
        .engine
        .transfer_with_callback(
            f.peer.clone(),
            TransferItem::to_host("/etc/motd", &destination),
            Arc::new(NullMonitor),
            move |peer: &Peer, outcome: TransferOutcome| {
                tx.send((peer.name.clone(), outcome.is_completed())).unwrap();
            },
        )
        .unwrap();

    let (peer, completed) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    handle.join().unwrap();
    assert_eq!(peer, "board");
    assert!(completed);
    assert_eq!(fs::read(&destination).unwrap(), b"welcome");
}

#[tokio::test]
async fn test_transfer_async() {
    let f = fixture();
    f.fs.add_dir("/tmp");
    let source = f.host.path().join("notes");
    fs::write(&source, b"async").unwrap();

    let outcome = f
        .engine
        .transfer_async(
            f.peer.clone(),
            TransferItem::to_target(&source, "/tmp"),
            Arc::new(NullMonitor),
        )
        .await;

    assert!(outcome.is_completed(), "{outcome:?}");
    assert_eq!(f.fs.file("/tmp/notes").unwrap(), b"async");
}

#[test]
fn test_old_mtime_survives_download() {
    let f = fixture();
    let old = i64::try_from(
        (SystemTime::now() - Duration::from_secs(86_400 * 365))
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis(),
    )
    .unwrap();
    f.fs.add_file("/srv/archive", b"old", old);
    let destination = f.host.path().join("archive");

    assert!(
        f.run(&TransferItem::to_host("/srv/archive", &destination), &NullMonitor)
            .is_completed()
    );
    assert_eq!(modified_ms(&destination), old);
}
