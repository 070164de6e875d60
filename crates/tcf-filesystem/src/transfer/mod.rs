//! File transfer between host and target.
//!
//! A transfer opens its own channel, streams the file in fixed-size chunks
//! and copies the modification time once both ends are closed. A failed or
//! cancelled transfer leaves no partial destination behind.

mod item;
mod progress;
pub mod stream;

use std::{
    fs::{self, File},
    io::{self, Read, Write},
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use tcf_core::{
    AllDispatched, BlockingCall, Channel, ChannelError, ChannelManager, CoreConfig, Dispatcher,
    Peer, open_channel_blocking,
    services::filesystem::{FileAttrs, FileSystemError},
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub use item::{Direction, TransferItem};
pub use progress::{
    CancellableMonitor, NullMonitor, ProgressMonitor, TOTAL_WORK, format_bytes, progress_message,
};

use crate::BlockingFileSystem;
use stream::{RemoteReader, RemoteWriter, from_io};

/// Transfer error.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),
    #[error("File system service not available on {0}")]
    NoFileSystem(String),
    #[error("Remote error on '{path}': {source}")]
    Remote {
        path: String,
        source: FileSystemError,
    },
    #[error("Local error on '{}': {source}", path.display())]
    Local { path: PathBuf, source: io::Error },
    #[error("File transfer must not run on the dispatch thread")]
    OnDispatchThread,
    #[error("Transfer task failed: {0}")]
    Task(String),
}

/// Terminal status of a transfer.
#[derive(Debug)]
pub enum TransferOutcome {
    Completed,
    Cancelled,
    Failed(TransferError),
}

impl TransferOutcome {
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }

    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    #[must_use]
    pub const fn error(&self) -> Option<&TransferError> {
        match self {
            Self::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// Why a copy stopped early.
enum Abort {
    Cancelled,
    Failed(TransferError),
}

impl From<TransferError> for Abort {
    fn from(error: TransferError) -> Self {
        Self::Failed(error)
    }
}

fn local(path: &Path) -> impl FnOnce(io::Error) -> TransferError + '_ {
    move |source| TransferError::Local {
        path: path.to_path_buf(),
        source,
    }
}

fn remote(path: &str) -> impl FnOnce(FileSystemError) -> TransferError + '_ {
    move |source| TransferError::Remote {
        path: path.to_string(),
        source,
    }
}

/// Map an I/O error of a remote stream back to the remote error it carries.
fn remote_io(path: &str, error: io::Error) -> TransferError {
    match from_io(&error) {
        Some(source) => remote(path)(source),
        None => remote(path)(FileSystemError::Local(error.to_string())),
    }
}

fn check_cancelled(monitor: &dyn ProgressMonitor) -> Result<(), Abort> {
    if monitor.is_cancelled() {
        Err(Abort::Cancelled)
    } else {
        Ok(())
    }
}

/// Append `name` to a remote directory path.
fn join_remote(dir: &str, name: &str) -> String {
    if dir.ends_with('/') || dir.ends_with('\\') {
        format!("{dir}{name}")
    } else if dir.contains('\\') && !dir.contains('/') {
        format!("{dir}\\{name}")
    } else {
        format!("{dir}/{name}")
    }
}

/// Last segment of a remote path.
fn remote_basename(path: &str) -> Option<&str> {
    path.rsplit(['/', '\\']).find(|s| !s.is_empty())
}

fn to_millis(time: SystemTime) -> Option<i64> {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => i64::try_from(after.as_millis()).ok(),
        Err(before) => i64::try_from(before.duration().as_millis()).ok().map(|ms| -ms),
    }
}

fn from_millis(ms: i64) -> Option<SystemTime> {
    let offset = Duration::from_millis(ms.unsigned_abs());
    if ms >= 0 {
        UNIX_EPOCH.checked_add(offset)
    } else {
        UNIX_EPOCH.checked_sub(offset)
    }
}

/// Copies files between host and target.
#[derive(Clone)]
pub struct TransferEngine {
    dispatcher: Dispatcher,
    manager: Arc<dyn ChannelManager>,
    config: CoreConfig,
}

impl TransferEngine {
    #[must_use]
    pub fn new(
        dispatcher: Dispatcher,
        manager: Arc<dyn ChannelManager>,
        config: &CoreConfig,
    ) -> Self {
        Self {
            dispatcher,
            manager,
            config: config.clone(),
        }
    }

    /// Run a transfer on the calling thread.
    ///
    /// Must not be called on the dispatch thread. A disabled item completes
    /// immediately without opening a channel.
    pub fn transfer(
        &self,
        peer: &Peer,
        item: &TransferItem,
        monitor: &dyn ProgressMonitor,
    ) -> TransferOutcome {
        if !item.enabled {
            debug!(source = %item.source(), "Transfer item disabled, skipping");
            return TransferOutcome::Completed;
        }
        if self.dispatcher.is_dispatch_thread() {
            error!("File transfer issued from the dispatch thread");
            return TransferOutcome::Failed(TransferError::OnDispatchThread);
        }

        monitor.begin(
            &format!("Transferring {} to {}", item.source(), item.destination()),
            TOTAL_WORK,
        );

        let channel = match open_channel_blocking(
            &self.dispatcher,
            &self.manager,
            peer,
            self.config.channel_timeout(),
        ) {
            Ok(channel) => channel,
            Err(e) => {
                monitor.done();
                return TransferOutcome::Failed(e.into());
            }
        };

        let result = match self.file_system(&channel, peer) {
            Ok(fs) => match item.direction {
                Direction::HostToTarget => self.upload(&fs, item, monitor),
                Direction::TargetToHost => self.download(&fs, item, monitor),
            },
            Err(e) => Err(Abort::Failed(e)),
        };
        self.close_channel(channel);
        monitor.done();

        match result {
            Ok(()) => {
                info!(
                    source = %item.source(),
                    destination = %item.destination(),
                    "Transfer completed"
                );
                TransferOutcome::Completed
            }
            Err(Abort::Cancelled) => {
                info!(source = %item.source(), "Transfer cancelled");
                TransferOutcome::Cancelled
            }
            Err(Abort::Failed(e)) => {
                warn!(source = %item.source(), "Transfer failed: {e}");
                TransferOutcome::Failed(e)
            }
        }
    }

    /// Run a transfer on its own thread and report the outcome to `done`.
    ///
    /// # Errors
    /// Returns error if the transfer thread cannot be started.
    pub fn transfer_with_callback<F>(
        &self,
        peer: Peer,
        item: TransferItem,
        monitor: Arc<dyn ProgressMonitor>,
        done: F,
    ) -> Result<thread::JoinHandle<()>, TransferError>
    where
        F: FnOnce(&Peer, TransferOutcome) + Send + 'static,
    {
        let engine = self.clone();
        thread::Builder::new()
            .name("tcf-transfer".to_string())
            .spawn(move || {
                let outcome = engine.transfer(&peer, &item, monitor.as_ref());
                done(&peer, outcome);
            })
            .map_err(|e| TransferError::Task(e.to_string()))
    }

    /// Run a transfer on the blocking thread pool.
    pub async fn transfer_async(
        &self,
        peer: Peer,
        item: TransferItem,
        monitor: Arc<dyn ProgressMonitor>,
    ) -> TransferOutcome {
        let engine = self.clone();
        tokio::task::spawn_blocking(move || engine.transfer(&peer, &item, monitor.as_ref()))
            .await
            .unwrap_or_else(|e| TransferOutcome::Failed(TransferError::Task(e.to_string())))
    }

    fn file_system(
        &self,
        channel: &Arc<dyn Channel>,
        peer: &Peer,
    ) -> Result<BlockingFileSystem, TransferError> {
        let lookup = Arc::clone(channel);
        let fs = self
            .dispatcher
            .invoke_and_wait(move || lookup.file_system())
            .map_err(|e| TransferError::Channel(e.into()))?
            .ok_or_else(|| TransferError::NoFileSystem(peer.id.clone()))?;
        let adapter = BlockingCall::new(self.dispatcher.clone(), AllDispatched)
            .with_timeout(self.config.call_timeout());
        Ok(BlockingFileSystem::new(fs, adapter))
    }

    fn close_channel(&self, channel: Arc<dyn Channel>) {
        let manager = Arc::clone(&self.manager);
        if let Err(e) = self
            .dispatcher
            .invoke_and_wait(move || manager.close_channel(&channel))
        {
            warn!("Failed to close transfer channel: {e}");
        }
    }

    fn upload(
        &self,
        fs: &BlockingFileSystem,
        item: &TransferItem,
        monitor: &dyn ProgressMonitor,
    ) -> Result<(), Abort> {
        let source = item.host_path.as_path();
        let metadata = fs::metadata(source).map_err(local(source))?;

        let mut target = item.target_path.clone();
        let stat_path = target.clone();
        let existing = fs.call("stat", move |fs, done| fs.stat(&stat_path, done));
        if existing.is_err() || existing.as_ref().is_ok_and(FileAttrs::is_directory) {
            if let Some(name) = source.file_name() {
                target = join_remote(&target, &name.to_string_lossy());
            }
        }
        debug!(source = %source.display(), target = %target, "Uploading");

        check_cancelled(monitor)?;
        let mut input = File::open(source).map_err(local(source))?;
        let mut output = RemoteWriter::create(fs, &target).map_err(remote(&target))?;

        let copied = self.copy(
            &mut input,
            &mut output,
            metadata.len(),
            monitor,
            |e| TransferError::Local {
                path: source.to_path_buf(),
                source: e,
            },
            |e| remote_io(&target, e),
        );
        drop(input);
        let closed = output.close().map_err(remote(&target));

        let result = match (copied, closed) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(abort), _) => Err(abort),
            (Ok(()), Err(e)) => Err(Abort::Failed(e)),
        };
        if result.is_err() {
            let remove_path = target.clone();
            if let Err(e) = fs.call("remove", move |fs, done| fs.remove(&remove_path, done)) {
                debug!(target = %target, "Could not remove partial upload: {e}");
            }
            return result;
        }

        if let Some(mtime) = metadata.modified().ok().and_then(to_millis) {
            let attrs = FileAttrs {
                mtime: Some(mtime),
                ..FileAttrs::default()
            };
            let set_path = target.clone();
            if let Err(e) = fs.call("setstat", move |fs, done| fs.setstat(&set_path, attrs, done)) {
                warn!(target = %target, "Failed to set modification time: {e}");
            }
        }
        Ok(())
    }

    fn download(
        &self,
        fs: &BlockingFileSystem,
        item: &TransferItem,
        monitor: &dyn ProgressMonitor,
    ) -> Result<(), Abort> {
        let source = item.target_path.as_str();
        let mut destination = item.host_path.clone();
        if destination.is_dir() {
            if let Some(name) = remote_basename(source) {
                destination.push(name);
            }
        }
        let parent = match destination.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).map_err(local(&parent))?;
        debug!(source = %source, destination = %destination.display(), "Downloading");

        check_cancelled(monitor)?;
        let mut input = RemoteReader::open(fs, source).map_err(remote(source))?;
        let attrs = match input.attrs() {
            Ok(attrs) => attrs,
            Err(e) => {
                let _ = input.close();
                return Err(remote(source)(e).into());
            }
        };
        let mut staging = match tempfile::NamedTempFile::new_in(&parent) {
            Ok(staging) => staging,
            Err(e) => {
                let _ = input.close();
                return Err(local(&parent)(e).into());
            }
        };

        let copied = self.copy(
            &mut input,
            &mut staging,
            attrs.size.unwrap_or(0),
            monitor,
            |e| remote_io(source, e),
            |e| TransferError::Local {
                path: destination.clone(),
                source: e,
            },
        );
        let closed = input.close().map_err(remote(source));
        match (copied, closed) {
            (Ok(()), Ok(())) => {}
            (Err(abort), _) => return Err(abort),
            (Ok(()), Err(e)) => return Err(Abort::Failed(e)),
        }

        // dropping the persisted file closes it before the time is set
        drop(
            staging
                .persist(&destination)
                .map_err(|e| local(&destination)(e.error))?,
        );

        if let Some(mtime) = attrs.mtime.and_then(from_millis) {
            let set = File::options()
                .write(true)
                .open(&destination)
                .and_then(|file| file.set_modified(mtime));
            if let Err(e) = set {
                warn!(destination = %destination.display(), "Failed to set modification time: {e}");
            }
        }
        Ok(())
    }

    /// Copy in chunks, checking for cancellation before and after each read.
    fn copy<R, W>(
        &self,
        input: &mut R,
        output: &mut W,
        total: u64,
        monitor: &dyn ProgressMonitor,
        read_error: impl Fn(io::Error) -> TransferError,
        write_error: impl Fn(io::Error) -> TransferError,
    ) -> Result<(), Abort>
    where
        R: Read,
        W: Write,
    {
        let mut buffer = vec![0u8; self.config.transfer_chunk_size.max(1)];
        let started = Instant::now();
        let mut done: u64 = 0;
        let mut reported: u64 = 0;

        loop {
            check_cancelled(monitor)?;
            let n = match input.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(read_error(e).into()),
            };
            check_cancelled(monitor)?;
            output.write_all(&buffer[..n]).map_err(&write_error)?;

            done += n as u64;
            let elapsed_ms = u64::try_from(started.elapsed().as_millis())
                .unwrap_or(u64::MAX)
                .max(1);
            let speed = done.saturating_mul(1000) / elapsed_ms;
            let progress = if total == 0 {
                TOTAL_WORK
            } else {
                done.min(total).saturating_mul(TOTAL_WORK) / total
            };
            if progress > reported {
                monitor.worked(progress - reported);
                reported = progress;
            }
            monitor.sub_task(&progress_message(done, total, speed));
        }
        output.flush().map_err(write_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_remote() {
        assert_eq!(join_remote("/tmp", "a.txt"), "/tmp/a.txt");
        assert_eq!(join_remote("/", "a.txt"), "/a.txt");
        assert_eq!(join_remote("C:\\Temp", "a.txt"), "C:\\Temp\\a.txt");
        assert_eq!(join_remote("C:\\", "a.txt"), "C:\\a.txt");
    }

    #[test]
    fn test_remote_basename() {
        assert_eq!(remote_basename("/var/log/syslog"), Some("syslog"));
        assert_eq!(remote_basename("/var/log/"), Some("log"));
        assert_eq!(remote_basename("C:\\boot.ini"), Some("boot.ini"));
        assert_eq!(remote_basename("/"), None);
    }

    #[test]
    fn test_millis_conversion() {
        let time = from_millis(1_700_000_000_123).unwrap();
        assert_eq!(to_millis(time), Some(1_700_000_000_123));
        let before = from_millis(-5_000).unwrap();
        assert_eq!(to_millis(before), Some(-5_000));
    }
}
