//! File system service decorator for non-dispatch threads.

use std::sync::Arc;

use bytes::Bytes;
use tcf_core::{
    AllDispatched, BlockingCall, Dispatcher, Outcome,
    services::filesystem::{
        DirEntry, DirPage, FileAttrs, FileHandle, FileSystem, FileSystemError, FsCallback,
        OpenFlags, ReadData,
    },
};
use tracing::error;

/// Wraps a [`FileSystem`] so each call blocks the calling thread until its
/// reply has been delivered.
///
/// Must not be used on the dispatch thread: calls made there fail with
/// [`FileSystemError::Local`] instead of deadlocking.
#[derive(Clone)]
pub struct BlockingFileSystem {
    inner: Arc<dyn FileSystem>,
    adapter: BlockingCall,
}

impl BlockingFileSystem {
    #[must_use]
    pub fn new(inner: Arc<dyn FileSystem>, adapter: BlockingCall) -> Self {
        Self { inner, adapter }
    }

    /// Wrap `inner` with the default timeout.
    #[must_use]
    pub fn with_dispatcher(inner: Arc<dyn FileSystem>, dispatcher: Dispatcher) -> Self {
        Self::new(inner, BlockingCall::new(dispatcher, AllDispatched))
    }

    /// Perform one call and return what its callback delivered.
    ///
    /// # Errors
    /// Returns the delivered error, [`FileSystemError::Timeout`] if nothing
    /// was delivered in time, or [`FileSystemError::Local`] if the call could
    /// not be issued.
    pub fn call<T, F>(&self, method: &'static str, f: F) -> Result<T, FileSystemError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn FileSystem, FsCallback<T>) + Send + 'static,
    {
        let outcome = Outcome::new();
        let fs = Arc::clone(&self.inner);
        self.adapter
            .invoke(method, outcome.callback(), move |done| f(&*fs, done))
            .map_err(|e| FileSystemError::Local(e.to_string()))?;
        outcome
            .take()
            .unwrap_or(Err(FileSystemError::Timeout(self.adapter.timeout())))
    }

    fn forward<T, F>(&self, method: &'static str, done: FsCallback<T>, f: F)
    where
        T: Send + 'static,
        F: FnOnce(&dyn FileSystem, FsCallback<T>) + Send + 'static,
    {
        if self.adapter.dispatcher().is_dispatch_thread() {
            error!(method, "Blocking file system call issued from the dispatch thread");
            done(Err(FileSystemError::Local(format!(
                "{method} called on the dispatch thread"
            ))));
            return;
        }
        let fs = Arc::clone(&self.inner);
        if let Err(e) = self.adapter.invoke(method, done, move |done| f(&*fs, done)) {
            error!(method, "Blocking file system call failed: {e}");
        }
    }
}

impl FileSystem for BlockingFileSystem {
    fn roots(&self, done: FsCallback<Vec<DirEntry>>) {
        self.forward("roots", done, |fs, done| fs.roots(done));
    }

    fn opendir(&self, path: &str, done: FsCallback<FileHandle>) {
        let path = path.to_string();
        self.forward("opendir", done, move |fs, done| fs.opendir(&path, done));
    }

    fn readdir(&self, handle: &FileHandle, done: FsCallback<DirPage>) {
        let handle = handle.clone();
        self.forward("readdir", done, move |fs, done| fs.readdir(&handle, done));
    }

    fn open(
        &self,
        path: &str,
        flags: OpenFlags,
        attrs: Option<FileAttrs>,
        done: FsCallback<FileHandle>,
    ) {
        let path = path.to_string();
        self.forward("open", done, move |fs, done| {
            fs.open(&path, flags, attrs, done);
        });
    }

    fn read(&self, handle: &FileHandle, offset: u64, len: usize, done: FsCallback<ReadData>) {
        let handle = handle.clone();
        self.forward("read", done, move |fs, done| {
            fs.read(&handle, offset, len, done);
        });
    }

    fn write(&self, handle: &FileHandle, offset: u64, data: Bytes, done: FsCallback<()>) {
        let handle = handle.clone();
        self.forward("write", done, move |fs, done| {
            fs.write(&handle, offset, data, done);
        });
    }

    fn close(&self, handle: &FileHandle, done: FsCallback<()>) {
        let handle = handle.clone();
        self.forward("close", done, move |fs, done| fs.close(&handle, done));
    }

    fn stat(&self, path: &str, done: FsCallback<FileAttrs>) {
        let path = path.to_string();
        self.forward("stat", done, move |fs, done| fs.stat(&path, done));
    }

    fn fstat(&self, handle: &FileHandle, done: FsCallback<FileAttrs>) {
        let handle = handle.clone();
        self.forward("fstat", done, move |fs, done| fs.fstat(&handle, done));
    }

    fn setstat(&self, path: &str, attrs: FileAttrs, done: FsCallback<()>) {
        let path = path.to_string();
        self.forward("setstat", done, move |fs, done| {
            fs.setstat(&path, attrs, done);
        });
    }

    fn fsetstat(&self, handle: &FileHandle, attrs: FileAttrs, done: FsCallback<()>) {
        let handle = handle.clone();
        self.forward("fsetstat", done, move |fs, done| {
            fs.fsetstat(&handle, attrs, done);
        });
    }

    fn remove(&self, path: &str, done: FsCallback<()>) {
        let path = path.to_string();
        self.forward("remove", done, move |fs, done| fs.remove(&path, done));
    }
}
