//! In-memory file system service.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;
use parking_lot::Mutex;
use tcf_core::{
    Dispatcher,
    services::filesystem::{
        DirEntry, DirPage, FileAttrs, FileHandle, FileSystem, FileSystemError, FsCallback,
        OpenFlags, ReadData, StatusCode,
    },
};

#[derive(Debug, Clone)]
enum Entry {
    Dir { mtime: i64 },
    File { data: Vec<u8>, mtime: i64 },
}

impl Entry {
    fn attrs(&self) -> FileAttrs {
        match self {
            Self::Dir { mtime } => FileAttrs {
                mtime: Some(*mtime),
                ..FileAttrs::directory()
            },
            Self::File { data, mtime } => FileAttrs::file(data.len() as u64, *mtime),
        }
    }
}

enum Handle {
    Dir(VecDeque<Vec<DirEntry>>),
    File(String),
}

struct State {
    entries: BTreeMap<String, Entry>,
    handles: HashMap<String, Handle>,
    next_handle: u64,
    page_size: usize,
    leading_empty_page: bool,
    stalled_reads: bool,
    failures: HashMap<(String, Option<String>), FileSystemError>,
    countdowns: HashMap<String, (usize, FileSystemError)>,
    calls: Vec<String>,
}

/// In-memory POSIX-style file system with a single `/` root.
///
/// Directory listings are split into pages of `page_size` entries. Calls can
/// be made to fail per method, or per method and path.
pub struct MemFileSystem {
    dispatcher: Dispatcher,
    state: Mutex<State>,
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}

fn name_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn no_such_file(path: &str) -> FileSystemError {
    FileSystemError::remote(StatusCode::NoSuchFile, format!("{path}: no such file"))
}

impl MemFileSystem {
    #[must_use]
    pub fn new(dispatcher: Dispatcher) -> Self {
        let mut entries = BTreeMap::new();
        entries.insert("/".to_string(), Entry::Dir { mtime: now_ms() });
        Self {
            dispatcher,
            state: Mutex::new(State {
                entries,
                handles: HashMap::new(),
                next_handle: 0,
                page_size: 100,
                leading_empty_page: false,
                stalled_reads: false,
                failures: HashMap::new(),
                countdowns: HashMap::new(),
                calls: Vec::new(),
            }),
        }
    }

    /// Number of entries per directory page.
    pub fn set_page_size(&self, page_size: usize) {
        self.state.lock().page_size = page_size.max(1);
    }

    /// Start every listing with an empty, non-final page.
    pub fn set_leading_empty_page(&self, enabled: bool) {
        self.state.lock().leading_empty_page = enabled;
    }

    /// Answer every file read with no data and no end-of-file flag.
    pub fn set_stalled_reads(&self, enabled: bool) {
        self.state.lock().stalled_reads = enabled;
    }

    /// Create a directory and any missing parents.
    pub fn add_dir(&self, path: &str) {
        let mut state = self.state.lock();
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            state
                .entries
                .entry(current.clone())
                .or_insert(Entry::Dir { mtime: now_ms() });
        }
    }

    /// Create or replace a file, creating missing parent directories.
    pub fn add_file(&self, path: &str, data: &[u8], mtime: i64) {
        self.add_dir(parent_of(path));
        self.state.lock().entries.insert(
            path.to_string(),
            Entry::File {
                data: data.to_vec(),
                mtime,
            },
        );
    }

    /// Delete an entry and everything below it, as if removed on the agent.
    pub fn delete(&self, path: &str) {
        let prefix = format!("{path}/");
        self.state
            .lock()
            .entries
            .retain(|p, _| p != path && !p.starts_with(&prefix));
    }

    #[must_use]
    pub fn exists(&self, path: &str) -> bool {
        self.state.lock().entries.contains_key(path)
    }

    /// Contents of a file.
    #[must_use]
    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        match self.state.lock().entries.get(path) {
            Some(Entry::File { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    #[must_use]
    pub fn mtime(&self, path: &str) -> Option<i64> {
        match self.state.lock().entries.get(path)? {
            Entry::Dir { mtime } | Entry::File { mtime, .. } => Some(*mtime),
        }
    }

    /// Make every call of `method` fail with `error`.
    pub fn fail(&self, method: &str, error: FileSystemError) {
        self.state
            .lock()
            .failures
            .insert((method.to_string(), None), error);
    }

    /// Make calls of `method` on `path` fail with `error`.
    pub fn fail_path(&self, method: &str, path: &str, error: FileSystemError) {
        self.state
            .lock()
            .failures
            .insert((method.to_string(), Some(path.to_string())), error);
    }

    /// Make only the `n`th upcoming call of `method` fail (1-based).
    pub fn fail_nth(&self, method: &str, n: usize, error: FileSystemError) {
        self.state
            .lock()
            .countdowns
            .insert(method.to_string(), (n.max(1), error));
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.failures.clear();
        state.countdowns.clear();
    }

    /// Calls received so far, as `"method path"`.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    /// Number of calls of `method` received so far.
    #[must_use]
    pub fn call_count(&self, method: &str) -> usize {
        let prefix = format!("{method} ");
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.starts_with(&prefix))
            .count()
    }

    /// Handles that were opened and not closed.
    #[must_use]
    pub fn open_handles(&self) -> usize {
        self.state.lock().handles.len()
    }

    fn reply<T: Send + 'static>(&self, done: FsCallback<T>, result: Result<T, FileSystemError>) {
        self.dispatcher.invoke_later(move || done(result));
    }

    /// Record a call and run `op` unless a failure is injected for it.
    fn call<T, F>(&self, method: &str, path: &str, done: FsCallback<T>, op: F)
    where
        T: Send + 'static,
        F: FnOnce(&mut State) -> Result<T, FileSystemError>,
    {
        let result = {
            let mut state = self.state.lock();
            state.calls.push(format!("{method} {path}"));
            let mut injected = state
                .failures
                .get(&(method.to_string(), Some(path.to_string())))
                .or_else(|| state.failures.get(&(method.to_string(), None)))
                .cloned();
            if let Some((remaining, error)) = state.countdowns.get_mut(method) {
                *remaining -= 1;
                if *remaining == 0 {
                    injected = Some(error.clone());
                    state.countdowns.remove(method);
                }
            }
            match injected {
                Some(error) => Err(error),
                None => op(&mut *state),
            }
        };
        self.reply(done, result);
    }

    fn handle_path(&self, handle: &FileHandle) -> String {
        match self.state.lock().handles.get(handle.as_str()) {
            Some(Handle::File(path)) => path.clone(),
            Some(Handle::Dir(_)) => format!("<dir {}>", handle.as_str()),
            None => format!("<unknown {}>", handle.as_str()),
        }
    }
}

impl State {
    fn new_handle(&mut self, handle: Handle) -> FileHandle {
        self.next_handle += 1;
        let id = format!("h{}", self.next_handle);
        self.handles.insert(id.clone(), handle);
        FileHandle::new(id)
    }

    fn file_path(&self, handle: &FileHandle) -> Result<String, FileSystemError> {
        match self.handles.get(handle.as_str()) {
            Some(Handle::File(path)) => Ok(path.clone()),
            _ => Err(FileSystemError::remote(
                StatusCode::Failure,
                format!("invalid file handle {}", handle.as_str()),
            )),
        }
    }

    fn file_mut(&mut self, path: &str) -> Result<(&mut Vec<u8>, &mut i64), FileSystemError> {
        match self.entries.get_mut(path) {
            Some(Entry::File { data, mtime }) => Ok((data, mtime)),
            Some(Entry::Dir { .. }) => Err(FileSystemError::remote(
                StatusCode::Failure,
                format!("{path}: is a directory"),
            )),
            None => Err(no_such_file(path)),
        }
    }

    fn apply_attrs(&mut self, path: &str, attrs: &FileAttrs) -> Result<(), FileSystemError> {
        match self.entries.get_mut(path) {
            Some(Entry::Dir { mtime } | Entry::File { mtime, .. }) => {
                if let Some(new_mtime) = attrs.mtime {
                    *mtime = new_mtime;
                }
                Ok(())
            }
            None => Err(no_such_file(path)),
        }
    }
}

impl FileSystem for MemFileSystem {
    fn roots(&self, done: FsCallback<Vec<DirEntry>>) {
        self.call("roots", "", done, |state| {
            let attrs = state
                .entries
                .get("/")
                .map_or_else(FileAttrs::directory, Entry::attrs);
            Ok(vec![DirEntry::new("/", attrs)])
        });
    }

    fn opendir(&self, path: &str, done: FsCallback<FileHandle>) {
        self.call("opendir", path, done, |state| {
            if !matches!(state.entries.get(path), Some(Entry::Dir { .. })) {
                return Err(no_such_file(path));
            }
            let children: Vec<DirEntry> = state
                .entries
                .iter()
                .filter(|(p, _)| p.as_str() != "/" && parent_of(p) == path)
                .map(|(p, e)| DirEntry::new(name_of(p), e.attrs()))
                .collect();
            let mut pages: VecDeque<Vec<DirEntry>> = children
                .chunks(state.page_size)
                .map(<[DirEntry]>::to_vec)
                .collect();
            if state.leading_empty_page && !pages.is_empty() {
                pages.push_front(Vec::new());
            }
            Ok(state.new_handle(Handle::Dir(pages)))
        });
    }

    fn readdir(&self, handle: &FileHandle, done: FsCallback<DirPage>) {
        self.call("readdir", handle.as_str(), done, |state| {
            match state.handles.get_mut(handle.as_str()) {
                Some(Handle::Dir(pages)) => {
                    let entries = pages.pop_front().unwrap_or_default();
                    Ok(DirPage {
                        entries,
                        eof: pages.is_empty(),
                    })
                }
                _ => Err(FileSystemError::remote(
                    StatusCode::Failure,
                    format!("invalid directory handle {}", handle.as_str()),
                )),
            }
        });
    }

    fn open(
        &self,
        path: &str,
        flags: OpenFlags,
        _attrs: Option<FileAttrs>,
        done: FsCallback<FileHandle>,
    ) {
        self.call("open", path, done, |state| {
            match state.entries.get_mut(path) {
                Some(Entry::Dir { .. }) => {
                    return Err(FileSystemError::remote(
                        StatusCode::Failure,
                        format!("{path}: is a directory"),
                    ));
                }
                Some(Entry::File { data, mtime }) => {
                    if flags.contains(OpenFlags::CREAT) && flags.contains(OpenFlags::EXCL) {
                        return Err(FileSystemError::remote(
                            StatusCode::Failure,
                            format!("{path}: file exists"),
                        ));
                    }
                    if flags.contains(OpenFlags::TRUNC) {
                        data.clear();
                        *mtime = now_ms();
                    }
                }
                None => {
                    let parent_is_dir =
                        matches!(state.entries.get(parent_of(path)), Some(Entry::Dir { .. }));
                    if !flags.contains(OpenFlags::CREAT) || !parent_is_dir {
                        return Err(no_such_file(path));
                    }
                    state.entries.insert(
                        path.to_string(),
                        Entry::File {
                            data: Vec::new(),
                            mtime: now_ms(),
                        },
                    );
                }
            }
            Ok(state.new_handle(Handle::File(path.to_string())))
        });
    }

    fn read(&self, handle: &FileHandle, offset: u64, len: usize, done: FsCallback<ReadData>) {
        let path = self.handle_path(handle);
        self.call("read", &path, done, |state| {
            if state.stalled_reads {
                return Ok(ReadData {
                    data: Bytes::new(),
                    eof: false,
                });
            }
            let path = state.file_path(handle)?;
            let (data, _) = state.file_mut(&path)?;
            let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
            let end = start.saturating_add(len).min(data.len());
            Ok(ReadData {
                data: Bytes::copy_from_slice(&data[start..end]),
                eof: end >= data.len(),
            })
        });
    }

    fn write(&self, handle: &FileHandle, offset: u64, bytes: Bytes, done: FsCallback<()>) {
        let path = self.handle_path(handle);
        self.call("write", &path, done, |state| {
            let path = state.file_path(handle)?;
            let (data, mtime) = state.file_mut(&path)?;
            let start = usize::try_from(offset).unwrap_or(usize::MAX);
            let end = start.saturating_add(bytes.len());
            if data.len() < end {
                data.resize(end, 0);
            }
            data[start..end].copy_from_slice(&bytes);
            *mtime = now_ms();
            Ok(())
        });
    }

    fn close(&self, handle: &FileHandle, done: FsCallback<()>) {
        let path = self.handle_path(handle);
        self.call("close", &path, done, |state| {
            state.handles.remove(handle.as_str()).map(|_| ()).ok_or_else(|| {
                FileSystemError::remote(
                    StatusCode::Failure,
                    format!("invalid handle {}", handle.as_str()),
                )
            })
        });
    }

    fn stat(&self, path: &str, done: FsCallback<FileAttrs>) {
        self.call("stat", path, done, |state| {
            state
                .entries
                .get(path)
                .map(Entry::attrs)
                .ok_or_else(|| no_such_file(path))
        });
    }

    fn fstat(&self, handle: &FileHandle, done: FsCallback<FileAttrs>) {
        let path = self.handle_path(handle);
        self.call("fstat", &path, done, |state| {
            let path = state.file_path(handle)?;
            state
                .entries
                .get(&path)
                .map(Entry::attrs)
                .ok_or_else(|| no_such_file(&path))
        });
    }

    fn setstat(&self, path: &str, attrs: FileAttrs, done: FsCallback<()>) {
        self.call("setstat", path, done, |state| state.apply_attrs(path, &attrs));
    }

    fn fsetstat(&self, handle: &FileHandle, attrs: FileAttrs, done: FsCallback<()>) {
        let path = self.handle_path(handle);
        self.call("fsetstat", &path, done, |state| {
            let path = state.file_path(handle)?;
            state.apply_attrs(&path, &attrs)
        });
    }

    fn remove(&self, path: &str, done: FsCallback<()>) {
        self.call("remove", path, done, |state| match state.entries.get(path) {
            Some(Entry::File { .. }) => {
                state.entries.remove(path);
                Ok(())
            }
            Some(Entry::Dir { .. }) => Err(FileSystemError::remote(
                StatusCode::Failure,
                format!("{path}: is a directory"),
            )),
            None => Err(no_such_file(path)),
        });
    }
}
