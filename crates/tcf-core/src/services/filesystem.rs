//! Remote file system service shape.

use std::{collections::HashMap, ops::BitOr, time::Duration};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Callback;

/// Name the file system service is registered under.
pub const SERVICE_NAME: &str = "FileSystem";

/// File type mask of `FileAttrs::permissions`.
pub const S_IFMT: u32 = 0o170_000;
/// Directory file type.
pub const S_IFDIR: u32 = 0o040_000;
/// Regular file type.
pub const S_IFREG: u32 = 0o100_000;

/// Flags for [`FileSystem::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OpenFlags(u32);

impl OpenFlags {
    pub const READ: Self = Self(0x01);
    pub const WRITE: Self = Self(0x02);
    pub const APPEND: Self = Self(0x04);
    pub const CREAT: Self = Self(0x08);
    pub const TRUNC: Self = Self(0x10);
    pub const EXCL: Self = Self(0x20);

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for OpenFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// File attributes. Absent fields were not reported by (or are not to be
/// changed on) the remote side.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileAttrs {
    pub size: Option<u64>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// POSIX mode bits including the `S_IFMT` file type.
    pub permissions: Option<u32>,
    /// Access time, milliseconds since the Unix epoch.
    pub atime: Option<i64>,
    /// Modification time, milliseconds since the Unix epoch.
    pub mtime: Option<i64>,
    /// Agent specific attributes, e.g. `Win32Attrs`.
    #[serde(default)]
    pub attributes: HashMap<String, Value>,
}

impl FileAttrs {
    /// Attributes of a directory.
    #[must_use]
    pub fn directory() -> Self {
        Self {
            permissions: Some(S_IFDIR | 0o755),
            ..Self::default()
        }
    }

    /// Attributes of a regular file.
    #[must_use]
    pub fn file(size: u64, mtime: i64) -> Self {
        Self {
            size: Some(size),
            permissions: Some(S_IFREG | 0o644),
            mtime: Some(mtime),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_directory(&self) -> bool {
        self.permissions.is_some_and(|p| p & S_IFMT == S_IFDIR)
    }

    #[must_use]
    pub fn is_file(&self) -> bool {
        self.permissions.is_some_and(|p| p & S_IFMT == S_IFREG)
    }
}

/// One directory entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirEntry {
    pub filename: String,
    pub attrs: FileAttrs,
}

impl DirEntry {
    #[must_use]
    pub fn new(filename: impl Into<String>, attrs: FileAttrs) -> Self {
        Self {
            filename: filename.into(),
            attrs,
        }
    }
}

/// One page of a directory listing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DirPage {
    pub entries: Vec<DirEntry>,
    /// No further pages follow.
    pub eof: bool,
}

/// Data returned by [`FileSystem::read`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadData {
    pub data: Bytes,
    /// The end of the file has been reached.
    pub eof: bool,
}

/// Opaque handle of an open file or directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileHandle(String);

impl FileHandle {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Status codes reported by the remote file system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    Eof,
    NoSuchFile,
    PermissionDenied,
    Failure,
    BadMessage,
    NoConnection,
    ConnectionLost,
    OpUnsupported,
}

/// File system error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FileSystemError {
    #[error("{message} ({code:?})")]
    Remote { code: StatusCode, message: String },
    #[error("Local error: {0}")]
    Local(String),
    #[error("Timed out after {0:?} waiting for file system reply")]
    Timeout(Duration),
}

impl FileSystemError {
    #[must_use]
    pub fn remote(code: StatusCode, message: impl Into<String>) -> Self {
        Self::Remote {
            code,
            message: message.into(),
        }
    }

    /// Remote status code, if the error came from the remote side.
    #[must_use]
    pub const fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Remote { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Completion callback of a file system call.
pub type FsCallback<T> = Callback<T, FileSystemError>;

/// Asynchronous remote file system service.
///
/// Methods must be called on the dispatch thread; each `done` is invoked
/// there exactly once.
pub trait FileSystem: Send + Sync {
    /// List the file system roots.
    fn roots(&self, done: FsCallback<Vec<DirEntry>>);

    fn opendir(&self, path: &str, done: FsCallback<FileHandle>);

    /// Read the next page of an open directory.
    fn readdir(&self, handle: &FileHandle, done: FsCallback<DirPage>);

    fn open(
        &self,
        path: &str,
        flags: OpenFlags,
        attrs: Option<FileAttrs>,
        done: FsCallback<FileHandle>,
    );

    /// Read up to `len` bytes at `offset`.
    fn read(&self, handle: &FileHandle, offset: u64, len: usize, done: FsCallback<ReadData>);

    fn write(&self, handle: &FileHandle, offset: u64, data: Bytes, done: FsCallback<()>);

    fn close(&self, handle: &FileHandle, done: FsCallback<()>);

    fn stat(&self, path: &str, done: FsCallback<FileAttrs>);

    fn fstat(&self, handle: &FileHandle, done: FsCallback<FileAttrs>);

    /// Apply the present fields of `attrs` to `path`.
    fn setstat(&self, path: &str, attrs: FileAttrs, done: FsCallback<()>);

    fn fsetstat(&self, handle: &FileHandle, attrs: FileAttrs, done: FsCallback<()>);

    fn remove(&self, path: &str, done: FsCallback<()>);
}
