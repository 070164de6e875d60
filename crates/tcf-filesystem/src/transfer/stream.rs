//! `std::io` streams over open remote files.

use std::io::{self, Read, Write};

use bytes::Bytes;
use tcf_core::services::filesystem::{FileAttrs, FileHandle, FileSystemError, OpenFlags};

use crate::BlockingFileSystem;

/// Wrap a file system error so it can travel through `std::io`.
pub fn to_io(error: FileSystemError) -> io::Error {
    io::Error::other(error)
}

/// Recover the file system error carried by an `io::Error`, if any.
#[must_use]
pub fn from_io(error: &io::Error) -> Option<FileSystemError> {
    error
        .get_ref()
        .and_then(|e| e.downcast_ref::<FileSystemError>())
        .cloned()
}

/// Sequential reader of a remote file.
pub struct RemoteReader {
    fs: BlockingFileSystem,
    handle: FileHandle,
    offset: u64,
    eof: bool,
}

impl RemoteReader {
    /// Open `path` for reading.
    ///
    /// # Errors
    /// Returns the remote error if the file cannot be opened.
    pub fn open(fs: &BlockingFileSystem, path: &str) -> Result<Self, FileSystemError> {
        let open_path = path.to_string();
        let handle = fs.call("open", move |fs, done| {
            fs.open(&open_path, OpenFlags::READ, None, done);
        })?;
        Ok(Self {
            fs: fs.clone(),
            handle,
            offset: 0,
            eof: false,
        })
    }

    /// Attributes of the open file.
    ///
    /// # Errors
    /// Returns the remote error of `fstat`.
    pub fn attrs(&self) -> Result<FileAttrs, FileSystemError> {
        let handle = self.handle.clone();
        self.fs.call("fstat", move |fs, done| fs.fstat(&handle, done))
    }

    /// Close the remote handle.
    ///
    /// # Errors
    /// Returns the remote error of `close`.
    pub fn close(self) -> Result<(), FileSystemError> {
        close(&self.fs, self.handle)
    }
}

impl Read for RemoteReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.eof || buf.is_empty() {
            return Ok(0);
        }
        let handle = self.handle.clone();
        let (offset, len) = (self.offset, buf.len());
        let reply = self
            .fs
            .call("read", move |fs, done| fs.read(&handle, offset, len, done))
            .map_err(to_io)?;

        let n = reply.data.len().min(len);
        if n == 0 && !reply.eof {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("empty read at offset {offset} before end of file"),
            ));
        }
        buf[..n].copy_from_slice(&reply.data[..n]);
        self.offset += n as u64;
        self.eof = reply.eof;
        Ok(n)
    }
}

/// Sequential writer of a remote file.
pub struct RemoteWriter {
    fs: BlockingFileSystem,
    handle: FileHandle,
    offset: u64,
}

impl RemoteWriter {
    /// Create or truncate `path` for writing.
    ///
    /// # Errors
    /// Returns the remote error if the file cannot be opened.
    pub fn create(fs: &BlockingFileSystem, path: &str) -> Result<Self, FileSystemError> {
        let open_path = path.to_string();
        let handle = fs.call("open", move |fs, done| {
            fs.open(
                &open_path,
                OpenFlags::CREAT | OpenFlags::WRITE | OpenFlags::TRUNC,
                None,
                done,
            );
        })?;
        Ok(Self {
            fs: fs.clone(),
            handle,
            offset: 0,
        })
    }

    /// Close the remote handle.
    ///
    /// # Errors
    /// Returns the remote error of `close`.
    pub fn close(self) -> Result<(), FileSystemError> {
        close(&self.fs, self.handle)
    }
}

impl Write for RemoteWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let handle = self.handle.clone();
        let offset = self.offset;
        let data = Bytes::copy_from_slice(buf);
        self.fs
            .call("write", move |fs, done| fs.write(&handle, offset, data, done))
            .map_err(to_io)?;
        self.offset += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn close(fs: &BlockingFileSystem, handle: FileHandle) -> Result<(), FileSystemError> {
    fs.call("close", move |fs, done| fs.close(&handle, done))
}
