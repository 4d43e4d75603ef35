//! Random access sinks the build pipeline writes into.
//!
//! Workers write their reserved byte ranges concurrently through positional
//! writes, so handles never share a file cursor.

use memmap2::Mmap;
use parking_lot::RwLock;

use std::fs::{File, OpenOptions};
use std::io;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub trait WriteAt: Send + Sync {
    fn write_at(&self, buffer: &[u8], offset: u64) -> io::Result<()>;
}

pub trait ReadAt: Send + Sync {
    /// Fills `buffer` completely from `offset`, or fails with `UnexpectedEof`.
    fn read_at(&self, buffer: &mut [u8], offset: u64) -> io::Result<()>;
}

pub trait ReadWriteAt: ReadAt + WriteAt {}

impl<T: ReadAt + WriteAt> ReadWriteAt for T {}

/// Immutable bytes of a finished blob, either memory mapped or owned.
#[derive(Debug)]
pub enum Blob {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl Blob {
    pub fn map(path: &Path) -> io::Result<Blob> {
        let file = File::open(path)?;
        // Safety: blobs are immutable once built; nothing truncates the file
        // while it is mapped.
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Blob::Mapped(mmap))
    }
}

impl Deref for Blob {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        match self {
            Blob::Mapped(mmap) => mmap,
            Blob::Owned(data) => data,
        }
    }
}

impl From<Vec<u8>> for Blob {
    fn from(data: Vec<u8>) -> Self {
        Blob::Owned(data)
    }
}

/// Destination of a build, and the source it is reopened from.
pub trait Output: Send + Sync {
    /// Opens the output for writing, discarding previous contents.
    fn write(&self) -> io::Result<Box<dyn ReadWriteAt>>;
    /// Opens the output for reading and writing, keeping its contents.
    fn read_write(&self) -> io::Result<Box<dyn ReadWriteAt>>;
    fn read(&self) -> io::Result<Box<dyn ReadAt>>;
    /// Returns the complete contents, memory mapped where possible.
    fn bytes(&self) -> io::Result<Blob>;
    fn len(&self) -> io::Result<u64>;

    fn is_empty(&self) -> io::Result<bool> {
        self.len().map(|len| len == 0)
    }
}

#[derive(Debug, Clone)]
pub struct FileOutput {
    path: PathBuf,
}

impl FileOutput {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

struct FileHandle(File);

#[cfg(unix)]
impl WriteAt for FileHandle {
    fn write_at(&self, buffer: &[u8], offset: u64) -> io::Result<()> {
        std::os::unix::fs::FileExt::write_all_at(&self.0, buffer, offset)
    }
}

#[cfg(unix)]
impl ReadAt for FileHandle {
    fn read_at(&self, buffer: &mut [u8], offset: u64) -> io::Result<()> {
        std::os::unix::fs::FileExt::read_exact_at(&self.0, buffer, offset)
    }
}

#[cfg(windows)]
impl WriteAt for FileHandle {
    fn write_at(&self, mut buffer: &[u8], mut offset: u64) -> io::Result<()> {
        use std::os::windows::fs::FileExt;
        while !buffer.is_empty() {
            let n = self.0.seek_write(buffer, offset)?;
            if n == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            buffer = &buffer[n..];
            offset += n as u64;
        }
        Ok(())
    }
}

#[cfg(windows)]
impl ReadAt for FileHandle {
    fn read_at(&self, mut buffer: &mut [u8], mut offset: u64) -> io::Result<()> {
        use std::os::windows::fs::FileExt;
        while !buffer.is_empty() {
            let n = self.0.seek_read(buffer, offset)?;
            if n == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            buffer = &mut buffer[n..];
            offset += n as u64;
        }
        Ok(())
    }
}

impl Output for FileOutput {
    fn write(&self) -> io::Result<Box<dyn ReadWriteAt>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)?;
        Ok(Box::new(FileHandle(file)))
    }

    fn read_write(&self) -> io::Result<Box<dyn ReadWriteAt>> {
        let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        Ok(Box::new(FileHandle(file)))
    }

    fn read(&self) -> io::Result<Box<dyn ReadAt>> {
        Ok(Box::new(FileHandle(File::open(&self.path)?)))
    }

    fn bytes(&self) -> io::Result<Blob> {
        Blob::map(&self.path)
    }

    fn len(&self) -> io::Result<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }
}

/// In-memory output; clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemoryOutput {
    data: Arc<RwLock<Vec<u8>>>,
}

impl MemoryOutput {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.data.read().clone()
    }
}

struct MemoryHandle(Arc<RwLock<Vec<u8>>>);

impl WriteAt for MemoryHandle {
    fn write_at(&self, buffer: &[u8], offset: u64) -> io::Result<()> {
        let mut data = self.0.write();
        let end = offset as usize + buffer.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[offset as usize..end].copy_from_slice(buffer);
        Ok(())
    }
}

impl ReadAt for MemoryHandle {
    fn read_at(&self, buffer: &mut [u8], offset: u64) -> io::Result<()> {
        let data = self.0.read();
        let start = offset as usize;
        match data.get(start..start + buffer.len()) {
            Some(bytes) => {
                buffer.copy_from_slice(bytes);
                Ok(())
            }
            None => Err(io::ErrorKind::UnexpectedEof.into()),
        }
    }
}

impl Output for MemoryOutput {
    fn write(&self) -> io::Result<Box<dyn ReadWriteAt>> {
        self.data.write().clear();
        Ok(Box::new(MemoryHandle(self.data.clone())))
    }

    fn read_write(&self) -> io::Result<Box<dyn ReadWriteAt>> {
        Ok(Box::new(MemoryHandle(self.data.clone())))
    }

    fn read(&self) -> io::Result<Box<dyn ReadAt>> {
        Ok(Box::new(MemoryHandle(self.data.clone())))
    }

    fn bytes(&self) -> io::Result<Blob> {
        Ok(Blob::Owned(self.to_vec()))
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.data.read().len() as u64)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn write_and_read_back(output: &dyn Output) {
        let handle = output.write().unwrap();
        handle.write_at(b"world", 6).unwrap();
        handle.write_at(b"hello ", 0).unwrap();
        let mut buffer = [0u8; 5];
        handle.read_at(&mut buffer, 6).unwrap();
        assert_eq!(&buffer, b"world");
        drop(handle);

        assert_eq!(output.len().unwrap(), 11);
        assert_eq!(&*output.bytes().unwrap(), b"hello world");

        let reader = output.read().unwrap();
        let mut buffer = [0u8; 5];
        assert!(reader.read_at(&mut buffer, 8).is_err());

        // reopening for writing truncates
        drop(output.write().unwrap());
        assert!(output.is_empty().unwrap());
    }

    #[test]
    fn test_memory_output() {
        write_and_read_back(&MemoryOutput::new());
    }

    #[test]
    fn test_file_output() {
        let dir = tempfile::tempdir().unwrap();
        write_and_read_back(&FileOutput::new(dir.path().join("blob")));
    }
}
