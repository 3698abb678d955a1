#![forbid(unsafe_code)]
//! Device abstractions for snapfs.
//!
//! Two layers:
//!
//! - [`ByteDevice`]: positioned byte I/O over a flat address space.
//! - [`BlockDevice`]: fixed-size block I/O; what the engine talks to.
//!
//! [`ByteBlockDevice`] adapts the former into the latter with strict
//! bounds checking. [`MemByteDevice`] is the in-memory device used by
//! tests throughout the workspace; it is cheaply cloneable and shares
//! its contents, so a test can hold one handle while the engine owns
//! another.

use parking_lot::Mutex;
use snapfs_error::{Result, SnapError};
use snapfs_types::{BlockNumber, BlockSize};
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::sync::Arc;

// ── Byte devices ────────────────────────────────────────────────────────────

/// Positioned byte I/O. Implementations must be safe for concurrent use.
pub trait ByteDevice: Send + Sync {
    /// Total device length in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fill `buf` from `offset`; short reads are errors.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all of `buf` at `offset`; short writes are errors.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush to stable storage.
    fn sync(&self) -> Result<()>;
}

/// A byte device backed by a file, using positioned reads and writes.
pub struct FileByteDevice {
    file: File,
    len: u64,
}

impl FileByteDevice {
    pub fn new(file: File) -> Result<Self> {
        let len = file.metadata()?.len();
        Ok(Self { file, len })
    }
}

impl ByteDevice for FileByteDevice {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(self.len, offset, buf.len())?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        check_range(self.len, offset, buf.len())?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

/// Shared in-memory byte device for tests.
#[derive(Clone)]
pub struct MemByteDevice {
    data: Arc<Mutex<Vec<u8>>>,
}

impl MemByteDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            data: Arc::new(Mutex::new(vec![0u8; len])),
        }
    }

    /// Snapshot the raw contents, for assertions.
    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl ByteDevice for MemByteDevice {
    fn len(&self) -> u64 {
        self.data.lock().len() as u64
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let data = self.data.lock();
        check_range(data.len() as u64, offset, buf.len())?;
        let start = offset as usize;
        buf.copy_from_slice(&data[start..start + buf.len()]);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut data = self.data.lock();
        check_range(data.len() as u64, offset, buf.len())?;
        let start = offset as usize;
        data[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

fn check_range(len: u64, offset: u64, count: usize) -> Result<()> {
    let end = offset
        .checked_add(count as u64)
        .ok_or_else(|| SnapError::Format(format!("byte range overflow at offset {offset}")))?;
    if end > len {
        return Err(SnapError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("access [{offset}, {end}) beyond device length {len}"),
        )));
    }
    Ok(())
}

// ── Block devices ───────────────────────────────────────────────────────────

/// An owned block's worth of bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    data: Vec<u8>,
}

impl BlockBuf {
    #[must_use]
    pub fn zeroed(block_size: BlockSize) -> Self {
        Self {
            data: vec![0u8; block_size.bytes() as usize],
        }
    }

    #[must_use]
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    #[must_use]
    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

/// Fixed-size block I/O.
pub trait BlockDevice: Send + Sync {
    fn block_size(&self) -> BlockSize;

    /// Number of whole blocks on the device.
    fn block_count(&self) -> u64;

    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf>;

    /// `buf` must be exactly one block long.
    fn write_block(&self, block: BlockNumber, buf: &[u8]) -> Result<()>;

    fn sync(&self) -> Result<()>;
}

/// Adapt a [`ByteDevice`] into a [`BlockDevice`].
pub struct ByteBlockDevice<D> {
    inner: D,
    block_size: BlockSize,
    block_count: u64,
}

impl<D: ByteDevice> ByteBlockDevice<D> {
    pub fn new(inner: D, block_size: BlockSize) -> Result<Self> {
        let block_count = inner.len() / block_size.bytes_u64();
        if block_count == 0 {
            return Err(SnapError::Format(format!(
                "device too small: {} bytes with {}-byte blocks",
                inner.len(),
                block_size.bytes()
            )));
        }
        Ok(Self {
            inner,
            block_size,
            block_count,
        })
    }

    fn offset_of(&self, block: BlockNumber) -> Result<u64> {
        if block.0 >= self.block_count {
            return Err(SnapError::Format(format!(
                "{block} beyond device end ({} blocks)",
                self.block_count
            )));
        }
        Ok(block.0 * self.block_size.bytes_u64())
    }
}

impl<D: ByteDevice> BlockDevice for ByteBlockDevice<D> {
    fn block_size(&self) -> BlockSize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        let offset = self.offset_of(block)?;
        let mut buf = BlockBuf::zeroed(self.block_size);
        self.inner.read_exact_at(offset, buf.as_mut_slice())?;
        Ok(buf)
    }

    fn write_block(&self, block: BlockNumber, buf: &[u8]) -> Result<()> {
        if buf.len() != self.block_size.bytes() as usize {
            return Err(SnapError::Format(format!(
                "write_block: buffer is {} bytes, block size is {}",
                buf.len(),
                self.block_size.bytes()
            )));
        }
        let offset = self.offset_of(block)?;
        self.inner.write_all_at(offset, buf)
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
}
