use std::{
    collections::BTreeMap,
    io::SeekFrom,
    sync::{atomic::AtomicU64, Arc},
};

use bitflags::bitflags;
use bytes::Bytes;
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
    sync::Mutex as AsyncMutex,
};

use super::{cache::MemChunk, error::OpError};

bitflags! {
    /// What the caller intends to do with the handle.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessMask: u32 {
        const READ_DATA = 1;
        const WRITE_DATA = 1 << 1;
        const APPEND_DATA = 1 << 2;
        const READ_ATTRIBUTES = 1 << 3;
        const EXECUTE = 1 << 4;
        const SYNCHRONIZE = 1 << 5;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ShareMode: u32 {
        const READ = 1;
        const WRITE = 1 << 1;
        const DELETE = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Open,
    OpenOrCreate,
    Create,
    CreateNew,
    Truncate,
    Append,
}

#[derive(Debug, Clone, Copy)]
pub struct CreateOptions {
    pub access: AccessMask,
    pub share: ShareMode,
    pub mode: CreateMode,
}

impl CreateOptions {
    pub fn read_only(mode: CreateMode) -> Self {
        Self {
            access: AccessMask::READ_DATA | AccessMask::SYNCHRONIZE,
            share: ShareMode::READ,
            mode,
        }
    }

    /// Creation-mode rules for an existing directory.
    pub fn check_directory(&self) -> Result<(), OpError> {
        match self.mode {
            CreateMode::Open | CreateMode::OpenOrCreate | CreateMode::Create => {}
            CreateMode::CreateNew => return Err(OpError::FileExists),
            CreateMode::Truncate | CreateMode::Append => return Err(OpError::AccessDenied),
        }
        if self.access.intersects(
            AccessMask::READ_DATA | AccessMask::WRITE_DATA | AccessMask::APPEND_DATA,
        ) {
            return Err(OpError::AccessDenied);
        }
        Ok(())
    }

    /// Creation-mode rules for an existing file.
    pub fn check_file(&self) -> Result<(), OpError> {
        match self.mode {
            CreateMode::CreateNew => Err(OpError::FileExists),
            CreateMode::Truncate | CreateMode::Append => Err(OpError::AccessDenied),
            _ => Ok(()),
        }
    }

    /// Heuristic "host wants to execute this" pattern: an execute bit,
    /// or a data read whose only companions are synchronize and
    /// read-attributes (the image loader's open).
    pub fn wants_execute(&self) -> bool {
        if self.access.contains(AccessMask::EXECUTE) {
            return true;
        }
        self.access.contains(AccessMask::READ_DATA)
            && (self.access
                - (AccessMask::READ_DATA | AccessMask::SYNCHRONIZE | AccessMask::READ_ATTRIBUTES))
                .is_empty()
    }
}

/// The per-handle payload behind the bridge's context slot.
///
/// Every file handle owns its seekable source outright; nothing here
/// keeps a reference into the shared decoder.
pub enum ByteSource {
    Mem(MemChunk),
    Disk { file: File, len: u64 },
    Exec { file: File, len: u64 },
}

impl ByteSource {
    pub fn memory(chunk: MemChunk) -> Self {
        Self::Mem(chunk)
    }
    pub fn disk(file: File, len: u64) -> Self {
        Self::Disk { file, len }
    }
    pub fn exec(file: File, len: u64) -> Self {
        Self::Exec { file, len }
    }
    pub fn len(&self) -> u64 {
        match self {
            Self::Mem(chunk) => chunk.len(),
            Self::Disk { len, .. } | Self::Exec { len, .. } => *len,
        }
    }
    /// Read up to `size` bytes at `offset`; past-the-end reads succeed
    /// with zero bytes.
    pub async fn read_at(&mut self, offset: u64, size: u32) -> std::io::Result<Bytes> {
        let len = self.len();
        if offset >= len {
            return Ok(Bytes::new());
        }
        let want = (size as u64).min(len - offset);
        match self {
            Self::Mem(chunk) => {
                let offset = offset as usize;
                Ok(chunk.data().slice(offset..offset + want as usize))
            }
            Self::Disk { file, .. } | Self::Exec { file, .. } => {
                file.seek(SeekFrom::Start(offset)).await?;
                let mut buf = Vec::with_capacity(want as usize);
                (&mut *file).take(want).read_to_end(&mut buf).await?;
                Ok(buf.into())
            }
        }
    }
}

pub enum Handle {
    Directory,
    File(ByteSource),
}

impl Handle {
    pub fn is_dir(&self) -> bool {
        matches!(self, Self::Directory)
    }
    pub async fn read(&mut self, offset: i64, size: u32) -> Result<Bytes, OpError> {
        let source = match self {
            Self::Directory => return Err(OpError::AccessDenied),
            Self::File(source) => source,
        };
        if offset < 0 {
            return Err(OpError::InvalidParameter);
        }
        Ok(source.read_at(offset as u64, size).await?)
    }
}

pub struct HandleTable {
    generator: AtomicU64,
    table: spin::Mutex<BTreeMap<u64, Arc<AsyncMutex<Handle>>>>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            generator: AtomicU64::new(1),
            table: spin::Mutex::new(BTreeMap::new()),
        }
    }
    /// Add a handle to the table
    pub fn add(&self, handle: Handle) -> u64 {
        let fh = self
            .generator
            .fetch_add(1, std::sync::atomic::Ordering::AcqRel);
        log::trace!("allocate handle: {}", fh);
        self.table.lock().insert(fh, Arc::new(AsyncMutex::new(handle)));
        fh
    }
    /// Get a handle from the table
    pub fn get(&self, fh: u64) -> Option<Arc<AsyncMutex<Handle>>> {
        self.table.lock().get(&fh).cloned()
    }
    /// Remove a handle from the table
    pub fn remove(&self, fh: u64) -> Option<Arc<AsyncMutex<Handle>>> {
        log::trace!("deallocate handle: {}", fh);
        self.table.lock().remove(&fh)
    }
}
