use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::archive::Decoder;

use super::{
    error::OpError,
    handle::ByteSource,
    index::FileMeta,
    path::fold,
};

/// Live-memory counter for small-file buffers.
///
/// Reservation is a compare-exchange loop so the check and the add are
/// one step; the permit gives the bytes back exactly once on drop.
pub struct MemBudget {
    live: AtomicU64,
    cap: u64,
}

impl MemBudget {
    pub fn new(cap: u64) -> Arc<Self> {
        Arc::new(Self {
            live: AtomicU64::new(0),
            cap,
        })
    }
    pub fn try_reserve(self: &Arc<Self>, size: u64) -> Option<MemPermit> {
        let mut current = self.live.load(Ordering::Acquire);
        loop {
            let next = current.checked_add(size)?;
            if next > self.cap {
                return None;
            }
            match self.live.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(MemPermit {
                        budget: self.clone(),
                        size,
                    })
                }
                Err(observed) => current = observed,
            }
        }
    }
    pub fn live(&self) -> u64 {
        self.live.load(Ordering::Acquire)
    }
}

pub struct MemPermit {
    budget: Arc<MemBudget>,
    size: u64,
}

impl Drop for MemPermit {
    fn drop(&mut self) {
        self.budget.live.fetch_sub(self.size, Ordering::AcqRel);
    }
}

/// Fully decompressed small entry, accounted against the budget.
pub struct MemChunk {
    data: Bytes,
    _permit: MemPermit,
}

impl MemChunk {
    pub fn data(&self) -> &Bytes {
        &self.data
    }
    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }
}

struct DiskSlot {
    path: PathBuf,
    len: u64,
}

/// Hybrid per-entry materialization: memory below the thresholds, a
/// shared temp file otherwise.
///
/// The decoder mutex is *the* decoder lock, every call into the archive
/// decoder happens under it. The disk table has its own mutex held
/// across the whole check-then-extract sequence, so two handles racing
/// on a cold entry observe a single temp file.
pub struct EntryCache {
    decoder: Mutex<Box<dyn Decoder>>,
    disk: Mutex<HashMap<String, DiskSlot>>,
    budget: Arc<MemBudget>,
    mem_limit_per_entry: u64,
    cache_dir: PathBuf,
}

impl EntryCache {
    pub fn new(
        decoder: Box<dyn Decoder>,
        cache_dir: PathBuf,
        mem_limit_per_entry: u64,
        mem_budget_total: u64,
    ) -> Self {
        Self {
            decoder: Mutex::new(decoder),
            disk: Mutex::new(HashMap::new()),
            budget: MemBudget::new(mem_budget_total),
            mem_limit_per_entry,
            cache_dir,
        }
    }

    pub fn budget(&self) -> &Arc<MemBudget> {
        &self.budget
    }

    /// Produce a seekable byte source for one entry.
    pub async fn materialize(&self, meta: &FileMeta) -> Result<ByteSource, OpError> {
        if let Some(size) = meta.size {
            if size < self.mem_limit_per_entry {
                match self.budget.try_reserve(size) {
                    Some(permit) => return self.fill_memory(meta, size, permit).await,
                    None => {
                        log::debug!("memory budget exhausted, {} goes to disk", meta.path)
                    }
                }
            }
        }
        self.fill_disk(meta).await
    }

    /// Copy the decompressed entry into or out of the decoder on behalf
    /// of the executable redirector.
    pub(super) async fn extract_raw(&self, meta: &FileMeta, dest: &Path) -> Result<u64, OpError> {
        // FIXME: decoder copy blocks the executor, move to spawn_blocking
        let mut decoder = self.decoder.lock().await;
        Ok(decoder.extract_to(meta.decoder_index, dest)?)
    }

    async fn fill_memory(
        &self,
        meta: &FileMeta,
        size: u64,
        permit: MemPermit,
    ) -> Result<ByteSource, OpError> {
        let mut buf = Vec::with_capacity(size as usize);
        {
            let mut decoder = self.decoder.lock().await;
            decoder.copy_entry(meta.decoder_index, &mut buf)?;
        }
        if buf.len() as u64 != size {
            log::warn!(
                "{} declared {} bytes, decompressed {}",
                meta.path,
                size,
                buf.len()
            );
        }
        Ok(ByteSource::memory(MemChunk {
            data: Bytes::from(buf),
            _permit: permit,
        }))
    }

    async fn fill_disk(&self, meta: &FileMeta) -> Result<ByteSource, OpError> {
        let key = fold(meta.path.as_str());
        let mut table = self.disk.lock().await;
        if let Some(slot) = table.get(&key) {
            let file = tokio::fs::File::open(&slot.path).await?;
            return Ok(ByteSource::disk(file, slot.len));
        }

        if let Some(size) = meta.size {
            if free_space(&self.cache_dir)? < size {
                log::error!("temp drive cannot hold {} ({} bytes)", meta.path, size);
                return Err(OpError::DiskFull);
            }
        }

        let path = self.cache_dir.join(format!("{}.bin", Uuid::new_v4()));
        let len = {
            let mut decoder = self.decoder.lock().await;
            match decoder.extract_to(meta.decoder_index, &path) {
                Ok(len) => len,
                Err(err) => {
                    tokio::fs::remove_file(&path).await.ok();
                    return Err(err.into());
                }
            }
        };
        log::debug!("extracted {} to {} ({} bytes)", meta.path, path.display(), len);
        let file = tokio::fs::File::open(&path).await?;
        table.insert(key, DiskSlot { path, len });
        Ok(ByteSource::disk(file, len))
    }

    /// Delete every cached temp file and forget the table.
    pub async fn dispose(&self) {
        let mut table = self.disk.lock().await;
        for (_, slot) in table.drain() {
            if let Err(err) = tokio::fs::remove_file(&slot.path).await {
                log::warn!("leaking {}: {}", slot.path.display(), err);
            }
        }
    }
}

fn free_space(dir: &Path) -> Result<u64, OpError> {
    let stat = rustix::fs::statvfs(dir).map_err(std::io::Error::from)?;
    Ok(stat.f_bavail.saturating_mul(stat.f_frsize))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::archive::{testing::FakeDecoder, Decoder as _};
    use crate::filesystem::index::ArchiveIndex;
    use crate::filesystem::path::CanonPath;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("zipdrive-cache-{tag}-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn meta_of(index: &ArchiveIndex, path: &str) -> Arc<FileMeta> {
        match index.lookup(&CanonPath::normalize(path)).unwrap() {
            crate::filesystem::index::Node::File(meta) => meta.clone(),
            _ => panic!("{path} is a directory"),
        }
    }

    fn build(decoder: FakeDecoder) -> (ArchiveIndex, Box<dyn crate::archive::Decoder>) {
        let mut decoder = decoder;
        let entries = decoder.entries().unwrap();
        let len = decoder.archive_len();
        (ArchiveIndex::build(&entries, len), Box::new(decoder))
    }

    #[tokio::test]
    async fn small_entry_lands_in_memory() {
        let (index, decoder) = build(FakeDecoder::new().file("small.txt", b"hello world"));
        let dir = temp_dir("mem");
        let cache = EntryCache::new(decoder, dir.clone(), 1024, 4096);

        let meta = meta_of(&index, "/small.txt");
        let mut source = cache.materialize(&meta).await.unwrap();
        assert_eq!(cache.budget().live(), 11);
        assert_eq!(&source.read_at(0, 100).await.unwrap()[..], b"hello world");

        drop(source);
        assert_eq!(cache.budget().live(), 0);

        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn large_entry_lands_on_disk() {
        let (index, decoder) = build(FakeDecoder::new().file("big.bin", b"0123456789"));
        let dir = temp_dir("disk");
        let cache = EntryCache::new(decoder, dir.clone(), 4, 4096);

        let meta = meta_of(&index, "/big.bin");
        let mut source = cache.materialize(&meta).await.unwrap();
        assert_eq!(cache.budget().live(), 0);
        assert_eq!(&source.read_at(3, 4).await.unwrap()[..], b"3456");
        assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 1);

        // temp file survives the handle, dies with the cache
        drop(source);
        assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 1);
        cache.dispose().await;
        assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 0);

        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn unknown_size_goes_to_disk() {
        let (index, decoder) = build(FakeDecoder::new().file_unsized("stream.dat", b"abcdef"));
        let dir = temp_dir("unsized");
        let cache = EntryCache::new(decoder, dir.clone(), u64::MAX, u64::MAX);

        let meta = meta_of(&index, "/stream.dat");
        let mut source = cache.materialize(&meta).await.unwrap();
        assert_eq!(cache.budget().live(), 0);
        assert_eq!(&source.read_at(0, 6).await.unwrap()[..], b"abcdef");

        cache.dispose().await;
        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn budget_back_pressure() {
        let (index, decoder) = build(
            FakeDecoder::new()
                .file("a.bin", b"AAAA")
                .file("b.bin", b"BBBB")
                .file("c.bin", b"CCCC"),
        );
        let dir = temp_dir("pressure");
        // per-entry limit admits each, total only admits two
        let cache = EntryCache::new(decoder, dir.clone(), 1024, 8);

        let a = cache.materialize(&meta_of(&index, "/a.bin")).await.unwrap();
        let b = cache.materialize(&meta_of(&index, "/b.bin")).await.unwrap();
        assert_eq!(cache.budget().live(), 8);

        let mut c = cache.materialize(&meta_of(&index, "/c.bin")).await.unwrap();
        assert_eq!(cache.budget().live(), 8);
        assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 1);
        assert_eq!(&c.read_at(0, 4).await.unwrap()[..], b"CCCC");

        // closing a buffer frees budget for the next small entry
        drop(a);
        assert_eq!(cache.budget().live(), 4);
        let _again = cache.materialize(&meta_of(&index, "/a.bin")).await.unwrap();
        assert_eq!(cache.budget().live(), 8);

        drop(b);
        cache.dispose().await;
        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn disk_tier_is_a_singleton() {
        let decoder = FakeDecoder::new().file("big.bin", b"0123456789");
        let copies = decoder.copy_counter();
        let (index, decoder) = build(decoder);
        let dir = temp_dir("singleton");
        let cache = Arc::new(EntryCache::new(decoder, dir.clone(), 4, 4096));

        let meta = meta_of(&index, "/big.bin");
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let meta = meta.clone();
            tasks.push(tokio::spawn(async move {
                let mut source = cache.materialize(&meta).await.unwrap();
                assert_eq!(&source.read_at(0, 10).await.unwrap()[..], b"0123456789");
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(copies.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 1);

        cache.dispose().await;
        std::fs::remove_dir_all(dir).ok();
    }
}
