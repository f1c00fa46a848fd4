use bitflags::bitflags;
use bytes::Bytes;

use super::{
    cache::EntryCache,
    error::OpError,
    exec::{is_executable_name, ExecCache},
    handle::{CreateOptions, Handle, HandleTable},
    index::{Ino, Node},
    path::CanonPath,
    view::{FileInfo, FreeSpace, NamespaceView, VolumeInfo},
};

/// standard path limit in characters
pub const MAX_PATH: usize = 260;
/// limit with the extended-length marker
pub const MAX_EXTENDED_PATH: usize = 32767;

const EXTENDED_PREFIX: &str = r"\\?\";

/// "everyone" in the host's access-control model
pub const WORLD_SID: &str = "S-1-1-0";

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessRights: u32 {
        const READ = 1;
        const EXECUTE = 1 << 1;
        const READ_AND_EXECUTE = Self::READ.bits() | Self::EXECUTE.bits();
    }
}

#[derive(Debug, Clone)]
pub struct AccessRule {
    pub sid: &'static str,
    pub rights: AccessRights,
}

/// Returned verbatim from `get_security` for every path.
#[derive(Debug, Clone)]
pub struct SecurityDescriptor {
    pub owner: &'static str,
    pub group: &'static str,
    pub access: Vec<AccessRule>,
}

impl SecurityDescriptor {
    fn world_read_execute() -> Self {
        Self {
            owner: WORLD_SID,
            group: WORLD_SID,
            access: vec![AccessRule {
                sid: WORLD_SID,
                rights: AccessRights::READ_AND_EXECUTE,
            }],
        }
    }
}

/// The operation surface consumed by the kernel bridge.
///
/// Maps each callback onto the index, the view, the caches and the
/// handle table, and hands back a status. No business logic lives in
/// the bridge adapter, and nothing below this layer ever sees a raw,
/// unvalidated path.
pub struct Dispatcher {
    view: NamespaceView,
    cache: EntryCache,
    exec: ExecCache,
    handles: HandleTable,
}

impl Dispatcher {
    pub fn new(view: NamespaceView, cache: EntryCache, exec: ExecCache) -> Self {
        Self {
            view,
            cache,
            exec,
            handles: HandleTable::new(),
        }
    }

    pub fn view(&self) -> &NamespaceView {
        &self.view
    }

    fn validate(&self, raw: &str) -> Result<CanonPath, OpError> {
        let (body, limit) = match raw.strip_prefix(EXTENDED_PREFIX) {
            Some(body) => (body, MAX_EXTENDED_PATH),
            None => (raw, MAX_PATH),
        };
        if raw.chars().count() > limit {
            log::warn!("path too long ({} chars, limit {})", raw.chars().count(), limit);
            return Err(OpError::PathTooLong);
        }
        Ok(CanonPath::normalize(body))
    }

    /// Open a handle on `raw`, attaching a byte source for files.
    pub async fn create(&self, raw: &str, opts: CreateOptions) -> Result<u64, OpError> {
        let path = self.validate(raw)?;
        let meta = match self.view.index().lookup(&path) {
            None => return Err(OpError::PathNotFound),
            Some(Node::Directory { .. }) => {
                opts.check_directory()?;
                return Ok(self.handles.add(Handle::Directory));
            }
            Some(Node::File(meta)) => {
                opts.check_file()?;
                meta.clone()
            }
        };
        let source = if opts.wants_execute()
            && is_executable_name(path.file_name().unwrap_or_default())
        {
            self.exec.materialize(&self.cache, &meta).await?
        } else {
            self.cache.materialize(&meta).await?
        };
        Ok(self.handles.add(Handle::File(source)))
    }

    pub async fn read(&self, fh: u64, offset: i64, size: u32) -> Result<Bytes, OpError> {
        let handle = self.handles.get(fh).ok_or(OpError::HandleNotFound)?;
        let mut handle = handle.lock().await;
        handle.read(offset, size).await
    }

    /// Last kernel reference to the name went away. Deliberately keeps
    /// the byte source: some bridges deliver a read between cleanup and
    /// close, releasing here turns those into dead-context failures.
    pub fn cleanup(&self, fh: u64) {
        log::trace!("cleanup handle: {}", fh);
    }

    pub fn close(&self, fh: u64) {
        self.handles.remove(fh);
    }

    pub fn get_info(&self, raw: &str) -> Result<FileInfo, OpError> {
        let path = self.validate(raw)?;
        self.view.get_info(&path)
    }

    pub fn list(&self, raw: &str) -> Result<Vec<(Ino, FileInfo)>, OpError> {
        let path = self.validate(raw)?;
        self.view.list(&path)
    }

    pub fn list_pattern(&self, raw: &str, pattern: &str) -> Result<Vec<(Ino, FileInfo)>, OpError> {
        let path = self.validate(raw)?;
        self.view.list_pattern(&path, pattern)
    }

    pub fn volume_info(&self) -> VolumeInfo {
        self.view.volume_info()
    }

    pub fn free_space(&self) -> FreeSpace {
        self.view.free_space()
    }

    pub fn get_security(&self, raw: &str) -> Result<SecurityDescriptor, OpError> {
        let path = self.validate(raw)?;
        self.view.get_info(&path)?;
        Ok(SecurityDescriptor::world_read_execute())
    }

    // The whole mutating surface. Each callback exists so the bridge
    // has something to call, and each one answers access-denied.
    pub fn write(&self, _fh: u64, _offset: i64, _data: &[u8]) -> Result<u32, OpError> {
        Err(OpError::AccessDenied)
    }
    pub fn flush_buffers(&self, _fh: u64) -> Result<(), OpError> {
        Err(OpError::AccessDenied)
    }
    pub fn set_attributes(&self, _raw: &str) -> Result<(), OpError> {
        Err(OpError::AccessDenied)
    }
    pub fn set_time(&self, _raw: &str) -> Result<(), OpError> {
        Err(OpError::AccessDenied)
    }
    pub fn delete_file(&self, _raw: &str) -> Result<(), OpError> {
        Err(OpError::AccessDenied)
    }
    pub fn delete_directory(&self, _raw: &str) -> Result<(), OpError> {
        Err(OpError::AccessDenied)
    }
    pub fn move_entry(&self, _from: &str, _to: &str) -> Result<(), OpError> {
        Err(OpError::AccessDenied)
    }
    pub fn set_length(&self, _fh: u64, _len: u64) -> Result<(), OpError> {
        Err(OpError::AccessDenied)
    }
    pub fn set_allocation(&self, _fh: u64, _len: u64) -> Result<(), OpError> {
        Err(OpError::AccessDenied)
    }
    pub fn set_security(&self, _raw: &str) -> Result<(), OpError> {
        Err(OpError::AccessDenied)
    }
    /// byte-range locks succeed trivially, there are no semantics behind
    /// them
    pub fn lock(&self, _fh: u64, _offset: u64, _len: u64) -> Result<(), OpError> {
        Ok(())
    }
    pub fn unlock(&self, _fh: u64, _offset: u64, _len: u64) -> Result<(), OpError> {
        Ok(())
    }
    pub fn find_streams(&self, _raw: &str) -> Result<(), OpError> {
        Err(OpError::Unimplemented)
    }

    // Inode-addressed support for the bridge adapter; paths still flow
    // through validation.

    pub fn path_by_ino(&self, ino: Ino) -> Result<String, OpError> {
        Ok(self
            .view
            .index()
            .path_of(ino)
            .ok_or(OpError::PathNotFound)?
            .as_str()
            .to_string())
    }

    pub fn resolve_child(&self, parent: Ino, name: &str) -> Result<(Ino, FileInfo), OpError> {
        let parent_path = self
            .view
            .index()
            .path_of(parent)
            .ok_or(OpError::PathNotFound)?;
        let path = self.validate(&format!("{}/{}", parent_path, name))?;
        let ino = self.view.index().get(&path).ok_or(OpError::PathNotFound)?;
        let info = self.view.info_of(ino).ok_or(OpError::PathNotFound)?;
        Ok((ino, info))
    }

    pub fn info_by_ino(&self, ino: Ino) -> Result<FileInfo, OpError> {
        self.view.info_of(ino).ok_or(OpError::PathNotFound)
    }

    pub fn list_by_ino(&self, ino: Ino) -> Result<Vec<(Ino, FileInfo)>, OpError> {
        self.view.list_ino(ino)
    }

    pub fn parent_of(&self, ino: Ino) -> Ino {
        self.view
            .index()
            .parent_of(ino)
            .unwrap_or_else(super::index::ArchiveIndex::root)
    }

    pub fn is_directory_ino(&self, ino: Ino) -> Result<bool, OpError> {
        Ok(self
            .view
            .index()
            .node(ino)
            .ok_or(OpError::PathNotFound)?
            .is_dir())
    }

    /// Drop every cached temp resource. Called once at unmount.
    pub async fn dispose(&self) {
        self.cache.dispose().await;
        self.exec.dispose().await;
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::path::PathBuf;
    use std::sync::Arc;

    use uuid::Uuid;

    use super::*;
    use crate::archive::{testing::FakeDecoder, Decoder as _};
    use crate::filesystem::index::ArchiveIndex;

    pub struct Fixture {
        pub dispatcher: Dispatcher,
        pub base: PathBuf,
    }

    impl Fixture {
        pub fn new(decoder: FakeDecoder) -> Self {
            Self::with_budget(decoder, 1024 * 1024, 16 * 1024 * 1024)
        }
        pub fn with_budget(
            mut decoder: FakeDecoder,
            mem_limit_per_entry: u64,
            mem_budget_total: u64,
        ) -> Self {
            let base =
                std::env::temp_dir().join(format!("zipdrive-dispatch-{}", Uuid::new_v4()));
            let exec_dir = base.join("Executables");
            std::fs::create_dir_all(&exec_dir).unwrap();

            let entries = decoder.entries().unwrap();
            let index = Arc::new(ArchiveIndex::build(&entries, decoder.archive_len()));
            let cache = EntryCache::new(
                Box::new(decoder),
                base.clone(),
                mem_limit_per_entry,
                mem_budget_total,
            );
            let dispatcher = Dispatcher::new(
                NamespaceView::new(index),
                cache,
                ExecCache::new(exec_dir),
            );
            Self { dispatcher, base }
        }
        pub async fn teardown(self) {
            self.dispatcher.dispose().await;
            std::fs::remove_dir_all(self.base).ok();
        }
    }
}

#[cfg(test)]
mod test {
    use super::testing::Fixture;
    use super::*;
    use crate::archive::testing::FakeDecoder;
    use crate::filesystem::handle::{AccessMask, CreateMode, ShareMode};

    fn read_opts() -> CreateOptions {
        CreateOptions::read_only(CreateMode::Open)
    }

    #[tokio::test]
    async fn read_round_trip() {
        let fixture = Fixture::new(FakeDecoder::new().file("readme.txt", b"Hello, world!"));
        let dispatcher = &fixture.dispatcher;

        let fh = dispatcher.create("/readme.txt", read_opts()).await.unwrap();
        assert_eq!(
            &dispatcher.read(fh, 0, 100).await.unwrap()[..],
            b"Hello, world!"
        );
        assert_eq!(&dispatcher.read(fh, 7, 100).await.unwrap()[..], b"world!");
        assert_eq!(&dispatcher.read(fh, 7, 3).await.unwrap()[..], b"wor");
        assert_eq!(dispatcher.read(fh, 13, 10).await.unwrap().len(), 0);
        assert_eq!(dispatcher.read(fh, 400, 10).await.unwrap().len(), 0);
        assert!(matches!(
            dispatcher.read(fh, -1, 10).await,
            Err(OpError::InvalidParameter)
        ));

        dispatcher.close(fh);
        fixture.teardown().await;
    }

    #[tokio::test]
    async fn cleanup_keeps_the_source_alive() {
        let fixture = Fixture::new(FakeDecoder::new().file("readme.txt", b"Hello, world!"));
        let dispatcher = &fixture.dispatcher;

        let fh = dispatcher.create("/readme.txt", read_opts()).await.unwrap();
        dispatcher.cleanup(fh);
        // a read between cleanup and close must still succeed
        assert_eq!(
            &dispatcher.read(fh, 0, 5).await.unwrap()[..],
            b"Hello"
        );
        dispatcher.close(fh);
        assert!(matches!(
            dispatcher.read(fh, 0, 5).await,
            Err(OpError::HandleNotFound)
        ));

        fixture.teardown().await;
    }

    #[tokio::test]
    async fn open_missing_and_directories() {
        let fixture = Fixture::new(FakeDecoder::new().file("a/b/c.dat", b"0123456789"));
        let dispatcher = &fixture.dispatcher;

        assert!(matches!(
            dispatcher.create("/missing.txt", read_opts()).await,
            Err(OpError::PathNotFound)
        ));

        let dir_opts = CreateOptions {
            access: AccessMask::READ_ATTRIBUTES | AccessMask::SYNCHRONIZE,
            share: ShareMode::READ,
            mode: CreateMode::Open,
        };
        let fh = dispatcher.create("/a/b", dir_opts).await.unwrap();
        assert!(matches!(
            dispatcher.read(fh, 0, 4).await,
            Err(OpError::AccessDenied)
        ));
        dispatcher.close(fh);

        let mut exists = dir_opts;
        exists.mode = CreateMode::CreateNew;
        assert!(matches!(
            dispatcher.create("/a/b", exists).await,
            Err(OpError::FileExists)
        ));

        fixture.teardown().await;
    }

    #[tokio::test]
    async fn mutating_surface_denies() {
        let fixture = Fixture::new(FakeDecoder::new().file("readme.txt", b"x"));
        let dispatcher = &fixture.dispatcher;

        assert!(matches!(
            dispatcher.write(1, 0, b"data"),
            Err(OpError::AccessDenied)
        ));
        assert!(matches!(dispatcher.flush_buffers(1), Err(OpError::AccessDenied)));
        assert!(matches!(
            dispatcher.set_attributes("/readme.txt"),
            Err(OpError::AccessDenied)
        ));
        assert!(matches!(
            dispatcher.set_time("/readme.txt"),
            Err(OpError::AccessDenied)
        ));
        assert!(matches!(
            dispatcher.delete_file("/readme.txt"),
            Err(OpError::AccessDenied)
        ));
        assert!(matches!(
            dispatcher.delete_directory("/a"),
            Err(OpError::AccessDenied)
        ));
        assert!(matches!(
            dispatcher.move_entry("/readme.txt", "/elsewhere.txt"),
            Err(OpError::AccessDenied)
        ));
        assert!(matches!(dispatcher.set_length(1, 0), Err(OpError::AccessDenied)));
        assert!(matches!(
            dispatcher.set_allocation(1, 0),
            Err(OpError::AccessDenied)
        ));
        assert!(matches!(
            dispatcher.set_security("/readme.txt"),
            Err(OpError::AccessDenied)
        ));
        assert!(dispatcher.lock(1, 0, 10).is_ok());
        assert!(dispatcher.unlock(1, 0, 10).is_ok());
        assert!(matches!(
            dispatcher.find_streams("/readme.txt"),
            Err(OpError::Unimplemented)
        ));

        fixture.teardown().await;
    }

    #[tokio::test]
    async fn path_length_limits() {
        let fixture = Fixture::new(FakeDecoder::new().file("readme.txt", b"x"));
        let dispatcher = &fixture.dispatcher;

        let long = format!("/{}", "a".repeat(400));
        assert!(matches!(
            dispatcher.get_info(&long),
            Err(OpError::PathTooLong)
        ));
        // the extended-length marker lifts the limit
        let extended = format!(r"\\?\{}", long);
        assert!(matches!(
            dispatcher.get_info(&extended),
            Err(OpError::PathNotFound)
        ));
        let huge = format!(r"\\?\/{}", "a".repeat(40000));
        assert!(matches!(
            dispatcher.get_info(&huge),
            Err(OpError::PathTooLong)
        ));

        fixture.teardown().await;
    }

    #[tokio::test]
    async fn security_descriptor() {
        let fixture = Fixture::new(FakeDecoder::new().file("readme.txt", b"x"));
        let dispatcher = &fixture.dispatcher;

        let descriptor = dispatcher.get_security("/readme.txt").unwrap();
        assert_eq!(descriptor.owner, WORLD_SID);
        assert_eq!(descriptor.group, WORLD_SID);
        assert_eq!(descriptor.access.len(), 1);
        assert_eq!(descriptor.access[0].rights, AccessRights::READ_AND_EXECUTE);
        assert!(matches!(
            dispatcher.get_security("/missing"),
            Err(OpError::PathNotFound)
        ));

        fixture.teardown().await;
    }

    #[tokio::test]
    async fn execute_intent_goes_through_the_redirector() {
        let fixture = Fixture::new(FakeDecoder::new().file("tools/run.sh", b"#!/bin/sh\n"));
        let dispatcher = &fixture.dispatcher;

        let fh = dispatcher.create("/tools/run.sh", read_opts()).await.unwrap();
        assert_eq!(
            &dispatcher.read(fh, 0, 100).await.unwrap()[..],
            b"#!/bin/sh\n"
        );
        let extracted = std::fs::read_dir(fixture.base.join("Executables"))
            .unwrap()
            .count();
        assert_eq!(extracted, 1);
        dispatcher.close(fh);

        fixture.teardown().await;
    }

    #[tokio::test]
    async fn zip_archive_end_to_end() {
        use crate::archive::{Decoder as _, ZipDecoder};
        use crate::filesystem::index::ArchiveIndex;
        use std::sync::Arc;

        let cursor = crate::archive::zip_fixture::build(&[
            ("readme.txt", b"Hello, world!"),
            ("a/b/c.dat", b"0123456789"),
        ]);
        let len = cursor.get_ref().len() as u64;
        let mut decoder = ZipDecoder::from_reader(cursor, len, None).unwrap();
        let entries = decoder.entries().unwrap();

        let base = std::env::temp_dir()
            .join(format!("zipdrive-e2e-{}", uuid::Uuid::new_v4()));
        let exec_dir = base.join("Executables");
        std::fs::create_dir_all(&exec_dir).unwrap();

        let index = Arc::new(ArchiveIndex::build(&entries, len));
        let dispatcher = Dispatcher::new(
            NamespaceView::new(index),
            EntryCache::new(
                Box::new(decoder),
                base.clone(),
                512 * 1024 * 1024,
                1024 * 1024 * 1024,
            ),
            ExecCache::new(exec_dir),
        );

        let names: Vec<_> = dispatcher
            .list("/")
            .unwrap()
            .into_iter()
            .map(|(_, info)| info.name)
            .collect();
        assert_eq!(names, vec!["a", "readme.txt"]);

        let info = dispatcher.get_info("/readme.txt").unwrap();
        assert_eq!(info.size, 13);

        let fh = dispatcher
            .create("/readme.txt", CreateOptions::read_only(CreateMode::Open))
            .await
            .unwrap();
        assert_eq!(
            &dispatcher.read(fh, 0, 100).await.unwrap()[..],
            b"Hello, world!"
        );
        assert_eq!(&dispatcher.read(fh, 7, 100).await.unwrap()[..], b"world!");
        dispatcher.close(fh);

        let fh = dispatcher
            .create("/a/b/c.dat", CreateOptions::read_only(CreateMode::Open))
            .await
            .unwrap();
        assert_eq!(&dispatcher.read(fh, 3, 4).await.unwrap()[..], b"3456");
        dispatcher.close(fh);

        dispatcher.dispose().await;
        std::fs::remove_dir_all(base).ok();
    }

    #[tokio::test]
    async fn case_insensitive_info() {
        let fixture = Fixture::new(FakeDecoder::new().file("Dir/File.txt", b"data"));
        let dispatcher = &fixture.dispatcher;

        let lower = dispatcher.get_info("/dir/file.TXT").unwrap();
        let exact = dispatcher.get_info("/Dir/File.txt").unwrap();
        assert_eq!(lower.size, exact.size);
        assert_eq!(lower.name, exact.name);

        fixture.teardown().await;
    }
}
