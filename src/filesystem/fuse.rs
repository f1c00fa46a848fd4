use std::{ffi::OsStr, num::NonZeroU32, path::Path, sync::Arc};

use futures_core::Future;
use fuse3::{
    raw::{reply::*, *},
    Result as FuseResult, *,
};

use super::{
    dispatcher::Dispatcher,
    error::OpError,
    handle::{AccessMask, CreateMode, CreateOptions, ShareMode},
    reply::*,
    view::FILESYSTEM_NAME,
};

/// A asynchorized stream from vector
type VecStream<I> = tokio_stream::Iter<std::vec::IntoIter<I>>;

/// Maps kernel requests onto the dispatcher surface. An adapter only:
/// inodes become validated paths, open flags become create options,
/// statuses become errnos. No business logic lives here.
pub struct Filesystem {
    dispatcher: Arc<Dispatcher>,
}

impl Filesystem {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Mount the filesystem to a path,
    /// return a raw handle from `libfuse`
    pub async fn raw_mount_with_path(
        self,
        path: impl AsRef<Path>,
    ) -> std::io::Result<MountHandle> {
        let uid = unsafe { libc::getuid() };
        let gid = unsafe { libc::getgid() };

        let mut mount_options = MountOptions::default();
        mount_options
            .uid(uid)
            .gid(gid)
            .fs_name(FILESYSTEM_NAME)
            .read_only(true)
            .force_readdir_plus(true);

        Session::new(mount_options)
            .mount_with_unprivileged(self, path.as_ref())
            .await
    }

    fn name_str(name: &OsStr) -> FuseResult<&str> {
        name.to_str()
            .ok_or_else(|| Errno::from(OpError::InvalidParameter))
    }

    /// Derive create options from the kernel's open flags.
    fn create_options(flags: u32) -> CreateOptions {
        let flags = flags as i32;
        let mode = if flags & libc::O_CREAT != 0 && flags & libc::O_EXCL != 0 {
            CreateMode::CreateNew
        } else if flags & libc::O_TRUNC != 0 {
            CreateMode::Truncate
        } else if flags & libc::O_APPEND != 0 {
            CreateMode::Append
        } else if flags & libc::O_CREAT != 0 {
            CreateMode::OpenOrCreate
        } else {
            CreateMode::Open
        };
        let mut access = AccessMask::READ_ATTRIBUTES | AccessMask::SYNCHRONIZE;
        match flags & libc::O_ACCMODE {
            libc::O_WRONLY => access |= AccessMask::WRITE_DATA,
            libc::O_RDWR => access |= AccessMask::READ_DATA | AccessMask::WRITE_DATA,
            _ => access |= AccessMask::READ_DATA,
        }
        if flags & libc::O_APPEND != 0 {
            access |= AccessMask::APPEND_DATA;
        }
        CreateOptions {
            access,
            share: ShareMode::READ,
            mode,
        }
    }

    fn directory_options() -> CreateOptions {
        CreateOptions {
            access: AccessMask::READ_ATTRIBUTES | AccessMask::SYNCHRONIZE,
            share: ShareMode::READ,
            mode: CreateMode::Open,
        }
    }
}

impl fuse3::raw::Filesystem for Filesystem {
    type DirEntryStream<'a>=VecStream<FuseResult<DirectoryEntry>> where Self: 'a;
    type DirEntryPlusStream<'a>=VecStream<FuseResult<DirectoryEntryPlus>> where Self: 'a;

    fn init(&self, _: Request) -> impl Future<Output = FuseResult<ReplyInit>> + Send {
        async {
            Ok(ReplyInit {
                max_write: NonZeroU32::new(BLOCKSIZE).unwrap(),
            })
        }
    }

    fn destroy(&self, _: Request) -> impl Future<Output = ()> + Send {
        async {}
    }

    fn lookup(
        &self,
        req: Request,
        parent: u64,
        name: &OsStr,
    ) -> impl Future<Output = FuseResult<ReplyEntry>> + Send {
        async move {
            let name = Self::name_str(name)?;
            let (ino, info) = self.dispatcher.resolve_child(parent, name)?;
            Ok(reply_entry(&req, &info, ino))
        }
    }

    fn forget(&self, _: Request, _: u64, _: u64) -> impl Future<Output = ()> + Send {
        async {}
    }

    fn getattr(
        &self,
        req: Request,
        inode: u64,
        _: Option<u64>,
        _: u32,
    ) -> impl Future<Output = FuseResult<ReplyAttr>> + Send {
        async move {
            let path = self.dispatcher.path_by_ino(inode)?;
            let info = self.dispatcher.get_info(&path)?;
            Ok(reply_attr(&req, &info, inode))
        }
    }

    fn setattr(
        &self,
        _: Request,
        inode: Inode,
        fh: Option<u64>,
        set_attr: SetAttr,
    ) -> impl Future<Output = FuseResult<ReplyAttr>> + Send {
        async move {
            let path = self.dispatcher.path_by_ino(inode)?;
            if let (Some(fh), Some(size)) = (fh, set_attr.size) {
                self.dispatcher.set_length(fh, size)?;
            }
            if set_attr.mode.is_some() || set_attr.uid.is_some() || set_attr.gid.is_some() {
                self.dispatcher.set_security(&path)?;
            }
            if set_attr.atime.is_some() || set_attr.mtime.is_some() {
                self.dispatcher.set_time(&path)?;
            }
            self.dispatcher.set_attributes(&path)?;
            Err(OpError::AccessDenied.into())
        }
    }

    fn open(
        &self,
        _: Request,
        inode: u64,
        flags: u32,
    ) -> impl Future<Output = FuseResult<ReplyOpen>> + Send {
        async move {
            if self.dispatcher.is_directory_ino(inode)? {
                return Err(Errno::from(OpError::IsDirectory));
            }
            let path = self.dispatcher.path_by_ino(inode)?;
            let fh = self
                .dispatcher
                .create(&path, Self::create_options(flags))
                .await?;
            Ok(ReplyOpen { fh, flags })
        }
    }

    fn read(
        &self,
        _: Request,
        _: u64,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> impl Future<Output = FuseResult<ReplyData>> + Send {
        async move {
            let offset =
                i64::try_from(offset).map_err(|_| Errno::from(OpError::InvalidParameter))?;
            let data = self.dispatcher.read(fh, offset, size).await?;
            Ok(ReplyData { data })
        }
    }

    fn write(
        &self,
        _: Request,
        _: u64,
        fh: u64,
        offset: u64,
        data: &[u8],
        _: u32,
        _: u32,
    ) -> impl Future<Output = FuseResult<ReplyWrite>> + Send {
        async move {
            let written = self.dispatcher.write(fh, offset as i64, data)?;
            Ok(ReplyWrite { written })
        }
    }

    /// last reference to the name went away, the byte source stays
    /// until release
    fn flush(
        &self,
        _: Request,
        _: Inode,
        fh: u64,
        _: u64,
    ) -> impl Future<Output = FuseResult<()>> + Send {
        async move {
            self.dispatcher.cleanup(fh);
            Ok(())
        }
    }

    fn release(
        &self,
        _: Request,
        _: u64,
        fh: u64,
        _: u32,
        _: u64,
        _: bool,
    ) -> impl Future<Output = FuseResult<()>> + Send {
        async move {
            self.dispatcher.close(fh);
            Ok(())
        }
    }

    fn opendir(
        &self,
        _: Request,
        inode: u64,
        flags: u32,
    ) -> impl Future<Output = FuseResult<ReplyOpen>> + Send {
        async move {
            if !self.dispatcher.is_directory_ino(inode)? {
                return Err(Errno::from(OpError::NotDirectory));
            }
            let path = self.dispatcher.path_by_ino(inode)?;
            let fh = self
                .dispatcher
                .create(&path, Self::directory_options())
                .await?;
            Ok(ReplyOpen { fh, flags })
        }
    }

    fn readdir<'a>(
        &'a self,
        _: Request,
        parent: u64,
        _: u64,
        offset: i64,
    ) -> impl Future<Output = FuseResult<ReplyDirectory<Self::DirEntryStream<'a>>>> + Send {
        async move {
            let this = self.dispatcher.info_by_ino(parent)?;
            let up = self.dispatcher.parent_of(parent);
            let up_info = self.dispatcher.info_by_ino(up)?;
            let children = self.dispatcher.list_by_ino(parent)?;

            let entries = std::iter::once(dir_entry(".".into(), &this, parent, 1))
                .chain(std::iter::once(dir_entry("..".into(), &up_info, up, 2)))
                .chain(
                    children
                        .into_iter()
                        .enumerate()
                        .map(|(i, (ino, info))| {
                            dir_entry(info.name.clone().into(), &info, ino, (i + 3) as i64)
                        }),
                )
                .map(Ok)
                .skip(offset as usize)
                .collect::<Vec<_>>();

            Ok(ReplyDirectory {
                entries: tokio_stream::iter(entries),
            })
        }
    }

    fn readdirplus<'a>(
        &'a self,
        req: Request,
        parent: u64,
        _: u64,
        offset: u64,
        _: u64,
    ) -> impl Future<Output = FuseResult<ReplyDirectoryPlus<Self::DirEntryPlusStream<'a>>>> + Send
    {
        async move {
            let this = self.dispatcher.info_by_ino(parent)?;
            let up = self.dispatcher.parent_of(parent);
            let up_info = self.dispatcher.info_by_ino(up)?;
            let children = self.dispatcher.list_by_ino(parent)?;

            let entries = std::iter::once(dir_entry_plus(&req, ".".into(), &this, parent, 1))
                .chain(std::iter::once(dir_entry_plus(
                    &req,
                    "..".into(),
                    &up_info,
                    up,
                    2,
                )))
                .chain(children.into_iter().enumerate().map(|(i, (ino, info))| {
                    dir_entry_plus(&req, info.name.clone().into(), &info, ino, (i + 3) as i64)
                }))
                .map(Ok)
                .skip(offset as usize)
                .collect::<Vec<_>>();

            Ok(ReplyDirectoryPlus {
                entries: tokio_stream::iter(entries),
            })
        }
    }

    fn releasedir(
        &self,
        _: Request,
        _: u64,
        fh: u64,
        _: u32,
    ) -> impl Future<Output = FuseResult<()>> + Send {
        async move {
            self.dispatcher.close(fh);
            Ok(())
        }
    }

    fn statfs(
        &self,
        _: Request,
        _: u64,
    ) -> impl Future<Output = FuseResult<ReplyStatFs>> + Send {
        async {
            let space = self.dispatcher.free_space();
            let volume = self.dispatcher.volume_info();
            Ok(ReplyStatFs {
                blocks: space.total.div_ceil(BLOCKSIZE as u64),
                bfree: 0,
                bavail: 0,
                files: self.dispatcher.view().index().node_count() as u64,
                ffree: 0,
                bsize: BLOCKSIZE,
                namelen: volume.max_component_length,
                frsize: BLOCKSIZE,
            })
        }
    }

    fn access(
        &self,
        _: Request,
        inode: u64,
        _: u32,
    ) -> impl Future<Output = FuseResult<()>> + Send {
        async move {
            // the descriptor grants everyone read and execute
            let path = self.dispatcher.path_by_ino(inode)?;
            self.dispatcher.get_security(&path)?;
            Ok(())
        }
    }

    fn fsync(
        &self,
        _: Request,
        _: u64,
        fh: u64,
        _: bool,
    ) -> impl Future<Output = FuseResult<()>> + Send {
        async move {
            self.dispatcher.flush_buffers(fh)?;
            Ok(())
        }
    }

    fn fsyncdir(
        &self,
        _: Request,
        _: u64,
        _: u64,
        _: bool,
    ) -> impl Future<Output = FuseResult<()>> + Send {
        async { Ok(()) }
    }

    fn interrupt(&self, _: Request, _: u64) -> impl Future<Output = FuseResult<()>> + Send {
        async { Ok(()) }
    }

    fn create(
        &self,
        _: Request,
        _: u64,
        _: &OsStr,
        _: u32,
        _: u32,
    ) -> impl Future<Output = FuseResult<ReplyCreated>> + Send {
        async move { Err(OpError::AccessDenied.into()) }
    }

    fn mknod(
        &self,
        _: Request,
        _: u64,
        _: &OsStr,
        _: u32,
        _: u32,
    ) -> impl Future<Output = FuseResult<ReplyEntry>> + Send {
        async move { Err(OpError::AccessDenied.into()) }
    }

    fn mkdir(
        &self,
        _: Request,
        _: u64,
        _: &OsStr,
        _: u32,
        _: u32,
    ) -> impl Future<Output = FuseResult<ReplyEntry>> + Send {
        async move { Err(OpError::AccessDenied.into()) }
    }

    fn unlink(
        &self,
        _: Request,
        parent: Inode,
        name: &OsStr,
    ) -> impl Future<Output = FuseResult<()>> + Send {
        async move {
            let name = Self::name_str(name)?;
            let path = self.dispatcher.path_by_ino(parent)?;
            self.dispatcher.delete_file(&format!("{path}/{name}"))?;
            Ok(())
        }
    }

    fn rmdir(
        &self,
        _: Request,
        parent: Inode,
        name: &OsStr,
    ) -> impl Future<Output = FuseResult<()>> + Send {
        async move {
            let name = Self::name_str(name)?;
            let path = self.dispatcher.path_by_ino(parent)?;
            self.dispatcher.delete_directory(&format!("{path}/{name}"))?;
            Ok(())
        }
    }

    fn rename(
        &self,
        _: Request,
        parent: Inode,
        name: &OsStr,
        new_parent: Inode,
        new_name: &OsStr,
    ) -> impl Future<Output = FuseResult<()>> + Send {
        async move {
            let from = format!(
                "{}/{}",
                self.dispatcher.path_by_ino(parent)?,
                Self::name_str(name)?
            );
            let to = format!(
                "{}/{}",
                self.dispatcher.path_by_ino(new_parent)?,
                Self::name_str(new_name)?
            );
            self.dispatcher.move_entry(&from, &to)?;
            Ok(())
        }
    }

    fn symlink(
        &self,
        _: Request,
        _: u64,
        _: &OsStr,
        _: &OsStr,
    ) -> impl Future<Output = FuseResult<ReplyEntry>> + Send {
        async move { Err(OpError::AccessDenied.into()) }
    }

    fn link(
        &self,
        _: Request,
        _: u64,
        _: u64,
        _: &OsStr,
    ) -> impl Future<Output = FuseResult<ReplyEntry>> + Send {
        async move { Err(OpError::AccessDenied.into()) }
    }

    fn readlink(&self, _: Request, _: Inode) -> impl Future<Output = FuseResult<ReplyData>> + Send {
        // the namespace holds no symlinks
        async move { Err(OpError::InvalidParameter.into()) }
    }

    fn fallocate(
        &self,
        _: Request,
        _: u64,
        fh: u64,
        _: u64,
        len: u64,
        _: u32,
    ) -> impl Future<Output = FuseResult<()>> + Send {
        async move {
            self.dispatcher.set_allocation(fh, len)?;
            Ok(())
        }
    }

    fn setxattr(
        &self,
        _: Request,
        _: u64,
        _: &OsStr,
        _: &[u8],
        _: u32,
        _: u32,
    ) -> impl Future<Output = FuseResult<()>> + Send {
        async move { Err(OpError::AccessDenied.into()) }
    }

    /// alternate streams are unsupported
    fn getxattr(
        &self,
        _: Request,
        inode: u64,
        _: &OsStr,
        _: u32,
    ) -> impl Future<Output = FuseResult<ReplyXAttr>> + Send {
        async move {
            let path = self.dispatcher.path_by_ino(inode)?;
            self.dispatcher.find_streams(&path)?;
            Err(OpError::Unimplemented.into())
        }
    }

    fn listxattr(
        &self,
        _: Request,
        _: u64,
        _: u32,
    ) -> impl Future<Output = FuseResult<ReplyXAttr>> + Send {
        async move { Err(OpError::Unimplemented.into()) }
    }

    fn removexattr(
        &self,
        _: Request,
        _: u64,
        _: &OsStr,
    ) -> impl Future<Output = FuseResult<()>> + Send {
        async move { Err(OpError::AccessDenied.into()) }
    }
}
