use std::{
    ffi::OsString,
    time::{Duration, SystemTime},
};

use fuse3::{
    raw::{reply::*, Request},
    FileType, Timestamp,
};

use super::{index::Ino, view::FileInfo};

pub const BLOCKSIZE: u32 = 4096;
const TTL: Duration = Duration::from_secs(30);

fn timestamp(time: SystemTime) -> Timestamp {
    match time.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(elapsed) => Timestamp::new(elapsed.as_secs() as i64, elapsed.subsec_nanos()),
        Err(_) => Timestamp::new(0, 0),
    }
}

fn kind(info: &FileInfo) -> FileType {
    if info.is_dir() {
        FileType::Directory
    } else {
        FileType::RegularFile
    }
}

pub fn file_attr(info: &FileInfo, ino: Ino) -> FileAttr {
    FileAttr {
        ino,
        size: info.size,
        blocks: info.size.div_ceil(BLOCKSIZE as u64),
        atime: timestamp(info.times.accessed),
        mtime: timestamp(info.times.modified),
        ctime: timestamp(info.times.created),
        kind: kind(info),
        // everyone reads and executes, nobody writes
        perm: 0o555,
        nlink: 1,
        uid: 0,
        gid: 0,
        rdev: 0,
        blksize: BLOCKSIZE,
    }
}

pub fn reply_entry(_: &Request, info: &FileInfo, ino: Ino) -> ReplyEntry {
    ReplyEntry {
        ttl: TTL,
        attr: file_attr(info, ino),
        generation: 0,
    }
}

pub fn reply_attr(_: &Request, info: &FileInfo, ino: Ino) -> ReplyAttr {
    ReplyAttr {
        ttl: TTL,
        attr: file_attr(info, ino),
    }
}

pub fn dir_entry(name: OsString, info: &FileInfo, ino: Ino, offset: i64) -> DirectoryEntry {
    DirectoryEntry {
        inode: ino,
        kind: kind(info),
        name,
        offset,
    }
}

pub fn dir_entry_plus(
    _: &Request,
    name: OsString,
    info: &FileInfo,
    ino: Ino,
    offset: i64,
) -> DirectoryEntryPlus {
    DirectoryEntryPlus {
        inode: ino,
        generation: 0,
        kind: kind(info),
        name,
        offset,
        attr: file_attr(info, ino),
        entry_ttl: TTL,
        attr_ttl: TTL,
    }
}
