use std::sync::Arc;

use bitflags::bitflags;

use super::{
    error::OpError,
    index::{ArchiveIndex, Ino, Node, Times},
    path::{fold, CanonPath},
};

pub const VOLUME_LABEL: &str = "SimpleZipDrive";
pub const FILESYSTEM_NAME: &str = "ZipFS";
pub const MAX_COMPONENT_LENGTH: u32 = 255;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Attributes: u32 {
        const READ_ONLY = 1;
        const DIRECTORY = 1 << 4;
        const ARCHIVE = 1 << 5;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VolumeFeatures: u32 {
        const CASE_PRESERVED_NAMES = 1 << 1;
        const UNICODE_ON_DISK = 1 << 2;
        const READ_ONLY_VOLUME = 1 << 19;
    }
}

#[derive(Debug, Clone)]
pub struct FileInfo {
    pub name: String,
    pub attributes: Attributes,
    pub size: u64,
    pub times: Times,
}

impl FileInfo {
    fn of(name: &str, node: &Node) -> Self {
        Self {
            name: name.to_string(),
            attributes: match node {
                Node::Directory { .. } => Attributes::DIRECTORY,
                Node::File(_) => Attributes::ARCHIVE | Attributes::READ_ONLY,
            },
            size: node.size(),
            times: node.times(),
        }
    }
    pub fn is_dir(&self) -> bool {
        self.attributes.contains(Attributes::DIRECTORY)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct VolumeInfo {
    pub label: &'static str,
    pub filesystem: &'static str,
    pub max_component_length: u32,
    pub features: VolumeFeatures,
}

#[derive(Debug, Clone, Copy)]
pub struct FreeSpace {
    pub free: u64,
    pub total: u64,
}

/// Read-only answers about the mounted namespace, straight off the
/// immutable index.
pub struct NamespaceView {
    index: Arc<ArchiveIndex>,
}

impl NamespaceView {
    pub fn new(index: Arc<ArchiveIndex>) -> Self {
        Self { index }
    }
    pub fn index(&self) -> &ArchiveIndex {
        &self.index
    }

    pub fn get_info(&self, path: &CanonPath) -> Result<FileInfo, OpError> {
        let ino = self.index.get(path).ok_or(OpError::PathNotFound)?;
        self.info_of(ino).ok_or(OpError::PathNotFound)
    }

    pub fn info_of(&self, ino: Ino) -> Option<FileInfo> {
        let node = self.index.node(ino)?;
        let name = self.index.name_of(ino)?;
        Some(FileInfo::of(name, node))
    }

    /// Direct children, case-insensitively sorted and de-duplicated.
    pub fn list(&self, path: &CanonPath) -> Result<Vec<(Ino, FileInfo)>, OpError> {
        let ino = self.index.get(path).ok_or(OpError::PathNotFound)?;
        self.list_ino(ino)
    }

    pub fn list_ino(&self, ino: Ino) -> Result<Vec<(Ino, FileInfo)>, OpError> {
        let node = self.index.node(ino).ok_or(OpError::PathNotFound)?;
        if !node.is_dir() {
            return Err(OpError::NotDirectory);
        }
        Ok(self
            .index
            .children(ino)
            .map(|(child, name, node)| (child, FileInfo::of(name, node)))
            .collect())
    }

    pub fn list_pattern(
        &self,
        path: &CanonPath,
        pattern: &str,
    ) -> Result<Vec<(Ino, FileInfo)>, OpError> {
        let mut children = self.list(path)?;
        children.retain(|(_, info)| glob_match(pattern, &info.name));
        Ok(children)
    }

    pub fn volume_info(&self) -> VolumeInfo {
        VolumeInfo {
            label: VOLUME_LABEL,
            filesystem: FILESYSTEM_NAME,
            max_component_length: MAX_COMPONENT_LENGTH,
            features: VolumeFeatures::READ_ONLY_VOLUME
                | VolumeFeatures::CASE_PRESERVED_NAMES
                | VolumeFeatures::UNICODE_ON_DISK,
        }
    }

    pub fn free_space(&self) -> FreeSpace {
        FreeSpace {
            free: 0,
            total: self.index.archive_len(),
        }
    }
}

/// Case-insensitive wildcard match: `*` is any run, `?` exactly one
/// character. `*` and `*.*` match everything.
pub fn glob_match(pattern: &str, name: &str) -> bool {
    if pattern == "*" || pattern == "*.*" {
        return true;
    }
    let pattern: Vec<char> = fold(pattern).chars().collect();
    let name: Vec<char> = fold(name).chars().collect();

    let (mut pi, mut ni) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;
    while ni < name.len() {
        if pi < pattern.len() && (pattern[pi] == '?' || pattern[pi] == name[ni]) {
            pi += 1;
            ni += 1;
        } else if pi < pattern.len() && pattern[pi] == '*' {
            star = Some((pi, ni));
            pi += 1;
        } else if let Some((star_pi, star_ni)) = star {
            // widen the last star by one and retry
            star = Some((star_pi, star_ni + 1));
            pi = star_pi + 1;
            ni = star_ni + 1;
        } else {
            return false;
        }
    }
    while pi < pattern.len() && pattern[pi] == '*' {
        pi += 1;
    }
    pi == pattern.len()
}
