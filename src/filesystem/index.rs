use std::{collections::BTreeMap, sync::Arc, time::SystemTime};

use crate::archive::EntryMeta;

use super::path::{fold, CanonPath};

pub type Ino = u64;

const INO_MIN: usize = 1;

/// Timestamp triple attached to every node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Times {
    pub created: SystemTime,
    pub modified: SystemTime,
    pub accessed: SystemTime,
}

impl Times {
    fn from_meta(meta: &EntryMeta) -> Self {
        let modified = meta.modified.unwrap_or(SystemTime::UNIX_EPOCH);
        Self {
            created: meta.created.unwrap_or(modified),
            modified,
            accessed: modified,
        }
    }
}

/// Catalog row for a file entry.
#[derive(Debug)]
pub struct FileMeta {
    pub path: CanonPath,
    /// `None` when the decoder does not declare an uncompressed size
    pub size: Option<u64>,
    pub times: Times,
    pub encrypted: bool,
    /// position of the entry in the decoder's entry table
    pub decoder_index: usize,
}

#[derive(Debug, Clone)]
pub enum Node {
    File(Arc<FileMeta>),
    /// `explicit` distinguishes catalog directory entries from
    /// synthesized ancestors
    Directory { times: Times, explicit: bool },
}

impl Node {
    pub fn is_dir(&self) -> bool {
        matches!(self, Self::Directory { .. })
    }
    pub fn times(&self) -> Times {
        match self {
            Self::File(meta) => meta.times,
            Self::Directory { times, .. } => *times,
        }
    }
    pub fn size(&self) -> u64 {
        match self {
            Self::File(meta) => meta.size.unwrap_or(0),
            Self::Directory { .. } => 0,
        }
    }
}

struct TreeNode {
    parent: usize,
    name: String,
    path: CanonPath,
    children: BTreeMap<String, usize>,
    value: Node,
}

/// The entry catalog plus every synthesized ancestor, as a tree.
///
/// Built once from the decoder's entry table and immutable afterwards,
/// so reads take no locks. Children are keyed by the case-folded
/// component, which both de-duplicates names that differ only by case
/// and gives the bridge stable inode numbers (root is 1).
pub struct ArchiveIndex {
    nodes: Vec<TreeNode>,
    archive_len: u64,
}

impl ArchiveIndex {
    pub fn build(entries: &[EntryMeta], archive_len: u64) -> Self {
        let root_times = entries
            .first()
            .map(Times::from_meta)
            .unwrap_or(Times {
                created: SystemTime::UNIX_EPOCH,
                modified: SystemTime::UNIX_EPOCH,
                accessed: SystemTime::UNIX_EPOCH,
            });
        let mut index = Self {
            nodes: vec![TreeNode {
                parent: 0,
                name: String::new(),
                path: CanonPath::root(),
                children: BTreeMap::new(),
                value: Node::Directory {
                    times: root_times,
                    explicit: false,
                },
            }],
            archive_len,
        };
        for (decoder_index, meta) in entries.iter().enumerate() {
            index.insert(decoder_index, meta);
        }
        index
    }

    fn insert(&mut self, decoder_index: usize, meta: &EntryMeta) {
        let (path, dir_hint) = CanonPath::from_key(&meta.key);
        if path.is_root() {
            return;
        }
        let is_dir = meta.is_dir || dir_hint;
        let times = Times::from_meta(meta);

        let components: Vec<&str> = path.components().collect();
        let mut idx = 0usize;
        for component in &components[..components.len() - 1] {
            match self.step_or_synthesize(idx, component, times) {
                Some(next) => idx = next,
                None => {
                    log::warn!("entry {:?} shadowed by a file, skipping", meta.key);
                    return;
                }
            }
        }

        let name = components[components.len() - 1];
        let value = if is_dir {
            Node::Directory {
                times,
                explicit: true,
            }
        } else {
            Node::File(Arc::new(FileMeta {
                path: path.clone(),
                size: meta.size,
                times,
                encrypted: meta.encrypted,
                decoder_index,
            }))
        };
        match self.nodes[idx].children.get(&fold(name)).copied() {
            Some(existing) => {
                // an explicit directory entry pre-empts its synthesized twin
                let upgrade = matches!(
                    (&self.nodes[existing].value, &value),
                    (
                        Node::Directory {
                            explicit: false,
                            ..
                        },
                        Node::Directory { .. },
                    )
                );
                if upgrade {
                    self.nodes[existing].value = value;
                } else {
                    log::warn!("duplicate catalog key {:?}, keeping first", meta.key);
                }
            }
            None => {
                self.push_child(idx, name, value);
            }
        }
    }

    /// Descend one component, synthesizing a directory stamped with the
    /// inducing entry's timestamps when absent. `None` when the path is
    /// blocked by an existing file node.
    fn step_or_synthesize(&mut self, idx: usize, name: &str, times: Times) -> Option<usize> {
        if let Some(&child) = self.nodes[idx].children.get(&fold(name)) {
            return self.nodes[child].value.is_dir().then_some(child);
        }
        Some(self.push_child(
            idx,
            name,
            Node::Directory {
                times,
                explicit: false,
            },
        ))
    }

    fn push_child(&mut self, parent: usize, name: &str, value: Node) -> usize {
        let idx = self.nodes.len();
        let path = self.nodes[parent].path.join(name);
        self.nodes.push(TreeNode {
            parent,
            name: name.to_string(),
            path,
            children: BTreeMap::new(),
            value,
        });
        self.nodes[parent].children.insert(fold(name), idx);
        idx
    }

    fn slot(&self, ino: Ino) -> Option<usize> {
        let idx = usize::try_from(ino).ok()?.checked_sub(INO_MIN)?;
        (idx < self.nodes.len()).then_some(idx)
    }

    pub fn root() -> Ino {
        INO_MIN as Ino
    }

    /// resolve a canonical path to its inode
    pub fn get(&self, path: &CanonPath) -> Option<Ino> {
        let mut idx = 0usize;
        for component in path.components() {
            idx = *self.nodes[idx].children.get(&fold(component))?;
        }
        Some((idx + INO_MIN) as Ino)
    }

    pub fn node(&self, ino: Ino) -> Option<&Node> {
        Some(&self.nodes[self.slot(ino)?].value)
    }

    pub fn path_of(&self, ino: Ino) -> Option<&CanonPath> {
        Some(&self.nodes[self.slot(ino)?].path)
    }

    pub fn name_of(&self, ino: Ino) -> Option<&str> {
        Some(self.nodes[self.slot(ino)?].name.as_str())
    }

    pub fn parent_of(&self, ino: Ino) -> Option<Ino> {
        Some((self.nodes[self.slot(ino)?].parent + INO_MIN) as Ino)
    }

    pub fn child(&self, parent: Ino, name: &str) -> Option<Ino> {
        let idx = self.slot(parent)?;
        let child = *self.nodes[idx].children.get(&fold(name))?;
        Some((child + INO_MIN) as Ino)
    }

    /// direct children in case-insensitive name order
    pub fn children(&self, ino: Ino) -> impl Iterator<Item = (Ino, &str, &Node)> {
        self.slot(ino)
            .into_iter()
            .flat_map(|idx| self.nodes[idx].children.values())
            .map(|&child| {
                let node = &self.nodes[child];
                ((child + INO_MIN) as Ino, node.name.as_str(), &node.value)
            })
    }

    pub fn lookup(&self, path: &CanonPath) -> Option<&Node> {
        self.node(self.get(path)?)
    }

    pub fn is_directory(&self, path: &CanonPath) -> bool {
        self.lookup(path).is_some_and(Node::is_dir)
    }

    pub fn timestamps(&self, path: &CanonPath) -> Option<Times> {
        self.lookup(path).map(Node::times)
    }

    pub fn archive_len(&self) -> u64 {
        self.archive_len
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::archive::{testing::FakeDecoder, Decoder};

    fn nested() -> ArchiveIndex {
        let mut decoder = FakeDecoder::new()
            .file("nest/a.txt", b"aaa")
            .file("nest/b.txt", b"bbb")
            .file("o.txt", b"ooo")
            .dir("sub/")
            .file("a/b/c.dat", b"0123456789");
        let entries = decoder.entries().unwrap();
        ArchiveIndex::build(&entries, decoder.archive_len())
    }

    #[test]
    fn lookup_kinds() {
        let index = nested();
        assert!(index.is_directory(&CanonPath::normalize("/")));
        assert!(index.is_directory(&CanonPath::normalize("/nest")));
        assert!(index.is_directory(&CanonPath::normalize("/sub")));
        assert!(!index.is_directory(&CanonPath::normalize("/o.txt")));
        assert!(index
            .lookup(&CanonPath::normalize("/nest/a.txt"))
            .is_some());
        assert!(index.lookup(&CanonPath::normalize("/missing")).is_none());
    }

    #[test]
    fn synthesized_ancestors() {
        let index = nested();
        // "a" and "a/b" exist only because of "a/b/c.dat"
        let a = index.lookup(&CanonPath::normalize("/a")).unwrap();
        let ab = index.lookup(&CanonPath::normalize("/a/b")).unwrap();
        assert!(matches!(a, Node::Directory { explicit: false, .. }));
        assert!(matches!(ab, Node::Directory { explicit: false, .. }));
        // explicit directory entry is marked as such
        let sub = index.lookup(&CanonPath::normalize("/sub")).unwrap();
        assert!(matches!(sub, Node::Directory { explicit: true, .. }));
    }

    #[test]
    fn explicit_preempts_synthesized() {
        let mut decoder = FakeDecoder::new()
            .file("docs/readme.txt", b"x")
            .dir("docs/");
        let entries = decoder.entries().unwrap();
        let index = ArchiveIndex::build(&entries, 0);
        let docs = index.lookup(&CanonPath::normalize("/docs")).unwrap();
        assert!(matches!(docs, Node::Directory { explicit: true, .. }));
    }

    #[test]
    fn case_insensitive_lookup() {
        let index = nested();
        let a = index.get(&CanonPath::normalize("/NEST/A.TXT")).unwrap();
        let b = index.get(&CanonPath::normalize("/nest/a.txt")).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn inode_navigation() {
        let index = nested();
        let root = ArchiveIndex::root();
        assert_eq!(index.path_of(root).unwrap().as_str(), "/");
        let nest = index.child(root, "nest").unwrap();
        assert_eq!(index.path_of(nest).unwrap().as_str(), "/nest");
        assert_eq!(index.parent_of(nest), Some(root));
        let names: Vec<_> = index.children(nest).map(|(_, name, _)| name).collect();
        assert_eq!(names, vec!["a.txt", "b.txt"]);
        assert_eq!(index.child(root, "missing"), None);
    }

    #[test]
    fn namespace_completeness() {
        let index = nested();
        let mut seen = Vec::new();
        let mut stack = vec![ArchiveIndex::root()];
        while let Some(ino) = stack.pop() {
            for (child, _, _) in index.children(ino) {
                seen.push(index.path_of(child).unwrap().as_str().to_string());
                stack.push(child);
            }
        }
        seen.sort();
        assert_eq!(
            seen,
            vec![
                "/a", "/a/b", "/a/b/c.dat", "/nest", "/nest/a.txt", "/nest/b.txt", "/o.txt",
                "/sub",
            ]
        );
        assert_eq!(seen.len() + 1, index.node_count());
    }
}
