//! Overlay entry representation
//!
//! The directory graph is a flat mapping from inode identity to entry;
//! an entry is either a tree (ordered child links) or file/symlink
//! content. Child links carry the target's kind so directory listings
//! never need to load the child entries themselves.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable 64-bit handle identifying one filesystem object for the
/// lifetime of the overlay's on-disk instance
pub type InodeId = u64;

/// The permanent root tree identity
pub const ROOT_ID: InodeId = 1;

/// Kind of a directory child
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// Regular file
    File,
    /// Directory
    Tree,
    /// Symbolic link
    Symlink,
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryKind::File => write!(f, "file"),
            EntryKind::Tree => write!(f, "tree"),
            EntryKind::Symlink => write!(f, "symlink"),
        }
    }
}

/// BLAKE3 content hash of externally stored file data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentHash(pub [u8; 32]);

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl From<blake3::Hash> for ContentHash {
    fn from(h: blake3::Hash) -> Self {
        ContentHash(*h.as_bytes())
    }
}

/// One child link within a tree entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Child name, unique within the parent tree
    pub name: String,
    /// Target inode identity
    pub child: InodeId,
    /// Kind of the target
    pub kind: EntryKind,
}

/// Directory contents: child links kept sorted by name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    children: Vec<DirEntry>,
}

impl TreeEntry {
    /// Create an empty tree
    pub fn new() -> Self {
        TreeEntry {
            children: Vec::new(),
        }
    }

    /// Look up a child link by name
    pub fn get(&self, name: &str) -> Option<&DirEntry> {
        self.children
            .binary_search_by(|e| e.name.as_str().cmp(name))
            .ok()
            .map(|idx| &self.children[idx])
    }

    /// Insert a child link; fails if the name is already present
    pub fn insert(&mut self, parent: InodeId, entry: DirEntry) -> Result<()> {
        match self
            .children
            .binary_search_by(|e| e.name.as_str().cmp(entry.name.as_str()))
        {
            Ok(_) => Err(Error::AlreadyExists {
                parent,
                name: entry.name,
            }),
            Err(idx) => {
                self.children.insert(idx, entry);
                Ok(())
            }
        }
    }

    /// Remove and return the child link with the given name
    pub fn remove(&mut self, parent: InodeId, name: &str) -> Result<DirEntry> {
        match self
            .children
            .binary_search_by(|e| e.name.as_str().cmp(name))
        {
            Ok(idx) => Ok(self.children.remove(idx)),
            Err(_) => Err(Error::NameNotFound {
                parent,
                name: name.to_string(),
            }),
        }
    }

    /// All child links in listing order
    pub fn children(&self) -> &[DirEntry] {
        &self.children
    }

    /// Number of child links
    pub fn len(&self) -> usize {
        self.children.len()
    }

    /// Whether the tree has no children
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}

/// Shape of a file's or symlink's payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileContent {
    /// Payload held directly in the overlay
    Inline(Vec<u8>),
    /// Reference to content stored by the remote backend
    External { hash: ContentHash, size: u64 },
}

/// Non-tree payload kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileKind {
    Regular,
    Symlink,
}

/// File or symlink entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Regular file or symlink
    pub kind: FileKind,
    /// Payload or external reference
    pub content: FileContent,
    /// True when locally modified; dirty content is always inline and
    /// must be preserved verbatim. A clean entry is known identical to
    /// the snapshot and may carry only the external reference.
    pub dirty: bool,
}

impl FileEntry {
    /// A new, empty, locally created file
    pub fn empty(kind: FileKind) -> Self {
        FileEntry {
            kind,
            content: FileContent::Inline(Vec::new()),
            dirty: false,
        }
    }

    /// A file known identical to the snapshot, content held remotely
    pub fn from_snapshot(kind: FileKind, hash: ContentHash, size: u64) -> Self {
        FileEntry {
            kind,
            content: FileContent::External { hash, size },
            dirty: false,
        }
    }

    /// Payload size in bytes
    pub fn size(&self) -> u64 {
        match &self.content {
            FileContent::Inline(data) => data.len() as u64,
            FileContent::External { size, .. } => *size,
        }
    }

    /// Content hash: computed for inline payloads, stored for external
    pub fn content_hash(&self) -> ContentHash {
        match &self.content {
            FileContent::Inline(data) => blake3::hash(data).into(),
            FileContent::External { hash, .. } => *hash,
        }
    }
}

/// A stored overlay entry: one of the two shapes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverlayEntry {
    Tree(TreeEntry),
    File(FileEntry),
}

impl OverlayEntry {
    /// Create an empty tree entry
    pub fn empty_tree() -> Self {
        OverlayEntry::Tree(TreeEntry::new())
    }

    /// Create an empty entry of the given kind
    pub fn empty(kind: EntryKind) -> Self {
        match kind {
            EntryKind::Tree => OverlayEntry::Tree(TreeEntry::new()),
            EntryKind::File => OverlayEntry::File(FileEntry::empty(FileKind::Regular)),
            EntryKind::Symlink => OverlayEntry::File(FileEntry::empty(FileKind::Symlink)),
        }
    }

    /// Kind of this entry
    pub fn kind(&self) -> EntryKind {
        match self {
            OverlayEntry::Tree(_) => EntryKind::Tree,
            OverlayEntry::File(f) => match f.kind {
                FileKind::Regular => EntryKind::File,
                FileKind::Symlink => EntryKind::Symlink,
            },
        }
    }

    /// Whether this entry is a tree
    pub fn is_tree(&self) -> bool {
        matches!(self, OverlayEntry::Tree(_))
    }

    /// Borrow as a tree, or fail with TypeMismatch
    pub fn as_tree(&self, ino: InodeId) -> Result<&TreeEntry> {
        match self {
            OverlayEntry::Tree(t) => Ok(t),
            OverlayEntry::File(_) => Err(Error::TypeMismatch {
                ino,
                expected: "tree",
            }),
        }
    }

    /// Borrow as a mutable tree, or fail with TypeMismatch
    pub fn as_tree_mut(&mut self, ino: InodeId) -> Result<&mut TreeEntry> {
        match self {
            OverlayEntry::Tree(t) => Ok(t),
            OverlayEntry::File(_) => Err(Error::TypeMismatch {
                ino,
                expected: "tree",
            }),
        }
    }

    /// Borrow as a file/symlink, or fail with TypeMismatch
    pub fn as_file(&self, ino: InodeId) -> Result<&FileEntry> {
        match self {
            OverlayEntry::File(f) => Ok(f),
            OverlayEntry::Tree(_) => Err(Error::TypeMismatch {
                ino,
                expected: "file",
            }),
        }
    }

    /// Borrow as a mutable file/symlink, or fail with TypeMismatch
    pub fn as_file_mut(&mut self, ino: InodeId) -> Result<&mut FileEntry> {
        match self {
            OverlayEntry::File(f) => Ok(f),
            OverlayEntry::Tree(_) => Err(Error::TypeMismatch {
                ino,
                expected: "file",
            }),
        }
    }
}
