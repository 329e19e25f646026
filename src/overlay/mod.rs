//! Inode overlay storage engine
//!
//! Durably records every inode that has locally diverged from the
//! immutable checkout snapshot:
//! - Entries: flat mapping from inode identity to tree or file state
//! - Store: transactional, crash-consistent persistence over sled
//! - Allocator: monotonic inode identities, no reuse across restarts
//! - Session: per-mount coordinator driven by the kernel adapter
//! - Scanner: offline/exclusive reachability check and repair

mod alloc;
mod entry;
mod scanner;
mod session;
mod store;

pub use alloc::IdentityAllocator;
pub use entry::{
    ContentHash, DirEntry, EntryKind, FileContent, FileEntry, FileKind, InodeId, OverlayEntry,
    TreeEntry, ROOT_ID,
};
pub use scanner::{scan, DanglingRef, ScanMode, ScanReport};
pub use session::{EntryStatus, OverlaySession};
pub use store::{OverlayStore, Transaction, SCHEMA_VERSION};
