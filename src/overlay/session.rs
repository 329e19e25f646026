//! Live overlay session
//!
//! The per-mount coordinator. The kernel-facing adapter calls into the
//! session for every inode lifecycle event; the session delegates
//! durable mutation to the store inside one transaction per operation
//! and owns the identity allocator.
//!
//! Structural mutations serialize on one mutex, so concurrent
//! materialize/rename/unlink calls can never interleave partially.
//! Reads go straight to committed store state and need no lock.

use crate::config::{IoErrorPolicy, OverlayConfig};
use crate::error::{Error, Result};
use crate::overlay::alloc::IdentityAllocator;
use crate::overlay::entry::{
    ContentHash, DirEntry, EntryKind, FileContent, FileEntry, FileKind, InodeId, OverlayEntry,
};
use crate::overlay::scanner::{self, ScanMode, ScanReport};
use crate::overlay::store::OverlayStore;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Read-only view of one entry's overlay state, for operator tooling
#[derive(Debug, Clone)]
pub struct EntryStatus {
    pub ino: InodeId,
    pub kind: EntryKind,
    /// Locally modified (files only)
    pub dirty: bool,
    /// Payload held inline rather than by external reference
    pub inline: bool,
    /// Payload size (files) or zero (trees)
    pub size: u64,
    /// Number of child links (trees only)
    pub child_count: usize,
    /// Content hash (files only)
    pub content_hash: Option<ContentHash>,
}

/// Live, per-mount handle over one overlay instance
pub struct OverlaySession {
    store: Arc<OverlayStore>,
    alloc: IdentityAllocator,
    /// Serializes structural mutations; scanning holds it too
    struct_lock: Mutex<()>,
    /// Set after a StoreUnavailable error; the session refuses new
    /// mutations until remounted
    degraded: AtomicBool,
    io_error_policy: IoErrorPolicy,
}

impl OverlaySession {
    /// Open the overlay at `path`, initializing it if fresh
    pub fn open(path: &Path, config: &OverlayConfig) -> Result<Self> {
        Self::with_store(OverlayStore::open(path, config)?, config, path)
    }

    /// Open an existing overlay, failing if none is initialized at
    /// `path`. Inspection tooling uses this form.
    pub fn open_existing(path: &Path, config: &OverlayConfig) -> Result<Self> {
        Self::with_store(OverlayStore::open_existing(path, config)?, config, path)
    }

    fn with_store(store: OverlayStore, config: &OverlayConfig, path: &Path) -> Result<Self> {
        let store = Arc::new(store);
        let alloc = IdentityAllocator::open(Arc::clone(&store), config.id_reserve_batch)?;
        info!(path = %path.display(), "overlay session opened");
        Ok(OverlaySession {
            store,
            alloc,
            struct_lock: Mutex::new(()),
            degraded: AtomicBool::new(false),
            io_error_policy: config.io_error_policy,
        })
    }

    /// The underlying store
    pub fn store(&self) -> &OverlayStore {
        &self.store
    }

    /// Whether the session has refused further mutations after a
    /// storage failure
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    fn guard_mutation(&self) -> Result<()> {
        if self.is_degraded() {
            return Err(Error::StoreUnavailable(
                "session degraded after storage failure; remount required".to_string(),
            ));
        }
        Ok(())
    }

    fn guard_read(&self) -> Result<()> {
        if self.is_degraded() && self.io_error_policy == IoErrorPolicy::FailFast {
            return Err(Error::StoreUnavailable(
                "session degraded after storage failure; remount required".to_string(),
            ));
        }
        Ok(())
    }

    /// Mark the session degraded on storage failure, pass the result through
    fn track<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(Error::StoreUnavailable(msg)) = &result {
            warn!(%msg, "storage failure; session entering degraded mode");
            self.degraded.store(true, Ordering::SeqCst);
        }
        result
    }

    /// Create a brand-new empty entry and link it under `parent`.
    ///
    /// Fails with `AlreadyExists` on a name collision and
    /// `TypeMismatch` if `parent` is not a tree. Allocation, entry
    /// creation and the parent link commit as one transaction.
    pub fn materialize(&self, parent: InodeId, name: &str, kind: EntryKind) -> Result<InodeId> {
        self.guard_mutation()?;
        let _guard = self.struct_lock.lock();
        let result = self.link_new(parent, name, kind, OverlayEntry::empty(kind));
        self.track(result)
    }

    /// Record an entry known identical to the snapshot: content stays
    /// with the remote backend, referenced by hash. Not dirty.
    pub fn link_snapshot_file(
        &self,
        parent: InodeId,
        name: &str,
        kind: FileKind,
        hash: ContentHash,
        size: u64,
    ) -> Result<InodeId> {
        self.guard_mutation()?;
        let _guard = self.struct_lock.lock();
        let dir_kind = match kind {
            FileKind::Regular => EntryKind::File,
            FileKind::Symlink => EntryKind::Symlink,
        };
        let entry = OverlayEntry::File(FileEntry::from_snapshot(kind, hash, size));
        let result = self.link_new(parent, name, dir_kind, entry);
        self.track(result)
    }

    fn link_new(
        &self,
        parent: InodeId,
        name: &str,
        kind: EntryKind,
        entry: OverlayEntry,
    ) -> Result<InodeId> {
        let mut txn = self.store.begin();
        let mut parent_entry = txn.get(parent)?.ok_or(Error::NotFound(parent))?;
        let tree = parent_entry.as_tree_mut(parent)?;
        if tree.get(name).is_some() {
            return Err(Error::AlreadyExists {
                parent,
                name: name.to_string(),
            });
        }

        let id = self.alloc.allocate()?;
        tree.insert(
            parent,
            DirEntry {
                name: name.to_string(),
                child: id,
                kind,
            },
        )?;
        txn.put(parent, parent_entry);
        txn.put(id, entry);
        txn.commit()?;
        Ok(id)
    }

    /// Replace a file's payload with `data`, held inline and marked
    /// dirty: locally modified content is preserved verbatim.
    pub fn write_file(&self, id: InodeId, data: &[u8]) -> Result<()> {
        self.guard_mutation()?;
        let _guard = self.struct_lock.lock();
        let result = (|| {
            let mut txn = self.store.begin();
            let mut entry = txn.get(id)?.ok_or(Error::NotFound(id))?;
            let file = entry.as_file_mut(id)?;
            file.content = FileContent::Inline(data.to_vec());
            file.dirty = true;
            txn.put(id, entry);
            txn.commit()
        })();
        self.track(result)
    }

    /// Atomically move one child link. Never observable as two
    /// locations for the same identity, or none if the source existed.
    pub fn rename(
        &self,
        old_parent: InodeId,
        old_name: &str,
        new_parent: InodeId,
        new_name: &str,
    ) -> Result<()> {
        self.guard_mutation()?;
        let _guard = self.struct_lock.lock();
        let result = (|| {
            let mut txn = self.store.begin();

            let mut src_entry = txn.get(old_parent)?.ok_or(Error::NotFound(old_parent))?;
            let moved = src_entry.as_tree_mut(old_parent)?.remove(old_parent, old_name)?;

            if old_parent == new_parent {
                let tree = src_entry.as_tree_mut(old_parent)?;
                if tree.get(new_name).is_some() {
                    return Err(Error::AlreadyExists {
                        parent: new_parent,
                        name: new_name.to_string(),
                    });
                }
                tree.insert(
                    old_parent,
                    DirEntry {
                        name: new_name.to_string(),
                        child: moved.child,
                        kind: moved.kind,
                    },
                )?;
                txn.put(old_parent, src_entry);
            } else {
                let mut dst_entry = txn.get(new_parent)?.ok_or(Error::NotFound(new_parent))?;
                let dst_tree = dst_entry.as_tree_mut(new_parent)?;
                if dst_tree.get(new_name).is_some() {
                    return Err(Error::AlreadyExists {
                        parent: new_parent,
                        name: new_name.to_string(),
                    });
                }
                dst_tree.insert(
                    new_parent,
                    DirEntry {
                        name: new_name.to_string(),
                        child: moved.child,
                        kind: moved.kind,
                    },
                )?;
                txn.put(old_parent, src_entry);
                txn.put(new_parent, dst_entry);
            }
            txn.commit()
        })();
        self.track(result)
    }

    /// Remove the child link `name` under `parent`. A tree child takes
    /// its whole subtree with it, in the same transaction. A second
    /// unlink of the same name fails with `NameNotFound` and has no
    /// side effects.
    pub fn unlink(&self, parent: InodeId, name: &str) -> Result<()> {
        self.guard_mutation()?;
        let _guard = self.struct_lock.lock();
        let result = (|| {
            let mut txn = self.store.begin();
            let mut parent_entry = txn.get(parent)?.ok_or(Error::NotFound(parent))?;
            let removed = parent_entry.as_tree_mut(parent)?.remove(parent, name)?;
            txn.put(parent, parent_entry);
            // Dispatch on the child entry's actual shape, not the
            // link's recorded kind: a kind-mismatched link must not
            // strand a whole subtree.
            match txn.get(removed.child)? {
                Some(OverlayEntry::Tree(_)) => txn.remove_subtree(removed.child)?,
                Some(OverlayEntry::File(_)) | None => txn.remove(removed.child),
            }
            txn.commit()
        })();
        self.track(result)
    }

    /// Resolve `name` under `parent` to an inode identity
    pub fn lookup_child(&self, parent: InodeId, name: &str) -> Result<InodeId> {
        self.guard_read()?;
        let entry = self
            .store
            .get_entry(parent)?
            .ok_or(Error::NotFound(parent))?;
        let tree = entry.as_tree(parent)?;
        tree.get(name)
            .map(|link| link.child)
            .ok_or_else(|| Error::NameNotFound {
                parent,
                name: name.to_string(),
            })
    }

    /// All child links of a tree, in listing order
    pub fn list_children(&self, parent: InodeId) -> Result<Vec<DirEntry>> {
        self.guard_read()?;
        let entry = self
            .store
            .get_entry(parent)?
            .ok_or(Error::NotFound(parent))?;
        Ok(entry.as_tree(parent)?.children().to_vec())
    }

    /// Read a file's payload or external reference
    pub fn read_file(&self, id: InodeId) -> Result<FileContent> {
        self.guard_read()?;
        let entry = self.store.get_entry(id)?.ok_or(Error::NotFound(id))?;
        Ok(entry.as_file(id)?.content.clone())
    }

    /// Read-only inspection of one entry's overlay state. Never
    /// mutates anything.
    pub fn entry_status(&self, id: InodeId) -> Result<EntryStatus> {
        self.guard_read()?;
        let entry = self.store.get_entry(id)?.ok_or(Error::NotFound(id))?;
        Ok(match &entry {
            OverlayEntry::Tree(tree) => EntryStatus {
                ino: id,
                kind: EntryKind::Tree,
                dirty: false,
                inline: false,
                size: 0,
                child_count: tree.len(),
                content_hash: None,
            },
            OverlayEntry::File(file) => EntryStatus {
                ino: id,
                kind: entry.kind(),
                dirty: file.dirty,
                inline: matches!(file.content, FileContent::Inline(_)),
                size: file.size(),
                child_count: 0,
                content_hash: Some(file.content_hash()),
            },
        })
    }

    /// Run the consistency scanner while holding the structural lock,
    /// so no mutation can interleave with the walk. A `Repair` scan
    /// mutates the store and is refused on a degraded session.
    pub fn scan(&self, mode: ScanMode) -> Result<ScanReport> {
        match mode {
            ScanMode::Repair => self.guard_mutation()?,
            ScanMode::ReportOnly => self.guard_read()?,
        }
        let _guard = self.struct_lock.lock();
        let result = scanner::scan(&self.store, mode);
        self.track(result)
    }
}
