//! Durable overlay store
//!
//! One sled database per overlay instance, holding two trees:
//! `entries` (inode identity -> bincode-encoded entry) and `meta`
//! (schema version, identity watermark). Multi-entry mutations are
//! staged in a [`Transaction`] and applied through a single sled
//! transaction, so a crash mid-operation leaves either all of the
//! staged writes or none of them.
//!
//! sled holds an exclusive file lock on the instance directory, which
//! gives the one-writer-process discipline: a second concurrent open
//! of the same path fails fast instead of corrupting shared state.

use crate::config::OverlayConfig;
use crate::error::{Error, Result};
use crate::overlay::entry::{InodeId, OverlayEntry, ROOT_ID};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

/// Current on-disk schema version
pub const SCHEMA_VERSION: u32 = 1;

const ENTRIES_TREE: &[u8] = b"entries";
const META_TREE: &[u8] = b"meta";
const META_SCHEMA: &[u8] = b"schema_version";
const META_ID_FLOOR: &[u8] = b"id_floor";

/// Durable mapping from inode identity to overlay entry
#[derive(Debug)]
pub struct OverlayStore {
    db: sled::Db,
    entries: sled::Tree,
    meta: sled::Tree,
    sync_on_commit: bool,
}

fn encode_key(id: InodeId) -> [u8; 8] {
    id.to_be_bytes()
}

fn decode_key(raw: &[u8]) -> Result<InodeId> {
    let bytes: [u8; 8] = raw
        .try_into()
        .map_err(|_| Error::Corruption(format!("malformed entry key of {} bytes", raw.len())))?;
    Ok(InodeId::from_be_bytes(bytes))
}

fn decode_entry(raw: &[u8]) -> Result<OverlayEntry> {
    bincode::deserialize(raw).map_err(|e| Error::Deserialization(e.to_string()))
}

impl OverlayStore {
    /// Open the overlay store at `path`, initializing a fresh instance
    /// if none exists yet.
    ///
    /// A fresh store gets the current schema version and a root tree
    /// entry. An existing store with a different schema version fails
    /// with `SchemaIncompatible`; bytes are never silently
    /// reinterpreted across versions.
    pub fn open(path: &Path, config: &OverlayConfig) -> Result<Self> {
        Self::open_inner(path, config, true)
    }

    /// Open an existing overlay store, failing if `path` holds no
    /// initialized instance. Inspection tooling uses this so a typo'd
    /// path can never silently create a fresh overlay.
    pub fn open_existing(path: &Path, config: &OverlayConfig) -> Result<Self> {
        Self::open_inner(path, config, false)
    }

    fn open_inner(path: &Path, config: &OverlayConfig, create: bool) -> Result<Self> {
        if !create && !path.exists() {
            return Err(Error::StoreUnavailable(format!(
                "no overlay instance at {}",
                path.display()
            )));
        }
        let db = sled::open(path)
            .map_err(|e| Error::StoreUnavailable(format!("open {}: {}", path.display(), e)))?;
        let entries = db.open_tree(ENTRIES_TREE)?;
        let meta = db.open_tree(META_TREE)?;

        let fresh = match meta.get(META_SCHEMA)? {
            Some(raw) => {
                let bytes: [u8; 4] = raw.as_ref().try_into().map_err(|_| {
                    Error::Corruption("malformed schema version marker".to_string())
                })?;
                let found = u32::from_be_bytes(bytes);
                if found != SCHEMA_VERSION {
                    return Err(Error::SchemaIncompatible {
                        found,
                        expected: SCHEMA_VERSION,
                    });
                }
                false
            }
            None => {
                if !create {
                    return Err(Error::StoreUnavailable(format!(
                        "{} is not an initialized overlay",
                        path.display()
                    )));
                }
                meta.insert(META_SCHEMA, &SCHEMA_VERSION.to_be_bytes()[..])?;
                true
            }
        };

        let store = OverlayStore {
            db,
            entries,
            meta,
            sync_on_commit: config.sync_on_commit,
        };

        if store.get_entry(ROOT_ID)?.is_none() {
            if fresh {
                info!(path = %path.display(), "initializing fresh overlay store");
                store.put_entry(ROOT_ID, &OverlayEntry::empty_tree())?;
            } else {
                return Err(Error::Corruption("root entry missing".to_string()));
            }
        }
        if fresh {
            store.db.flush()?;
        }

        Ok(store)
    }

    /// Begin a scoped transaction
    pub fn begin(&self) -> Transaction<'_> {
        Transaction {
            store: self,
            staged: BTreeMap::new(),
        }
    }

    /// Read one entry from committed state
    pub fn get_entry(&self, id: InodeId) -> Result<Option<OverlayEntry>> {
        match self.entries.get(encode_key(id))? {
            Some(raw) => Ok(Some(decode_entry(&raw)?)),
            None => Ok(None),
        }
    }

    /// Whether an entry exists in committed state
    pub fn contains(&self, id: InodeId) -> Result<bool> {
        Ok(self.entries.contains_key(encode_key(id))?)
    }

    /// Insert or overwrite one entry
    pub fn put_entry(&self, id: InodeId, entry: &OverlayEntry) -> Result<()> {
        let mut txn = self.begin();
        txn.put(id, entry.clone());
        txn.commit()
    }

    /// Delete one entry. The caller must have already removed every
    /// reference to `id` from parent trees, either beforehand or (for
    /// linked entries) within one [`Transaction`] instead of through
    /// this one-shot form.
    pub fn remove_entry(&self, id: InodeId) -> Result<()> {
        let mut txn = self.begin();
        txn.remove(id);
        txn.commit()
    }

    /// Recursively delete `id` and every descendant reachable through
    /// it, atomically. Already-missing descendants are skipped, so a
    /// retry after a failure is harmless.
    pub fn remove_subtree(&self, id: InodeId) -> Result<()> {
        let mut txn = self.begin();
        txn.remove_subtree(id)?;
        txn.commit()
    }

    /// Number of stored entries
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Iterate over every stored inode identity
    pub fn iter_ids(&self) -> impl Iterator<Item = Result<InodeId>> + '_ {
        self.entries.iter().map(|item| {
            let (key, _) = item?;
            decode_key(&key)
        })
    }

    /// Read the persisted identity watermark: the lowest identity the
    /// allocator may hand out
    pub fn id_floor(&self) -> Result<InodeId> {
        match self.meta.get(META_ID_FLOOR)? {
            Some(raw) => decode_key(&raw),
            None => Ok(ROOT_ID + 1),
        }
    }

    /// Persist a new identity watermark. Flushed unconditionally: the
    /// watermark must be durable before any identity below it is
    /// handed out, or a crash could reissue identities.
    pub fn persist_id_floor(&self, floor: InodeId) -> Result<()> {
        self.meta.insert(META_ID_FLOOR, &floor.to_be_bytes()[..])?;
        self.db.flush()?;
        Ok(())
    }

    /// Flush all pending writes to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    /// Apply a staged write-set in one sled transaction
    fn apply(&self, staged: &BTreeMap<InodeId, Option<OverlayEntry>>) -> Result<()> {
        if staged.is_empty() {
            return Ok(());
        }
        if staged.get(&ROOT_ID).map_or(false, |op| op.is_none()) {
            return Err(Error::Corruption(
                "refusing to delete the root entry".to_string(),
            ));
        }

        // Encode outside the closure; sled may retry it on conflict.
        let mut ops: Vec<([u8; 8], Option<Vec<u8>>)> = Vec::with_capacity(staged.len());
        for (id, op) in staged {
            let encoded = match op {
                Some(entry) => Some(
                    bincode::serialize(entry).map_err(|e| Error::Serialization(e.to_string()))?,
                ),
                None => None,
            };
            ops.push((encode_key(*id), encoded));
        }

        let result: sled::transaction::TransactionResult<(), Error> =
            self.entries.transaction(|tx| {
                for (key, op) in &ops {
                    match op {
                        Some(bytes) => {
                            tx.insert(&key[..], bytes.clone())?;
                        }
                        None => {
                            tx.remove(&key[..])?;
                        }
                    }
                }
                Ok(())
            });
        result?;

        if self.sync_on_commit {
            self.db.flush()?;
        }
        debug!(writes = ops.len(), "committed overlay transaction");
        Ok(())
    }
}

/// Scoped write-set over the store.
///
/// Reads through the transaction observe staged writes first, then
/// committed state. Nothing touches disk until [`commit`]; dropping
/// the transaction on any error path is a complete rollback.
///
/// [`commit`]: Transaction::commit
pub struct Transaction<'a> {
    store: &'a OverlayStore,
    staged: BTreeMap<InodeId, Option<OverlayEntry>>,
}

impl Transaction<'_> {
    /// Read an entry, staged writes taking precedence
    pub fn get(&self, id: InodeId) -> Result<Option<OverlayEntry>> {
        if let Some(staged) = self.staged.get(&id) {
            return Ok(staged.clone());
        }
        self.store.get_entry(id)
    }

    /// Stage an insert or overwrite
    pub fn put(&mut self, id: InodeId, entry: OverlayEntry) {
        self.staged.insert(id, Some(entry));
    }

    /// Stage a deletion. The same transaction must also remove every
    /// parent-tree reference to `id`.
    pub fn remove(&mut self, id: InodeId) {
        self.staged.insert(id, None);
    }

    /// Stage deletion of `id` and all of its stored descendants.
    /// Missing descendants are skipped.
    pub fn remove_subtree(&mut self, id: InodeId) -> Result<()> {
        let mut stack = vec![id];
        while let Some(cur) = stack.pop() {
            let entry = match self.get(cur)? {
                Some(e) => e,
                None => continue,
            };
            if let OverlayEntry::Tree(tree) = &entry {
                for link in tree.children() {
                    stack.push(link.child);
                }
            }
            self.remove(cur);
        }
        Ok(())
    }

    /// Number of staged writes
    pub fn len(&self) -> usize {
        self.staged.len()
    }

    /// Whether the transaction has no staged writes
    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    /// Atomically apply every staged write; durable once this returns
    pub fn commit(self) -> Result<()> {
        self.store.apply(&self.staged)
    }

    /// Discard all staged writes. Equivalent to dropping the
    /// transaction; present so abort paths read explicitly.
    pub fn rollback(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::entry::{DirEntry, EntryKind, FileContent, FileEntry, FileKind, TreeEntry};

    fn open_store(dir: &Path) -> OverlayStore {
        OverlayStore::open(dir, &OverlayConfig::default()).unwrap()
    }

    fn file_entry(data: &[u8]) -> OverlayEntry {
        OverlayEntry::File(FileEntry {
            kind: FileKind::Regular,
            content: FileContent::Inline(data.to_vec()),
            dirty: true,
        })
    }

    fn tree_with(children: &[(&str, InodeId, EntryKind)]) -> OverlayEntry {
        let mut tree = TreeEntry::new();
        for (name, child, kind) in children {
            tree.insert(
                0,
                DirEntry {
                    name: name.to_string(),
                    child: *child,
                    kind: *kind,
                },
            )
            .unwrap();
        }
        OverlayEntry::Tree(tree)
    }

    #[test]
    fn test_open_creates_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let root = store.get_entry(ROOT_ID).unwrap().unwrap();
        assert!(root.is_tree());
        assert_eq!(store.entry_count(), 1);
    }

    #[test]
    fn test_put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let entry = file_entry(b"payload");
        store.put_entry(7, &entry).unwrap();
        assert_eq!(store.get_entry(7).unwrap().unwrap(), entry);
        assert!(store.get_entry(8).unwrap().is_none());
    }

    #[test]
    fn test_dropped_transaction_has_no_effect() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let mut txn = store.begin();
        txn.put(5, file_entry(b"uncommitted"));
        txn.put(6, file_entry(b"uncommitted"));
        assert_eq!(txn.len(), 2);
        drop(txn);

        assert!(store.get_entry(5).unwrap().is_none());
        assert!(store.get_entry(6).unwrap().is_none());

        // Same through a process restart
        drop(store);
        let store = open_store(dir.path());
        assert!(store.get_entry(5).unwrap().is_none());
    }

    #[test]
    fn test_transaction_reads_staged_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        store.put_entry(5, &file_entry(b"old")).unwrap();

        let mut txn = store.begin();
        txn.put(5, file_entry(b"new"));
        txn.remove(9);
        assert_eq!(txn.get(5).unwrap().unwrap(), file_entry(b"new"));
        assert!(txn.get(9).unwrap().is_none());

        // Committed state unchanged until commit
        assert_eq!(store.get_entry(5).unwrap().unwrap(), file_entry(b"old"));
        txn.commit().unwrap();
        assert_eq!(store.get_entry(5).unwrap().unwrap(), file_entry(b"new"));
    }

    #[test]
    fn test_entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open_store(dir.path());
            store.put_entry(2, &file_entry(b"persisted")).unwrap();
        }
        let store = open_store(dir.path());
        assert_eq!(store.get_entry(2).unwrap().unwrap(), file_entry(b"persisted"));
    }

    #[test]
    fn test_remove_subtree_is_complete_and_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        // root -> dir(2) -> {a(3), sub(4) -> b(5)}
        store
            .put_entry(ROOT_ID, &tree_with(&[("dir", 2, EntryKind::Tree)]))
            .unwrap();
        store
            .put_entry(
                2,
                &tree_with(&[("a", 3, EntryKind::File), ("sub", 4, EntryKind::Tree)]),
            )
            .unwrap();
        store.put_entry(3, &file_entry(b"a")).unwrap();
        store
            .put_entry(4, &tree_with(&[("b", 5, EntryKind::File)]))
            .unwrap();
        store.put_entry(5, &file_entry(b"b")).unwrap();

        store.remove_subtree(2).unwrap();
        for id in 2..=5 {
            assert!(store.get_entry(id).unwrap().is_none(), "id {id} survived");
        }

        // Second run over the missing subtree is a no-op
        store.remove_subtree(2).unwrap();
    }

    #[test]
    fn test_remove_subtree_skips_dangling_children() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        store
            .put_entry(2, &tree_with(&[("ghost", 99, EntryKind::File)]))
            .unwrap();
        store.remove_subtree(2).unwrap();
        assert!(store.get_entry(2).unwrap().is_none());
    }

    #[test]
    fn test_root_deletion_refused() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let mut txn = store.begin();
        txn.remove(ROOT_ID);
        assert!(matches!(txn.commit(), Err(Error::Corruption(_))));
        assert!(store.get_entry(ROOT_ID).unwrap().is_some());

        assert!(store.remove_subtree(ROOT_ID).is_err());
    }

    #[test]
    fn test_schema_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open_store(dir.path());
            drop(store);
        }
        {
            // Forge a future schema version directly in the meta tree
            let db = sled::open(dir.path()).unwrap();
            let meta = db.open_tree(META_TREE).unwrap();
            meta.insert(META_SCHEMA, &99u32.to_be_bytes()[..]).unwrap();
            db.flush().unwrap();
        }
        let err = OverlayStore::open(dir.path(), &OverlayConfig::default()).unwrap_err();
        assert!(matches!(
            err,
            Error::SchemaIncompatible {
                found: 99,
                expected: SCHEMA_VERSION
            }
        ));
    }

    #[test]
    fn test_exclusive_open() {
        let dir = tempfile::tempdir().unwrap();
        let _store = open_store(dir.path());

        let second = OverlayStore::open(dir.path(), &OverlayConfig::default());
        assert!(matches!(second, Err(Error::StoreUnavailable(_))));
    }

    #[test]
    fn test_open_existing_requires_initialized_store() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("no-such-overlay");

        let result = OverlayStore::open_existing(&missing, &OverlayConfig::default());
        assert!(matches!(result, Err(Error::StoreUnavailable(_))));
        // The failed open must not have created anything
        assert!(!missing.exists());

        // Once initialized, open_existing finds it
        drop(open_store(dir.path()));
        let store = OverlayStore::open_existing(dir.path(), &OverlayConfig::default()).unwrap();
        assert_eq!(store.entry_count(), 1);
    }

    #[test]
    fn test_aborted_rename_leaves_prior_links_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open_store(dir.path());
            // root -> {p1(2), p2(3)}, p1 -> {a(4)}, p2 empty
            store
                .put_entry(
                    ROOT_ID,
                    &tree_with(&[("p1", 2, EntryKind::Tree), ("p2", 3, EntryKind::Tree)]),
                )
                .unwrap();
            store
                .put_entry(2, &tree_with(&[("a", 4, EntryKind::File)]))
                .unwrap();
            store.put_entry(3, &tree_with(&[])).unwrap();
            store.put_entry(4, &file_entry(b"moved?")).unwrap();

            // Stage the two-parent move of "a" to p2/"b", then crash
            // before commit
            let mut txn = store.begin();
            txn.put(2, tree_with(&[]));
            txn.put(3, tree_with(&[("b", 4, EntryKind::File)]));
            drop(txn);
        }

        let store = open_store(dir.path());
        let p1 = store.get_entry(2).unwrap().unwrap();
        let p1 = p1.as_tree(2).unwrap();
        assert_eq!(p1.get("a").unwrap().child, 4);

        let p2 = store.get_entry(3).unwrap().unwrap();
        assert!(p2.as_tree(3).unwrap().is_empty());
        assert_eq!(store.get_entry(4).unwrap().unwrap(), file_entry(b"moved?"));
    }

    #[test]
    fn test_id_floor_persistence() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open_store(dir.path());
            assert_eq!(store.id_floor().unwrap(), ROOT_ID + 1);
            store.persist_id_floor(4096).unwrap();
        }
        let store = open_store(dir.path());
        assert_eq!(store.id_floor().unwrap(), 4096);
    }
}
