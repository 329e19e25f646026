//! Consistency scanner
//!
//! Walks the directory graph from the root and compares it against the
//! full set of stored entries. Three findings:
//!
//! - orphans: stored entries unreachable from the root
//! - dangling: child links whose target entry is absent
//! - cycles: a tree reachable from itself through its descendants
//!
//! Repair deletes orphans only. Parentage is never guessed, so nothing
//! is reattached; dangling links are reported but left for an operator
//! to confirm, since removing them changes directory listings users
//! can see. The scanner requires exclusive access: either the session's
//! structural lock or a store no live session holds.

use crate::error::{Error, Result};
use crate::overlay::entry::{InodeId, OverlayEntry, ROOT_ID};
use crate::overlay::store::OverlayStore;
use std::collections::HashSet;
use tracing::{info, warn};

/// Scan behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    /// Report findings, change nothing
    ReportOnly,
    /// Report findings and delete orphaned entries
    Repair,
}

/// A child link whose target entry does not exist
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DanglingRef {
    pub parent: InodeId,
    pub name: String,
    pub target: InodeId,
}

/// Findings of one scan
#[derive(Debug, Default)]
pub struct ScanReport {
    /// Entries physically present in the store
    pub stored: usize,
    /// Entries reached from the root
    pub reachable: usize,
    /// Stored but unreachable identities
    pub orphans: Vec<InodeId>,
    /// Child links with a missing target
    pub dangling: Vec<DanglingRef>,
    /// Tree identities at which a cycle was closed
    pub cycles: Vec<InodeId>,
    /// Orphans deleted (Repair mode)
    pub repaired: usize,
}

impl ScanReport {
    /// No structural issues found
    pub fn is_clean(&self) -> bool {
        self.orphans.is_empty() && self.dangling.is_empty() && self.cycles.is_empty()
    }
}

enum Frame {
    Enter(InodeId),
    Exit(InodeId),
}

/// Walk the overlay from the root, visiting every reachable identity
/// exactly once, and reconcile against the stored entry set.
pub fn scan(store: &OverlayStore, mode: ScanMode) -> Result<ScanReport> {
    match store.get_entry(ROOT_ID)? {
        Some(OverlayEntry::Tree(_)) => {}
        Some(_) => return Err(Error::Corruption("root entry is not a tree".to_string())),
        None => return Err(Error::Corruption("root entry missing".to_string())),
    }

    let mut report = ScanReport::default();
    let mut visited: HashSet<InodeId> = HashSet::new();
    let mut on_path: HashSet<InodeId> = HashSet::new();
    let mut stack = vec![Frame::Enter(ROOT_ID)];

    while let Some(frame) = stack.pop() {
        match frame {
            Frame::Exit(id) => {
                on_path.remove(&id);
            }
            Frame::Enter(id) => {
                if on_path.contains(&id) {
                    // Back edge: this tree is its own descendant
                    report.cycles.push(id);
                    continue;
                }
                if !visited.insert(id) {
                    continue;
                }
                let entry = match store.get_entry(id)? {
                    Some(e) => e,
                    // Presence was checked at the referencing edge;
                    // absent here means it raced nothing (we hold the
                    // exclusive lock), so treat as already counted.
                    None => continue,
                };
                if let OverlayEntry::Tree(tree) = &entry {
                    on_path.insert(id);
                    stack.push(Frame::Exit(id));
                    for link in tree.children() {
                        if store.contains(link.child)? {
                            stack.push(Frame::Enter(link.child));
                        } else {
                            report.dangling.push(DanglingRef {
                                parent: id,
                                name: link.name.clone(),
                                target: link.child,
                            });
                        }
                    }
                }
            }
        }
    }

    report.reachable = visited.len();
    for id in store.iter_ids() {
        let id = id?;
        report.stored += 1;
        if !visited.contains(&id) {
            report.orphans.push(id);
        }
    }
    report.orphans.sort_unstable();

    if !report.is_clean() {
        warn!(
            orphans = report.orphans.len(),
            dangling = report.dangling.len(),
            cycles = report.cycles.len(),
            "scan found structural issues"
        );
    }

    if mode == ScanMode::Repair && !report.orphans.is_empty() {
        let mut txn = store.begin();
        for &id in &report.orphans {
            txn.remove(id);
        }
        txn.commit()?;
        report.repaired = report.orphans.len();
        info!(removed = report.repaired, "deleted orphaned entries");
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OverlayConfig;
    use crate::overlay::entry::{DirEntry, EntryKind, FileContent, FileEntry, FileKind, TreeEntry};
    use std::path::Path;

    fn open_store(dir: &Path) -> OverlayStore {
        OverlayStore::open(dir, &OverlayConfig::default()).unwrap()
    }

    fn file_entry() -> OverlayEntry {
        OverlayEntry::File(FileEntry {
            kind: FileKind::Regular,
            content: FileContent::Inline(b"x".to_vec()),
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
    fn test_clean_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let report = scan(&store, ScanMode::ReportOnly).unwrap();
        assert!(report.is_clean());
        assert_eq!(report.stored, 1);
        assert_eq!(report.reachable, 1);
    }

    #[test]
    fn test_orphan_detection() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        store.put_entry(50, &file_entry()).unwrap();
        let report = scan(&store, ScanMode::ReportOnly).unwrap();
        assert_eq!(report.orphans, vec![50]);

        // ReportOnly changed nothing
        assert!(store.get_entry(50).unwrap().is_some());
    }

    #[test]
    fn test_dangling_detection() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        store
            .put_entry(ROOT_ID, &tree_with(&[("ghost", 77, EntryKind::File)]))
            .unwrap();

        let report = scan(&store, ScanMode::ReportOnly).unwrap();
        assert_eq!(
            report.dangling,
            vec![DanglingRef {
                parent: ROOT_ID,
                name: "ghost".to_string(),
                target: 77,
            }]
        );
    }

    #[test]
    fn test_cycle_detection() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        // root -> a(2) -> b(3) -> back to 2
        store
            .put_entry(ROOT_ID, &tree_with(&[("a", 2, EntryKind::Tree)]))
            .unwrap();
        store
            .put_entry(2, &tree_with(&[("b", 3, EntryKind::Tree)]))
            .unwrap();
        store
            .put_entry(3, &tree_with(&[("back", 2, EntryKind::Tree)]))
            .unwrap();

        let report = scan(&store, ScanMode::ReportOnly).unwrap();
        assert_eq!(report.cycles, vec![2]);
    }

    #[test]
    fn test_repair_removes_exactly_the_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        // Reachable: root -> kept(2). Orphans: 60 (a tree) and 61.
        store
            .put_entry(ROOT_ID, &tree_with(&[("kept", 2, EntryKind::File)]))
            .unwrap();
        store.put_entry(2, &file_entry()).unwrap();
        store
            .put_entry(60, &tree_with(&[("lost", 61, EntryKind::File)]))
            .unwrap();
        store.put_entry(61, &file_entry()).unwrap();

        let report = scan(&store, ScanMode::Repair).unwrap();
        assert_eq!(report.orphans, vec![60, 61]);
        assert_eq!(report.repaired, 2);

        assert!(store.get_entry(60).unwrap().is_none());
        assert!(store.get_entry(61).unwrap().is_none());
        // Reachable entries untouched
        assert!(store.get_entry(2).unwrap().is_some());
        assert!(store.get_entry(ROOT_ID).unwrap().is_some());

        // A second scan comes back clean
        assert!(scan(&store, ScanMode::ReportOnly).unwrap().is_clean());
    }

    #[test]
    fn test_repair_leaves_dangling_links_alone() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        store
            .put_entry(ROOT_ID, &tree_with(&[("ghost", 77, EntryKind::File)]))
            .unwrap();

        let report = scan(&store, ScanMode::Repair).unwrap();
        assert_eq!(report.dangling.len(), 1);
        assert_eq!(report.repaired, 0);

        // The link is still there for the operator to decide on
        let root = store.get_entry(ROOT_ID).unwrap().unwrap();
        assert!(root.as_tree(ROOT_ID).unwrap().get("ghost").is_some());
    }

    #[test]
    fn test_non_tree_root_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        // Clobber the root with a file entry
        store.put_entry(ROOT_ID, &file_entry()).unwrap();
        assert!(matches!(
            scan(&store, ScanMode::ReportOnly),
            Err(Error::Corruption(_))
        ));
    }
}
