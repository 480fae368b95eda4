//! Inode numbers handed to the kernel.
//!
//! Numbers are allocated here rather than taken from the fast store, because
//! a promote replaces the fast-store entry with a new indirection record.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::path::VirtualPath;

pub const ROOT_INO: u64 = 1;

#[derive(Debug)]
struct InodeEntry {
    /// `None` once the path has been unlinked while the kernel still holds it.
    path: Option<VirtualPath>,
    lookup_count: u64,
}

#[derive(Debug)]
struct Inner {
    inodes: HashMap<u64, InodeEntry>,
    path_to_ino: HashMap<VirtualPath, u64>,
    next_ino: u64,
}

#[derive(Debug)]
pub struct InodeTable {
    inner: Mutex<Inner>,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    pub fn new() -> Self {
        let root = VirtualPath::root();
        let mut inodes = HashMap::new();
        inodes.insert(
            ROOT_INO,
            InodeEntry {
                path: Some(root.clone()),
                lookup_count: 1,
            },
        );
        let mut path_to_ino = HashMap::new();
        path_to_ino.insert(root, ROOT_INO);
        Self {
            inner: Mutex::new(Inner {
                inodes,
                path_to_ino,
                next_ino: ROOT_INO + 1,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn path_of(&self, ino: u64) -> Option<VirtualPath> {
        self.lock().inodes.get(&ino).and_then(|e| e.path.clone())
    }

    /// Inode for `path`, counting one kernel lookup.
    pub fn lookup(&self, path: &VirtualPath) -> u64 {
        let mut inner = self.lock();
        if let Some(&ino) = inner.path_to_ino.get(path) {
            if let Some(entry) = inner.inodes.get_mut(&ino) {
                entry.lookup_count += 1;
            }
            return ino;
        }
        let ino = inner.next_ino;
        inner.next_ino += 1;
        inner.inodes.insert(
            ino,
            InodeEntry {
                path: Some(path.clone()),
                lookup_count: 1,
            },
        );
        inner.path_to_ino.insert(path.clone(), ino);
        ino
    }

    /// Inode already known for `path`, without counting a lookup.
    pub fn peek(&self, path: &VirtualPath) -> Option<u64> {
        self.lock().path_to_ino.get(path).copied()
    }

    pub fn forget(&self, ino: u64, nlookup: u64) {
        if ino == ROOT_INO {
            return;
        }
        let mut inner = self.lock();
        let Some(entry) = inner.inodes.get_mut(&ino) else {
            return;
        };
        entry.lookup_count = entry.lookup_count.saturating_sub(nlookup);
        if entry.lookup_count > 0 {
            return;
        }
        if let Some(entry) = inner.inodes.remove(&ino) {
            if let Some(path) = entry.path {
                if inner.path_to_ino.get(&path) == Some(&ino) {
                    inner.path_to_ino.remove(&path);
                }
            }
        }
    }

    /// Detach `path` after an unlink or rmdir.
    pub fn remove(&self, path: &VirtualPath) {
        let mut inner = self.lock();
        if let Some(ino) = inner.path_to_ino.remove(path) {
            if let Some(entry) = inner.inodes.get_mut(&ino) {
                entry.path = None;
            }
        }
    }

    /// Move `from` and everything below it to `to`; whatever `to` named
    /// before is detached.
    pub fn rename(&self, from: &VirtualPath, to: &VirtualPath) {
        if from == to {
            return;
        }
        let mut inner = self.lock();
        let replaced: Vec<VirtualPath> = inner
            .path_to_ino
            .keys()
            .filter(|p| p.starts_with(to))
            .cloned()
            .collect();
        for path in replaced {
            if let Some(ino) = inner.path_to_ino.remove(&path) {
                if let Some(entry) = inner.inodes.get_mut(&ino) {
                    entry.path = None;
                }
            }
        }

        let moved: Vec<(VirtualPath, u64)> = inner
            .path_to_ino
            .iter()
            .filter(|(p, _)| p.starts_with(from))
            .map(|(p, &ino)| (p.clone(), ino))
            .collect();
        for (old, ino) in moved {
            let Some(new) = old.rebase(from, to) else {
                continue;
            };
            inner.path_to_ino.remove(&old);
            inner.path_to_ino.insert(new.clone(), ino);
            if let Some(entry) = inner.inodes.get_mut(&ino) {
                entry.path = Some(new);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().inodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
