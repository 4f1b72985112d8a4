use std::{
    collections::HashMap,
    ops::Deref,
    sync::{Arc, Mutex},
};

use crate::{exec_identity::ExecIdentity, file_tracking::FileKey, report, sync::lock};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedFile {
    pub path: Option<Arc<str>>,
    pub is_special: bool,
}

/// Files currently open by the processes running one exec image.
#[derive(Debug, Default)]
pub struct FileTree {
    files: Mutex<HashMap<FileKey, TrackedFile>>,
}

impl FileTree {
    /// Returns false if the key was already listed.
    pub fn insert(&self, key: FileKey, path: Option<Arc<str>>, is_special: bool) -> bool {
        let mut files = lock(&self.files);
        if files.contains_key(&key) {
            return false;
        }
        files.insert(key, TrackedFile { path, is_special });
        true
    }

    pub fn remove(&self, key: &FileKey) -> bool {
        lock(&self.files).remove(key).is_some()
    }

    pub fn contains(&self, key: &FileKey) -> bool {
        lock(&self.files).contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.files).is_empty()
    }

    pub fn len(&self) -> usize {
        lock(&self.files).len()
    }

    /// Copy of the tree ordered by key.
    pub fn snapshot(&self) -> Vec<(FileKey, TrackedFile)> {
        let mut files: Vec<_> = lock(&self.files)
            .iter()
            .map(|(key, file)| (*key, file.clone()))
            .collect();
        files.sort_by_key(|(key, _)| *key);
        files
    }

    /// Empty the tree through exclusive access.
    pub(crate) fn drain(&mut self) -> Vec<FileKey> {
        self.files
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .drain()
            .map(|(key, _)| key)
            .collect()
    }
}

/// Keeps an exec identity alive while its tree is being inspected.
pub struct FileTreeHandle {
    identity: Arc<ExecIdentity>,
}

impl FileTreeHandle {
    pub(crate) fn new(identity: Arc<ExecIdentity>) -> Self {
        Self { identity }
    }

    pub fn identity(&self) -> &Arc<ExecIdentity> {
        &self.identity
    }
}

impl Deref for FileTreeHandle {
    type Target = FileTree;

    fn deref(&self) -> &FileTree {
        self.identity.tracked_files()
    }
}

/// Render one tree with the file table columns.
pub fn show_tree(tree: &FileTree) -> String {
    let mut out = String::new();
    report::file_header(&mut out);
    for (key, file) in tree.snapshot() {
        report::file_row(
            &mut out,
            file.path.as_deref().unwrap_or(""),
            key.device,
            key.inode,
            key.pid,
            file.is_special,
        );
    }
    out
}
