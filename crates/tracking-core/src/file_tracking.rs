//! Table of files currently open, keyed by the observing process and the
//! file identity.

use std::{
    cmp::Ordering as CmpOrdering,
    ops::ControlFlow,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use sensor_common::Pid;

use crate::{
    report,
    store::{Insert, Keyed, Ref, Store},
    sync::lock,
};

/// A given (device, inode) pair as seen by one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileKey {
    pub pid: Pid,
    pub device: u64,
    pub inode: u64,
}

impl FileKey {
    pub fn new(pid: Pid, device: u64, inode: u64) -> Self {
        Self { pid, device, inode }
    }

    fn as_tuple(&self) -> (i32, u64, u64) {
        (self.pid.as_raw(), self.device, self.inode)
    }
}

impl Ord for FileKey {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.as_tuple().cmp(&other.as_tuple())
    }
}

impl PartialOrd for FileKey {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    Opened,
    Closed,
}

#[derive(Debug)]
pub struct FileProcessValue {
    key: FileKey,
    path: Option<Arc<str>>,
    is_special: bool,
    did_read_type: AtomicBool,
    status: Mutex<FileStatus>,
}

impl FileProcessValue {
    fn new(key: FileKey, path: Option<&str>, is_special: bool) -> Self {
        Self {
            key,
            path: path.map(Arc::from),
            is_special,
            did_read_type: AtomicBool::new(false),
            status: Mutex::new(FileStatus::Opened),
        }
    }

    pub fn file_key(&self) -> FileKey {
        self.key
    }

    pub fn path(&self) -> Option<&Arc<str>> {
        self.path.as_ref()
    }

    pub fn is_special(&self) -> bool {
        self.is_special
    }

    pub fn status(&self) -> FileStatus {
        *lock(&self.status)
    }

    pub fn did_read_type(&self) -> bool {
        self.did_read_type.load(Ordering::Acquire)
    }

    /// Mark the file type as inspected. Returns the previous value.
    pub fn set_did_read_type(&self) -> bool {
        self.did_read_type.swap(true, Ordering::AcqRel)
    }
}

impl Keyed for FileProcessValue {
    type Key = FileKey;

    fn key(&self) -> FileKey {
        self.key
    }
}

impl Drop for FileProcessValue {
    fn drop(&mut self) {
        log::trace!(
            "FILE-DEL {} {}:{} {}",
            self.key.pid,
            self.key.device,
            self.key.inode,
            self.path.as_deref().unwrap_or("")
        );
    }
}

pub struct FileTracker {
    table: Store<FileProcessValue>,
}

impl FileTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            table: Store::new("file-tracking", capacity),
        }
    }

    /// Create-or-fetch the entry for `(pid, device, inode)`. An existing
    /// entry is returned as is: `path` and `is_special` only apply to a new
    /// entry.
    pub fn open(
        &self,
        pid: Pid,
        device: u64,
        inode: u64,
        path: Option<&str>,
        is_special: bool,
    ) -> Ref<FileProcessValue> {
        let key = FileKey::new(pid, device, inode);
        if let Some(existing) = self.table.get(&key) {
            return existing;
        }
        match self
            .table
            .insert(FileProcessValue::new(key, path, is_special))
        {
            Insert::Inserted(entry) => {
                log::trace!(
                    "FILE-INS {pid} {device}:{inode} {}",
                    path.unwrap_or("")
                );
                entry
            }
            Insert::Raced(winner) => winner,
        }
    }

    pub fn get(&self, pid: Pid, device: u64, inode: u64) -> Option<Ref<FileProcessValue>> {
        self.table.get(&FileKey::new(pid, device, inode))
    }

    /// Remove the entry, releasing the table's own reference. Returns false
    /// if nothing was tracked for this key.
    pub fn close(&self, pid: Pid, device: u64, inode: u64) -> bool {
        self.close_key(&FileKey::new(pid, device, inode))
    }

    pub fn close_key(&self, key: &FileKey) -> bool {
        match self.table.remove(key) {
            Some(entry) => {
                *lock(&entry.status) = FileStatus::Closed;
                true
            }
            None => false,
        }
    }

    pub fn put_ref(&self, entry: Ref<FileProcessValue>) {
        entry.put();
    }

    pub fn for_each<F>(&self, visitor: F) -> ControlFlow<()>
    where
        F: FnMut(&Ref<FileProcessValue>) -> ControlFlow<()>,
    {
        self.table.for_each(visitor)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Fixed-width dump of every tracked file, ordered by key.
    pub fn show_table(&self) -> String {
        let mut entries = self.table.snapshot();
        entries.sort_by_key(|entry| entry.file_key());

        let mut out = String::new();
        report::file_header(&mut out);
        for entry in entries {
            report::file_row(
                &mut out,
                entry.path().map(|p| &**p).unwrap_or(""),
                entry.key.device,
                entry.key.inode,
                entry.key.pid,
                entry.is_special(),
            );
        }
        out
    }

    pub fn shutdown(&self) {
        self.table.shutdown(|_, _| {});
    }
}
