//! Shared description of an executable image.
//!
//! An [`ExecIdentity`] is never stored in a table: it is reached through the
//! posix identities running the image, through in-flight [`Event`]s and
//! through other identities' stored exit events. Every one of those holds
//! an `Arc`, and the identity is torn down when the last one goes away.
//!
//! Teardown delivers the stored exit event, which is how the last exit of an
//! image is held back until every event referencing the image is gone.
//! Since teardown sends to the sink and touches the file table, an
//! identity must never be dropped while a tracking lock is held.

use std::{
    fmt,
    sync::{
        Arc, Mutex, PoisonError, RwLock,
        atomic::{AtomicI64, Ordering},
    },
};

use crate::{
    context::TrackingContext,
    event::{Event, ProcessDetails},
    file_tree::FileTree,
    sync::{lock, read, write},
};

/// Lineage at the exec boundary.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExecLineage {
    pub exec: ProcessDetails,
    pub exec_parent: ProcessDetails,
    pub exec_grandparent: ProcessDetails,
}

#[derive(Debug, Default)]
struct ImageInfo {
    path: Option<Arc<str>>,
    cmdline: Option<Arc<str>>,
    path_found: bool,
    is_interpreter: bool,
}

/// Result of [`ExecIdentity::release_active`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveRelease {
    /// This was the last process running the image
    Last,
    Remaining,
    /// The counter was already zero
    Underflow,
}

pub struct ExecIdentity {
    ctx: Arc<TrackingContext>,
    lineage: ExecLineage,
    exec_count: u64,
    info: RwLock<ImageInfo>,
    active_process_count: AtomicI64,
    exit_event: Mutex<Option<Event>>,
    tracked_files: FileTree,
}

impl ExecIdentity {
    pub fn new(
        ctx: Arc<TrackingContext>,
        lineage: ExecLineage,
        path: Option<&str>,
        path_found: bool,
        exec_count: u64,
    ) -> Arc<Self> {
        let is_interpreter = path.is_some_and(|path| ctx.config.is_interpreter(path));
        ctx.stats.exec_identity_created();
        Arc::new(Self {
            lineage,
            exec_count,
            info: RwLock::new(ImageInfo {
                path: path.map(Arc::from),
                cmdline: None,
                path_found,
                is_interpreter,
            }),
            active_process_count: AtomicI64::new(0),
            exit_event: Mutex::new(None),
            tracked_files: FileTree::default(),
            ctx,
        })
    }

    pub fn lineage(&self) -> &ExecLineage {
        &self.lineage
    }

    /// Number of execs of the same process that led to this image.
    pub fn exec_count(&self) -> u64 {
        self.exec_count
    }

    pub fn path(&self) -> Option<Arc<str>> {
        read(&self.info).path.clone()
    }

    pub fn cmdline(&self) -> Option<Arc<str>> {
        read(&self.info).cmdline.clone()
    }

    /// Path and cmdline read under the same guard.
    pub fn image_strings(&self) -> (Option<Arc<str>>, Option<Arc<str>>) {
        let info = read(&self.info);
        (info.path.clone(), info.cmdline.clone())
    }

    pub fn path_found(&self) -> bool {
        read(&self.info).path_found
    }

    pub fn is_interpreter(&self) -> bool {
        read(&self.info).is_interpreter
    }

    /// Replace the path. The previous string is released before the new one
    /// is attached; readers holding the old `Arc` keep a valid copy.
    pub fn set_path(&self, path: Option<&str>, path_found: bool) {
        let is_interpreter = path.is_some_and(|path| self.ctx.config.is_interpreter(path));
        let mut info = write(&self.info);
        info.path = None;
        info.path = path.map(Arc::from);
        info.path_found = path_found;
        info.is_interpreter = is_interpreter;
    }

    pub fn set_cmdline(&self, cmdline: Option<&str>) {
        let mut info = write(&self.info);
        info.cmdline = None;
        info.cmdline = cmdline.map(Arc::from);
    }

    pub fn active_process_count(&self) -> i64 {
        self.active_process_count.load(Ordering::Acquire)
    }

    /// Count one more process running this image.
    pub fn acquire_active(&self) -> i64 {
        self.active_process_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Count one process less. The count never goes below zero.
    pub fn release_active(&self) -> ActiveRelease {
        let released = self
            .active_process_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count > 0).then_some(count - 1)
            });
        match released {
            Ok(1) => ActiveRelease::Last,
            Ok(_) => ActiveRelease::Remaining,
            Err(_) => {
                log::warn!(
                    "active process count underflow for {} ({})",
                    self.lineage.exec.pid,
                    self.path().as_deref().unwrap_or("<unknown>")
                );
                ActiveRelease::Underflow
            }
        }
    }

    /// Store the exit event delivered when this identity is torn down. The
    /// slot is expected to be empty: a displaced event is logged and
    /// returned to the caller, which drops it outside the slot lock.
    pub fn store_exit_event(&self, event: Event) -> Option<Event> {
        let previous = lock(&self.exit_event).replace(event);
        if let Some(previous) = &previous {
            log::error!(
                "exit event already stored for {}: discarding {} of {}",
                self.lineage.exec.pid,
                previous.event_type,
                previous.pid
            );
        }
        previous
    }

    pub fn has_exit_event(&self) -> bool {
        lock(&self.exit_event).is_some()
    }

    pub fn tracked_files(&self) -> &FileTree {
        &self.tracked_files
    }
}

impl fmt::Debug for ExecIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let info = read(&self.info);
        f.debug_struct("ExecIdentity")
            .field("lineage", &self.lineage)
            .field("path", &info.path)
            .field("cmdline", &info.cmdline)
            .field("exec_count", &self.exec_count)
            .field("active_process_count", &self.active_process_count())
            .finish()
    }
}

impl Drop for ExecIdentity {
    fn drop(&mut self) {
        for key in self.tracked_files.drain() {
            self.ctx.files.close_key(&key);
        }

        let info = self.info.get_mut().unwrap_or_else(PoisonError::into_inner);
        log::trace!(
            "EXEC-DEL {} {}",
            self.lineage.exec.pid,
            info.path.as_deref().unwrap_or("<unknown>")
        );
        info.path = None;
        info.cmdline = None;

        let exit_event = self
            .exit_event
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(event) = exit_event {
            self.ctx.sink.send(event);
        }

        self.ctx.stats.exec_identity_destroyed();
    }
}
