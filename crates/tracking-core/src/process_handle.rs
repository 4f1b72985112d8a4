use std::sync::Arc;

use sensor_common::Pid;

use crate::{exec_identity::ExecIdentity, posix_identity::PosixIdentity, store::Ref};

/// Identity, path and cmdline of an exec image, read together.
#[derive(Debug, Clone)]
pub struct ExecHandle {
    identity: Arc<ExecIdentity>,
    path: Arc<str>,
    cmdline: Arc<str>,
}

impl ExecHandle {
    /// `None` unless both strings are currently set.
    pub fn new(identity: Arc<ExecIdentity>) -> Option<Self> {
        let (path, cmdline) = identity.image_strings();
        Some(Self {
            path: path?,
            cmdline: cmdline?,
            identity,
        })
    }

    pub fn identity(&self) -> &Arc<ExecIdentity> {
        &self.identity
    }

    pub fn path(&self) -> &Arc<str> {
        &self.path
    }

    pub fn cmdline(&self) -> &Arc<str> {
        &self.cmdline
    }

    /// Replace the triplet with a snapshot of `identity`. Returns false and
    /// keeps the current triplet if that snapshot is incomplete.
    pub fn set_exec_identity(&mut self, identity: Arc<ExecIdentity>) -> bool {
        match Self::new(identity) {
            Some(handle) => {
                *self = handle;
                true
            }
            None => false,
        }
    }
}

/// A posix identity reference paired with a snapshot of its exec image.
///
/// Dropping the handle releases the exec snapshot first, then the posix
/// reference.
#[derive(Debug)]
pub struct ProcessHandle {
    // Field order is the release order
    exec_handle: ExecHandle,
    posix: Ref<PosixIdentity>,
}

impl ProcessHandle {
    /// Takes over `posix`. If the exec snapshot is incomplete everything is
    /// released and `None` is returned.
    pub fn alloc(posix: Ref<PosixIdentity>) -> Option<Self> {
        let exec_handle = ExecHandle::new(posix.exec_identity()?)?;
        Some(Self { exec_handle, posix })
    }

    pub fn posix_identity(&self) -> &Ref<PosixIdentity> {
        &self.posix
    }

    pub fn exec_identity(&self) -> &Arc<ExecIdentity> {
        &self.exec_handle.identity
    }

    pub fn exec_handle(&self) -> &ExecHandle {
        &self.exec_handle
    }

    pub fn pid(&self) -> Pid {
        self.posix.pid()
    }

    pub fn path(&self) -> &str {
        &self.exec_handle.path
    }

    pub fn cmdline(&self) -> &str {
        &self.exec_handle.cmdline
    }

    pub fn set_exec_identity(&mut self, identity: Arc<ExecIdentity>) -> bool {
        self.exec_handle.set_exec_identity(identity)
    }

    /// Release the handle.
    pub fn put(self) {}
}
