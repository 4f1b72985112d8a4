use std::sync::{
    Arc, Mutex, RwLock,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use sensor_common::Pid;
use serde::Serialize;

use crate::{
    event::{EventType, ProcessDetails, StartAction},
    exec_identity::ExecIdentity,
    store::Keyed,
    sync::{lock, read, write},
};

/// Mutable per-instance attributes, refreshed on exec.
#[derive(Debug, Clone, Copy)]
pub struct PosixState {
    pub tid: Pid,
    pub uid: u32,
    pub euid: u32,
    pub action: StartAction,
    /// False for processes first observed after they started
    pub is_real_start: bool,
}

/// Second identity slot, used to hand an identity over to the next event of
/// a handoff category.
#[derive(Debug, Default)]
enum IdentityHandoff {
    #[default]
    Empty,
    Staged(Arc<ExecIdentity>),
}

impl IdentityHandoff {
    fn take(&mut self) -> Option<Arc<ExecIdentity>> {
        match std::mem::take(self) {
            IdentityHandoff::Empty => None,
            IdentityHandoff::Staged(identity) => Some(identity),
        }
    }
}

#[derive(Debug, Default)]
pub struct OpCounters {
    process_op_cnt: AtomicU64,
    process_create: AtomicU64,
    process_exit: AtomicU64,
    file_op_cnt: AtomicU64,
    file_map_exec: AtomicU64,
    file_create: AtomicU64,
    file_delete: AtomicU64,
    file_open: AtomicU64,
    file_write: AtomicU64,
    file_close: AtomicU64,
    net_op_cnt: AtomicU64,
    net_connect: AtomicU64,
    net_accept: AtomicU64,
    net_dns: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OpCountersSnapshot {
    pub process_op_cnt: u64,
    pub process_create: u64,
    pub process_exit: u64,
    pub file_op_cnt: u64,
    pub file_map_exec: u64,
    pub file_create: u64,
    pub file_delete: u64,
    pub file_open: u64,
    pub file_write: u64,
    pub file_close: u64,
    pub net_op_cnt: u64,
    pub net_connect: u64,
    pub net_accept: u64,
    pub net_dns: u64,
}

fn inc(counter: &AtomicU64) -> u64 {
    counter.fetch_add(1, Ordering::Relaxed)
}

impl OpCounters {
    pub fn record(&self, event_type: EventType) {
        match event_type {
            EventType::ProcessStart => {
                inc(&self.process_op_cnt);
                inc(&self.process_create);
            }
            EventType::ProcessExit | EventType::ProcessLastExit => {
                inc(&self.process_op_cnt);
                inc(&self.process_exit);
            }
            EventType::ProcessBlocked => {
                inc(&self.process_op_cnt);
            }
            EventType::ModuleLoad => {
                inc(&self.file_op_cnt);
                inc(&self.file_map_exec);
            }
            EventType::FileCreate => {
                inc(&self.file_op_cnt);
                inc(&self.file_create);
            }
            EventType::FileDelete => {
                inc(&self.file_op_cnt);
                inc(&self.file_delete);
            }
            EventType::FileOpen => {
                inc(&self.file_op_cnt);
            }
            EventType::FileWrite => {
                inc(&self.file_op_cnt);
                // First write on the file counts as the open
                if inc(&self.file_write) == 0 {
                    inc(&self.file_open);
                }
            }
            EventType::FileClose => {
                inc(&self.file_op_cnt);
                inc(&self.file_close);
            }
            EventType::NetConnectPre | EventType::NetConnectPost => {
                inc(&self.net_op_cnt);
                inc(&self.net_connect);
            }
            EventType::NetAccept => {
                inc(&self.net_op_cnt);
                inc(&self.net_accept);
            }
            EventType::DnsResponse => {
                inc(&self.net_op_cnt);
                inc(&self.net_dns);
            }
            EventType::ProcessStartExec => {}
        }
    }

    pub fn snapshot(&self) -> OpCountersSnapshot {
        let get = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        OpCountersSnapshot {
            process_op_cnt: get(&self.process_op_cnt),
            process_create: get(&self.process_create),
            process_exit: get(&self.process_exit),
            file_op_cnt: get(&self.file_op_cnt),
            file_map_exec: get(&self.file_map_exec),
            file_create: get(&self.file_create),
            file_delete: get(&self.file_delete),
            file_open: get(&self.file_open),
            file_write: get(&self.file_write),
            file_close: get(&self.file_close),
            net_op_cnt: get(&self.net_op_cnt),
            net_connect: get(&self.net_connect),
            net_accept: get(&self.net_accept),
            net_dns: get(&self.net_dns),
        }
    }
}

/// One live process instance.
#[derive(Debug)]
pub struct PosixIdentity {
    pid: Pid,
    state: Mutex<PosixState>,
    posix_details: Mutex<ProcessDetails>,
    posix_parent_details: ProcessDetails,
    posix_grandparent_details: ProcessDetails,
    counters: OpCounters,
    exec_blocked: AtomicBool,
    exec_identity: RwLock<Option<Arc<ExecIdentity>>>,
    handoff: Mutex<IdentityHandoff>,
}

impl PosixIdentity {
    pub fn new(
        state: PosixState,
        posix_details: ProcessDetails,
        posix_parent_details: ProcessDetails,
        posix_grandparent_details: ProcessDetails,
        exec_identity: Arc<ExecIdentity>,
    ) -> Self {
        Self {
            pid: posix_details.pid,
            state: Mutex::new(state),
            posix_details: Mutex::new(posix_details),
            posix_parent_details,
            posix_grandparent_details,
            counters: OpCounters::default(),
            exec_blocked: AtomicBool::new(false),
            exec_identity: RwLock::new(Some(exec_identity)),
            handoff: Mutex::new(IdentityHandoff::Empty),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn state(&self) -> PosixState {
        *lock(&self.state)
    }

    pub fn update_state(&self, state: PosixState) {
        *lock(&self.state) = state;
    }

    pub fn posix_details(&self) -> ProcessDetails {
        *lock(&self.posix_details)
    }

    /// The running image changed.
    pub fn set_posix_image(&self, device: u64, inode: u64) {
        let mut details = lock(&self.posix_details);
        details.device = device;
        details.inode = inode;
    }

    pub fn posix_parent_details(&self) -> &ProcessDetails {
        &self.posix_parent_details
    }

    pub fn posix_grandparent_details(&self) -> &ProcessDetails {
        &self.posix_grandparent_details
    }

    pub fn counters(&self) -> &OpCounters {
        &self.counters
    }

    pub fn mark_exec_blocked(&self) {
        self.exec_blocked.store(true, Ordering::Release);
    }

    pub fn is_exec_blocked(&self) -> bool {
        self.exec_blocked.load(Ordering::Acquire)
    }

    /// A new reference to the natural identity.
    pub fn exec_identity(&self) -> Option<Arc<ExecIdentity>> {
        read(&self.exec_identity).clone()
    }

    /// Replace the natural identity. The previous one is returned so that
    /// the caller releases it outside of this slot's lock.
    #[must_use = "dropping the previous identity may emit its exit event"]
    pub fn set_exec_identity(&self, identity: Arc<ExecIdentity>) -> Option<Arc<ExecIdentity>> {
        write(&self.exec_identity).replace(identity)
    }

    /// Put `identity` into the handoff slot. A previously staged identity is
    /// returned to the caller.
    #[must_use = "dropping the previous identity may emit its exit event"]
    pub fn stage_handoff(&self, identity: Arc<ExecIdentity>) -> Option<Arc<ExecIdentity>> {
        let mut handoff = lock(&self.handoff);
        let previous = handoff.take();
        *handoff = IdentityHandoff::Staged(identity);
        previous
    }

    /// Take the staged identity, leaving the slot empty.
    pub fn take_handoff(&self) -> Option<Arc<ExecIdentity>> {
        lock(&self.handoff).take()
    }

    /// Empty the slot, releasing whatever was staged.
    pub fn clear_handoff(&self) {
        let staged = self.take_handoff();
        drop(staged);
    }

    /// New reference to the staged identity, slot left untouched.
    pub fn staged_handoff(&self) -> Option<Arc<ExecIdentity>> {
        match &*lock(&self.handoff) {
            IdentityHandoff::Empty => None,
            IdentityHandoff::Staged(identity) => Some(Arc::clone(identity)),
        }
    }
}

impl Keyed for PosixIdentity {
    type Key = Pid;

    fn key(&self) -> Pid {
        self.pid
    }
}

impl Drop for PosixIdentity {
    fn drop(&mut self) {
        log::trace!("POSIX-DEL {}", self.pid);
    }
}
