//! The posix identity registry and the process lifecycle built on it.
//!
//! [`ProcessTracker`] is the single owner of the process table. Processes
//! enter the table on fork (or when first observed), change exec identity
//! on exec and leave it on exit. Exits of the last process running an image
//! are deferred: the exit event is stored in the image's [`ExecIdentity`]
//! and delivered when the identity is torn down.

use std::{fmt::Write, ops::ControlFlow, sync::Arc};

use sensor_common::{Pid, TaskSnapshot, time::Timestamp};

use crate::{
    config::{TrackerConfig, proc_name},
    context::{StatsSnapshot, TrackingContext},
    correlation,
    event::{Event, IntentType, ProcessDetails, StartAction},
    exec_identity::{ActiveRelease, ExecIdentity, ExecLineage},
    file_tracking::{FileKey, FileTracker},
    file_tree::{FileTree, FileTreeHandle},
    posix_identity::{PosixIdentity, PosixState},
    process_handle::ProcessHandle,
    sink::EventSink,
    store::{Insert, Ref, Store},
};

/// A process observed for the first time.
#[derive(Debug, Clone, Copy)]
pub struct ProcessStart<'a> {
    pub pid: Pid,
    pub parent: Pid,
    pub tid: Pid,
    pub uid: u32,
    pub euid: u32,
    pub start_time: Timestamp,
    pub action: StartAction,
    pub is_real_start: bool,
    pub task: &'a TaskSnapshot,
}

/// A process replaced its image.
#[derive(Debug, Clone, Copy)]
pub struct ExecUpdate<'a> {
    pub pid: Pid,
    pub tid: Pid,
    pub uid: u32,
    pub euid: u32,
    pub device: u64,
    pub inode: u64,
    pub path: Option<&'a str>,
    pub path_found: bool,
    pub start_time: Timestamp,
    pub action: StartAction,
    pub event_type: crate::event::EventType,
    pub is_real_start: bool,
    pub task: &'a TaskSnapshot,
}

fn task_comm(task: &TaskSnapshot) -> Option<&str> {
    Some(task.comm.as_str()).filter(|comm| !comm.is_empty())
}

pub struct ProcessTracker {
    table: Store<PosixIdentity>,
    ctx: Arc<TrackingContext>,
}

impl ProcessTracker {
    pub fn new(config: TrackerConfig, sink: impl EventSink) -> Self {
        let table = Store::new("process-tracking", config.table_size);
        Self {
            table,
            ctx: Arc::new(TrackingContext::new(config, sink)),
        }
    }

    pub fn context(&self) -> &Arc<TrackingContext> {
        &self.ctx
    }

    pub fn files(&self) -> &FileTracker {
        &self.ctx.files
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.ctx.stats.snapshot()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn get_process(&self, pid: Pid) -> Option<Ref<PosixIdentity>> {
        self.table.get(&pid)
    }

    /// Insert a process into the table.
    ///
    /// A fork of a tracked parent shares the parent's exec identity and
    /// inherits its lineage. Otherwise a new identity is built from the task
    /// snapshot, reporting the parent as the exec'd process.
    pub fn create_process(&self, start: ProcessStart<'_>) -> Option<Ref<PosixIdentity>> {
        let msg = if start.is_real_start { "" } else { "<FAKE> " };

        let inherited = match start.action {
            StartAction::ByFork => self.get_process(start.parent).and_then(|parent| {
                let exec = parent.exec_identity()?;
                Some((
                    exec,
                    parent.posix_details(),
                    *parent.posix_parent_details(),
                ))
            }),
            StartAction::ByExec => None,
        };

        let (exec, posix_parent, posix_grandparent) = match inherited {
            Some(inherited) => inherited,
            None => {
                let task = start.task;
                let lineage = ExecLineage {
                    exec: ProcessDetails::new(
                        start.parent,
                        start.start_time,
                        task.parent_device,
                        task.parent_inode,
                    ),
                    exec_parent: ProcessDetails::with_pid(
                        task.grandparent_pid.unwrap_or(Pid::from_raw(1)),
                    ),
                    exec_grandparent: ProcessDetails::default(),
                };
                let exec = ExecIdentity::new(
                    Arc::clone(&self.ctx),
                    lineage,
                    task_comm(task),
                    false,
                    1,
                );
                exec.set_cmdline(task_comm(task));
                (exec, lineage.exec, lineage.exec_parent)
            }
        };

        let exec_details = exec.lineage().exec;
        let posix = PosixIdentity::new(
            PosixState {
                tid: start.tid,
                uid: start.uid,
                euid: start.euid,
                action: start.action,
                is_real_start: start.is_real_start,
            },
            ProcessDetails::new(
                start.pid,
                start.start_time,
                exec_details.device,
                exec_details.inode,
            ),
            posix_parent,
            posix_grandparent,
            Arc::clone(&exec),
        );

        match self.table.insert(posix) {
            Insert::Inserted(posix) => {
                self.ctx.stats.record_create(start.action);
                let active = exec.acquire_active();
                log::trace!(
                    "TRACK-INS {msg}{} of {} by {} (reported as {} by {}) (active: {active})",
                    exec.path().as_deref().unwrap_or("<unknown>"),
                    start.pid,
                    start.parent,
                    exec_details.pid,
                    exec.lineage().exec_parent.pid,
                );
                Some(posix)
            }
            Insert::Raced(winner) => Some(winner),
        }
    }

    /// Attach a new exec identity to a process, creating a fake entry for
    /// processes never seen before.
    ///
    /// If the process was the last one running the previous image, the exit
    /// of that image is sent (and deferred), holding the new identity. For a
    /// real start the previous identity is staged for the start event.
    pub fn update_process(&self, update: ExecUpdate<'_>) -> Option<Ref<PosixIdentity>> {
        let pid = update.pid;
        let task = update.task;
        let mut msg = "";

        let posix = match self.get_process(pid) {
            Some(posix) => posix,
            None => {
                msg = "<FAKE> ";
                let mut parent = task.parent_pid.unwrap_or(Pid::from_raw(0));
                if !self.is_process_tracked(parent) {
                    if task.parent_alive {
                        log::warn!("taking fake event path for non-kernel task {parent}");
                    } else if parent.as_raw() != 0 {
                        parent = Pid::from_raw(1);
                    }
                }
                let created = self.create_process(ProcessStart {
                    pid,
                    parent,
                    tid: update.tid,
                    uid: update.uid,
                    euid: update.euid,
                    // keep the fake start before the exec
                    start_time: update.start_time - 1,
                    action: StartAction::ByFork,
                    is_real_start: false,
                    task,
                });
                match created {
                    Some(posix) => posix,
                    None => {
                        log::trace!("TRACK-UPD <FAKE> FAILED to create tracking entry for {pid} by {parent}");
                        return None;
                    }
                }
            }
        };

        let parent_exec = posix.exec_identity()?;
        let is_exec_other = parent_exec.lineage().exec.pid == pid;
        let was_last = parent_exec.release_active() == ActiveRelease::Last;

        let lineage = ExecLineage {
            exec: ProcessDetails::new(pid, update.start_time, update.device, update.inode),
            exec_parent: parent_exec.lineage().exec,
            exec_grandparent: parent_exec.lineage().exec_parent,
        };
        let exec_count = if is_exec_other {
            parent_exec.exec_count() + 1
        } else {
            1
        };
        let path = update.path.or_else(|| task_comm(task));
        let exec = ExecIdentity::new(
            Arc::clone(&self.ctx),
            lineage,
            path,
            update.path_found,
            exec_count,
        );

        if was_last && update.is_real_start {
            // The exit of the previous image holds the new one, so the new
            // image's own exit is delivered after it
            drop(posix.stage_handoff(Arc::clone(&exec)));
            self.send_exit(&posix, update.start_time, 0, true);
        }

        posix.set_posix_image(update.device, update.inode);
        let previous = posix.set_exec_identity(Arc::clone(&exec));
        let active = exec.acquire_active();
        posix.update_state(PosixState {
            tid: update.tid,
            uid: update.uid,
            euid: update.euid,
            action: update.action,
            is_real_start: update.is_real_start,
        });

        if update.is_real_start {
            // Held by the start event: the parent's exit comes after it
            drop(posix.stage_handoff(Arc::clone(&parent_exec)));
        }

        posix.counters().record(update.event_type);
        if update.event_type.is_start() {
            self.ctx.stats.record_exec();
        }

        log::trace!(
            "TRACK-UPD {msg}{} of {pid} by {} (reported as {}:{} by {}:{}) (active: {active})",
            path.unwrap_or("<unknown>"),
            task.parent_pid.map_or(0, Pid::as_raw),
            lineage.exec.pid,
            lineage.exec.start_time.raw(),
            lineage.exec_parent.pid,
            lineage.exec_parent.start_time.raw(),
        );

        drop(previous);
        drop(parent_exec);
        Some(posix)
    }

    /// Report the exit of `pid` and remove it from the table. Returns false
    /// if the process is not tracked or its image had no active process
    /// left.
    pub fn report_exit(&self, pid: Pid, timestamp: Timestamp, exit_code: u32) -> bool {
        let Some(posix) = self.get_process(pid) else {
            return false;
        };
        let Some(exec) = posix.exec_identity() else {
            return false;
        };
        let was_last = match exec.release_active() {
            ActiveRelease::Last => true,
            ActiveRelease::Remaining => false,
            ActiveRelease::Underflow => return false,
        };
        drop(exec);

        self.send_exit(&posix, timestamp, exit_code, was_last);
        self.remove_process(&posix);
        true
    }

    /// Remove this very entry from the table. A newer entry reusing the pid
    /// is left alone.
    pub fn remove_process(&self, posix: &Ref<PosixIdentity>) -> bool {
        self.ctx.stats.record_exit();
        let stats = self.ctx.stats.snapshot();
        log::trace!(
            "TRACK-DEL pid={} opcnt={} create={} exit={}",
            posix.pid(),
            stats.op_cnt,
            stats.create,
            stats.exit
        );
        self.table.remove_entry(posix)
    }

    /// Drop the table's reference to `pid`. Outstanding references stay
    /// valid.
    pub fn close_process(&self, pid: Pid) -> bool {
        self.table.remove(&pid).is_some()
    }

    pub fn get_handle(&self, pid: Pid) -> Option<ProcessHandle> {
        ProcessHandle::alloc(self.get_process(pid)?)
    }

    pub fn is_process_tracked(&self, pid: Pid) -> bool {
        self.get_process(pid).is_some()
    }

    /// Resolve `pid`, synthesizing a start by exec if it is not tracked.
    pub fn get_procinfo_and_create_process_start_if_needed(
        &self,
        pid: Pid,
        msg: &str,
        task: &TaskSnapshot,
        timestamp: Timestamp,
    ) -> Option<Ref<PosixIdentity>> {
        if let Some(posix) = self.get_process(pid) {
            return Some(posix);
        }
        log::info!("{msg} pid={pid} not tracked");
        self.create_process_start_by_exec(pid, task, timestamp);
        self.get_process(pid)
    }

    /// Track a process observed mid-life and emit its start.
    pub fn create_process_start_by_exec(&self, pid: Pid, task: &TaskSnapshot, timestamp: Timestamp) {
        let path = task.exe_path.as_deref().or_else(|| task_comm(task));
        let path_found = task.exe_path.is_some();
        if !path_found {
            log::info!("Failed to retrieve path for pid: {pid}");
        }

        let Some(posix) = self.update_process(ExecUpdate {
            pid,
            tid: task.tid.unwrap_or(pid),
            uid: task.uid,
            euid: task.euid,
            device: task.device,
            inode: task.inode,
            path,
            path_found,
            start_time: timestamp,
            action: StartAction::ByExec,
            event_type: crate::event::EventType::ProcessStartExec,
            is_real_start: false,
            task,
        }) else {
            return;
        };
        if let Some(exec) = posix.exec_identity() {
            exec.set_cmdline(path);
        }
        self.send_start(&posix, timestamp, StartAction::ByExec);
    }

    pub fn send_start(&self, posix: &PosixIdentity, timestamp: Timestamp, action: StartAction) {
        let state = posix.state();
        let uid = self.ctx.config.report_process_user.then_some(state.uid);
        let cmdline = posix.exec_identity().and_then(|exec| exec.cmdline());
        let mut event = Event::start(posix.pid(), timestamp, action, uid, cmdline);
        self.set_event_info(posix, IntentType::Report, Some(&mut event));
        self.ctx.sink.send(event);
    }

    /// Send an exit event. The last exit of an image is stored in the
    /// image's identity instead.
    pub fn send_exit(&self, posix: &PosixIdentity, timestamp: Timestamp, exit_code: u32, last: bool) {
        let mut event = Event::exit(posix.pid(), timestamp, exit_code, last);
        posix.counters().record(event.event_type);
        self.set_event_info(posix, IntentType::Report, Some(&mut event));
        if last {
            self.store_exit_event(posix, event);
        } else {
            self.ctx.sink.send(event);
        }
    }

    pub fn send_blocked(
        &self,
        posix: &PosixIdentity,
        timestamp: Timestamp,
        device: u64,
        inode: u64,
        path: Option<String>,
    ) {
        let mut event = Event::blocked(posix.pid(), timestamp, device, inode, path);
        posix.counters().record(event.event_type);
        self.set_event_info(posix, IntentType::Prevention, Some(&mut event));
        self.ctx.sink.send(event);
    }

    /// Fill `event` from `posix`, then release the staged identity.
    pub fn set_event_info(&self, posix: &PosixIdentity, intent: IntentType, event: Option<&mut Event>) {
        correlation::set_event_info(posix, intent, event);
    }

    /// Store `event` in the natural identity of `posix`, to be delivered
    /// when that identity is torn down.
    pub fn store_exit_event(&self, posix: &PosixIdentity, event: Event) {
        match posix.exec_identity() {
            Some(exec) => {
                let displaced = exec.store_exit_event(event);
                drop(exec);
                drop(displaced);
            }
            None => {
                log::warn!("no exec identity for {}: sending exit now", posix.pid());
                self.ctx.sink.send(event);
            }
        }
    }

    pub fn has_active_process(&self, posix: &PosixIdentity) -> bool {
        posix
            .exec_identity()
            .is_some_and(|exec| exec.active_process_count() != 0)
    }

    pub fn mark_as_blocked(&self, handle: Option<&ProcessHandle>) {
        if let Some(handle) = handle {
            handle.posix_identity().mark_exec_blocked();
        }
    }

    pub fn is_blocked(&self, handle: Option<&ProcessHandle>) -> bool {
        handle.is_some_and(|handle| handle.posix_identity().is_exec_blocked())
    }

    /// Pid of the process that exec'd the handle's image, 1 when unknown.
    pub fn exec_pid(&self, handle: Option<&ProcessHandle>) -> Pid {
        handle.map_or(Pid::from_raw(1), |handle| {
            handle.exec_identity().lineage().exec.pid
        })
    }

    /// Point `handle` at the identity its process currently runs.
    pub fn set_exec_identity(&self, handle: &mut ProcessHandle) -> bool {
        let current = handle.posix_identity().exec_identity();
        match current {
            Some(identity) => handle.set_exec_identity(identity),
            None => false,
        }
    }

    pub fn set_proc_cmdline(&self, handle: Option<&ProcessHandle>, cmdline: Option<&str>) {
        if let (Some(handle), Some(cmdline)) = (handle, cmdline) {
            handle.exec_identity().set_cmdline(Some(cmdline));
        }
    }

    /// Record an open file in both the file table and the tree of the
    /// process image.
    pub fn open_file(
        &self,
        posix: &PosixIdentity,
        device: u64,
        inode: u64,
        path: Option<&str>,
        is_special: bool,
    ) {
        let entry = self
            .ctx
            .files
            .open(posix.pid(), device, inode, path, is_special);
        if let Some(exec) = posix.exec_identity() {
            exec.tracked_files()
                .insert(entry.file_key(), entry.path().cloned(), entry.is_special());
        }
    }

    pub fn close_file(&self, posix: &PosixIdentity, device: u64, inode: u64) -> bool {
        let key = FileKey::new(posix.pid(), device, inode);
        if let Some(exec) = posix.exec_identity() {
            exec.tracked_files().remove(&key);
        }
        self.ctx.files.close_key(&key)
    }

    /// Running processes whose image is `(device, inode)`.
    pub fn processes_by_inode(&self, device: u64, inode: u64) -> Vec<Ref<PosixIdentity>> {
        let mut found = Vec::new();
        let _ = self.table.for_each(|posix| {
            let details = posix.posix_details();
            if details.device == device && details.inode == inode {
                found.push(posix.clone());
            }
            ControlFlow::Continue(())
        });
        found
    }

    pub fn for_each<F>(&self, visitor: F) -> ControlFlow<()>
    where
        F: FnMut(&Ref<PosixIdentity>) -> ControlFlow<()>,
    {
        self.table.for_each(visitor)
    }

    /// Visit the non-empty file tree of every process. Processes sharing an
    /// exec identity share its tree, which is then visited once per process.
    pub fn for_each_tree<F>(&self, mut visitor: F) -> ControlFlow<()>
    where
        F: FnMut(&FileTree) -> ControlFlow<()>,
    {
        self.table.for_each(|posix| match posix.exec_identity() {
            Some(exec) if !exec.tracked_files().is_empty() => visitor(exec.tracked_files()),
            _ => ControlFlow::Continue(()),
        })
    }

    pub fn get_file_tree(&self, pid: Pid) -> Option<FileTreeHandle> {
        let posix = self.get_process(pid)?;
        let exec = posix.exec_identity()?;
        Some(FileTreeHandle::new(exec))
    }

    /// Fixed-width dump of the process table, ordered by pid.
    pub fn show_table(&self) -> String {
        let mut entries = self.table.snapshot();
        entries.sort_by_key(|posix| posix.pid().as_raw());

        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:>6} | {:>6} | {:>6} | {:>6} | {:>20} | {:>40} |",
            "PID", "PPID", "EXEC", "ACTIVE", "NAME", "Path"
        );
        for posix in entries {
            let Some(exec) = posix.exec_identity() else {
                continue;
            };
            let path = exec.path();
            let _ = writeln!(
                out,
                "{:>6} | {:>6} | {:>6} | {:>6} | {:>20} | {:>40} |",
                posix.pid().as_raw(),
                posix.posix_parent_details().pid.as_raw(),
                exec.lineage().exec.pid.as_raw(),
                exec.active_process_count(),
                path.as_deref().map(proc_name).unwrap_or(""),
                path.as_deref().unwrap_or("<unknown>"),
            );
        }
        out
    }

    pub fn show_stats(&self) -> String {
        let stats = self.stats();
        format!(
            "op_cnt={} create={} exit={} create_by_fork={} create_by_exec={} live_exec_identities={} tracked={} files={}",
            stats.op_cnt,
            stats.create,
            stats.exit,
            stats.create_by_fork,
            stats.create_by_exec,
            stats.live_exec_identities,
            self.table.len(),
            self.ctx.files.len(),
        )
    }

    /// Empty the process table, then the file table. Remaining entries are
    /// logged when `print_proc_on_delete` is set.
    pub fn shutdown(&self) {
        let print = self.ctx.config.print_proc_on_delete;
        self.table.shutdown(|posix, outstanding| {
            if print {
                let exec = posix.exec_identity();
                log::info!(
                    "{} {}: {} outstanding references (active: {})",
                    exec.as_ref()
                        .and_then(|exec| exec.path())
                        .as_deref()
                        .map(proc_name)
                        .unwrap_or("<unknown>"),
                    posix.pid(),
                    outstanding,
                    exec.as_ref().map_or(0, |exec| exec.active_process_count()),
                );
            }
        });
        self.ctx.files.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;

    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        event::{EventType, ProcessSlot},
        sink::NullSink,
    };

    fn tracker() -> (ProcessTracker, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ProcessTracker::new(TrackerConfig::default(), tx), rx)
    }

    fn pid(raw: i32) -> Pid {
        Pid::from_raw(raw)
    }

    fn start<'a>(child: i32, parent: i32, real: bool, task: &'a TaskSnapshot) -> ProcessStart<'a> {
        ProcessStart {
            pid: pid(child),
            parent: pid(parent),
            tid: pid(child),
            uid: 1000,
            euid: 1000,
            start_time: Timestamp::from(child as u64 * 100),
            action: StartAction::ByFork,
            is_real_start: real,
            task,
        }
    }

    fn exec<'a>(target: i32, path: &'a str, inode: u64, task: &'a TaskSnapshot) -> ExecUpdate<'a> {
        ExecUpdate {
            pid: pid(target),
            tid: pid(target),
            uid: 1000,
            euid: 1000,
            device: 8,
            inode,
            path: Some(path),
            path_found: true,
            start_time: Timestamp::from(10_000 + inode),
            action: StartAction::ByExec,
            event_type: EventType::ProcessStartExec,
            is_real_start: true,
            task,
        }
    }

    #[test]
    fn fork_shares_parent_identity() {
        let (tracker, _rx) = tracker();
        let task = TaskSnapshot::default();
        let parent = tracker.create_process(start(1, 0, false, &task)).unwrap();
        let child = tracker.create_process(start(5, 1, true, &task)).unwrap();

        let shared = parent.exec_identity().unwrap();
        assert!(Arc::ptr_eq(&shared, &child.exec_identity().unwrap()));
        assert_eq!(shared.active_process_count(), 2);
        assert_eq!(*child.posix_parent_details(), parent.posix_details());
        assert_eq!(
            *child.posix_grandparent_details(),
            *parent.posix_parent_details()
        );

        let stats = tracker.stats();
        assert_eq!(stats.create, 2);
        assert_eq!(stats.create_by_fork, 2);
        assert_eq!(stats.live_exec_identities, 1);
    }

    #[test]
    fn untracked_parent_gets_synthesized_identity() {
        let (tracker, _rx) = tracker();
        let task = TaskSnapshot {
            comm: "sshd".to_string(),
            parent_device: 3,
            parent_inode: 33,
            grandparent_pid: Some(pid(2)),
            ..Default::default()
        };
        let posix = tracker.create_process(start(9, 4, true, &task)).unwrap();
        let exec = posix.exec_identity().unwrap();
        assert_eq!(exec.lineage().exec.pid, pid(4));
        assert_eq!(exec.lineage().exec.inode, 33);
        assert_eq!(exec.lineage().exec_parent.pid, pid(2));
        assert_eq!(exec.lineage().exec_grandparent.pid.as_raw(), 0);
        assert!(!exec.path_found());
        assert_eq!(exec.path().as_deref(), Some("sshd"));
        assert_eq!(posix.posix_details().inode, 33);
        assert_eq!(posix.posix_parent_details().pid, pid(4));
    }

    #[test]
    fn concurrent_creators_share_one_entry() {
        let (tracker, _rx) = tracker();
        let task = TaskSnapshot::default();
        let barrier = Barrier::new(6);
        let entries: Vec<Ref<PosixIdentity>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..6)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        tracker.create_process(start(42, 1, true, &task)).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(entries.iter().all(|e| Ref::ptr_eq(e, &entries[0])));
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.stats().create, 1);
        assert_eq!(
            entries[0].exec_identity().unwrap().active_process_count(),
            1
        );
        drop(entries);
        assert_eq!(tracker.stats().live_exec_identities, 1);
    }

    #[test]
    fn exec_event_carries_fork_and_exec_lineage() {
        let (tracker, mut rx) = tracker();
        let task = TaskSnapshot::default();
        let init = tracker.create_process(start(1, 0, false, &task)).unwrap();
        let child = tracker.create_process(start(5, 1, true, &task)).unwrap();
        let pre_exec = init.exec_identity().unwrap();

        let execed = tracker.update_process(exec(5, "/bin/x", 55, &task)).unwrap();
        assert!(Ref::ptr_eq(&execed, &child));
        tracker.send_start(&execed, Timestamp::from(10_055), StartAction::ByExec);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.event_type, EventType::ProcessStartExec);
        assert_eq!(event.details(ProcessSlot::Fork).pid, pid(5));
        assert_eq!(event.details(ProcessSlot::Fork).inode, 55);
        assert_eq!(*event.details(ProcessSlot::ForkParent), init.posix_details());
        assert_eq!(
            *event.details(ProcessSlot::ForkGrandparent),
            *init.posix_parent_details()
        );
        assert_eq!(
            *event.details(ProcessSlot::Exec),
            ProcessDetails::new(pid(5), Timestamp::from(10_055), 8, 55)
        );
        assert_eq!(*event.details(ProcessSlot::ExecParent), pre_exec.lineage().exec);
        assert_eq!(event.proc_info.path.as_deref(), Some("/bin/x"));
        assert_eq!(event.proc_info.path_size, 7);
        // The start holds the image the process came from
        assert!(Arc::ptr_eq(event.process_data().unwrap(), &pre_exec));
        assert!(child.staged_handoff().is_none());
        assert_eq!(pre_exec.active_process_count(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn last_exit_of_image_waits_for_referencing_events() {
        let (tracker, mut rx) = tracker();
        let task = TaskSnapshot::default();
        drop(tracker.create_process(start(1, 0, false, &task)));
        drop(tracker.create_process(start(7, 1, true, &task)));

        let posix = tracker.update_process(exec(7, "/bin/a", 1, &task)).unwrap();
        tracker.send_start(&posix, Timestamp::from(1), StartAction::ByExec);
        let first_image = posix.exec_identity().unwrap();

        // exec of the same pid again: exec-other
        let posix = tracker.update_process(exec(7, "/bin/b", 2, &task)).unwrap();
        tracker.send_start(&posix, Timestamp::from(2), StartAction::ByExec);
        let second_image = posix.exec_identity().unwrap();
        assert_eq!(second_image.exec_count(), 2);
        assert!(first_image.has_exit_event());
        drop(first_image);

        let start_a = rx.try_recv().unwrap();
        assert_eq!(start_a.proc_info.path.as_deref(), Some("/bin/a"));
        drop(start_a);

        let start_b = rx.try_recv().unwrap();
        assert_eq!(start_b.proc_info.path.as_deref(), Some("/bin/b"));
        assert_eq!(
            start_b.process_data().unwrap().path().as_deref(),
            Some("/bin/a")
        );
        // the exit of /bin/a is held by the start of /bin/b
        assert!(rx.try_recv().is_err());
        drop(start_b);

        let exit_a = rx.try_recv().unwrap();
        assert_eq!(exit_a.event_type, EventType::ProcessLastExit);
        assert_eq!(exit_a.pid, pid(7));
        assert_eq!(exit_a.proc_info.path.as_deref(), Some("/bin/a"));
        assert!(Arc::ptr_eq(exit_a.process_data().unwrap(), &second_image));
    }

    #[test]
    fn stored_exit_not_delivered_while_identity_held() {
        let (tracker, mut rx) = tracker();
        let task = TaskSnapshot::default();
        let posix = tracker.create_process(start(10, 1, true, &task)).unwrap();
        let exec = posix.exec_identity().unwrap();
        // table slot + local
        assert_eq!(Arc::strong_count(&exec), 2);

        tracker.store_exit_event(&posix, Event::exit(pid(10), Timestamp::from(3), 0, true));
        drop(exec);
        assert!(rx.try_recv().is_err());

        assert!(tracker.close_process(pid(10)));
        assert!(rx.try_recv().is_err());
        drop(posix);
        let delivered = rx.try_recv().unwrap();
        assert_eq!(delivered.event_type, EventType::ProcessLastExit);
        assert_eq!(tracker.stats().live_exec_identities, 0);
    }

    #[test]
    fn report_exit_once() {
        let (tracker, mut rx) = tracker();
        let task = TaskSnapshot::default();
        drop(tracker.create_process(start(1, 0, false, &task)));
        drop(tracker.create_process(start(3, 1, true, &task)));

        // Image still run by pid 1: plain exit sent right away
        assert!(tracker.report_exit(pid(3), Timestamp::from(9), 2));
        let exit = rx.try_recv().unwrap();
        assert_eq!(exit.event_type, EventType::ProcessExit);
        assert_eq!(exit.payload, crate::event::EventPayload::Exit { exit_code: 2 });
        assert!(!tracker.is_process_tracked(pid(3)));

        assert!(!tracker.report_exit(pid(3), Timestamp::from(10), 0));
        assert!(rx.try_recv().is_err());

        // Last process of the image: delivered once the entry is gone
        assert!(tracker.report_exit(pid(1), Timestamp::from(11), 0));
        let last = rx.try_recv().unwrap();
        assert_eq!(last.event_type, EventType::ProcessLastExit);
        assert!(tracker.is_empty());
        assert_eq!(tracker.stats().exit, 2);
    }

    #[test]
    fn exit_without_active_process_is_refused() {
        let (tracker, mut rx) = tracker();
        let task = TaskSnapshot::default();
        let posix = tracker.create_process(start(5, 0, true, &task)).unwrap();
        assert!(tracker.has_active_process(&posix));

        let exec = posix.exec_identity().unwrap();
        assert_eq!(exec.release_active(), ActiveRelease::Last);
        assert!(!tracker.has_active_process(&posix));

        assert!(!tracker.report_exit(pid(5), Timestamp::from(4), 0));
        assert!(!exec.has_exit_event());
        assert_eq!(exec.active_process_count(), 0);
        assert!(tracker.is_process_tracked(pid(5)));
        assert_eq!(tracker.stats().exit, 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn active_process_follows_shared_identity() {
        let (tracker, _rx) = tracker();
        let task = TaskSnapshot::default();
        let parent = tracker.create_process(start(1, 0, false, &task)).unwrap();
        let child = tracker.create_process(start(2, 1, true, &task)).unwrap();
        assert!(tracker.has_active_process(&child));

        assert!(tracker.report_exit(pid(1), Timestamp::from(5), 0));
        assert!(tracker.has_active_process(&child));
        assert!(tracker.has_active_process(&parent));

        assert!(tracker.report_exit(pid(2), Timestamp::from(6), 0));
        assert!(!tracker.has_active_process(&child));
    }

    #[test]
    fn null_sink_tracker_tears_down() {
        let tracker = ProcessTracker::new(TrackerConfig::default(), NullSink);
        let task = TaskSnapshot::default();
        drop(tracker.create_process(start(1, 0, false, &task)));
        drop(tracker.create_process(start(2, 1, true, &task)));
        assert!(tracker.report_exit(pid(2), Timestamp::from(3), 0));
        assert!(tracker.report_exit(pid(1), Timestamp::from(4), 0));
        assert!(tracker.is_empty());
        assert_eq!(tracker.stats().exit, 2);
        assert_eq!(tracker.stats().live_exec_identities, 0);
    }

    #[test]
    fn fake_start_for_unknown_process() {
        let (tracker, mut rx) = tracker();
        let task = TaskSnapshot {
            comm: "cron".to_string(),
            exe_path: Some("/usr/sbin/cron".to_string()),
            device: 8,
            inode: 77,
            parent_pid: Some(pid(300)),
            parent_alive: false,
            ..Default::default()
        };
        let posix = tracker
            .get_procinfo_and_create_process_start_if_needed(
                pid(400),
                "FILE-OPEN",
                &task,
                Timestamp::from(50),
            )
            .unwrap();
        // untracked and gone parent is reported as 1
        assert_eq!(posix.posix_parent_details().pid, pid(1));
        assert!(!posix.state().is_real_start);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.event_type, EventType::ProcessStartExec);
        assert_eq!(event.proc_info.path.as_deref(), Some("/usr/sbin/cron"));
        assert!(event.proc_info.path_found);
        // nothing staged on a fake start
        assert!(event.process_data().is_none());
        assert!(rx.try_recv().is_err());

        let handle = tracker.get_handle(pid(400)).unwrap();
        assert_eq!(handle.path(), "/usr/sbin/cron");
        assert_eq!(tracker.exec_pid(Some(&handle)), pid(400));
        assert_eq!(tracker.exec_pid(None), pid(1));
        assert_eq!(tracker.processes_by_inode(8, 77).len(), 1);
    }

    #[test]
    fn blocked_flag_through_handle() {
        let (tracker, _rx) = tracker();
        let task = TaskSnapshot {
            comm: "nc".to_string(),
            ..Default::default()
        };
        drop(tracker.create_process(start(12, 1, true, &task)));
        let handle = tracker.get_handle(pid(12)).unwrap();
        assert!(!tracker.is_blocked(Some(&handle)));
        tracker.mark_as_blocked(Some(&handle));
        assert!(tracker.is_blocked(Some(&handle)));
        assert!(!tracker.is_blocked(None));

        tracker.set_proc_cmdline(Some(&handle), Some("nc -l 4444"));
        assert_eq!(handle.cmdline(), "nc");
        assert_eq!(
            tracker.get_handle(pid(12)).unwrap().cmdline(),
            "nc -l 4444"
        );
    }

    #[test]
    fn trees_follow_shared_identity() {
        let (tracker, _rx) = tracker();
        let task = TaskSnapshot::default();
        let parent = tracker.create_process(start(1, 0, false, &task)).unwrap();
        let child = tracker.create_process(start(2, 1, true, &task)).unwrap();
        let lone = tracker.create_process(start(3, 99, true, &task)).unwrap();

        tracker.open_file(&child, 1, 10, Some("/tmp/shared"), false);
        assert!(tracker.get_file_tree(pid(1)).unwrap().contains(&FileKey::new(pid(2), 1, 10)));
        assert!(tracker.get_file_tree(pid(3)).unwrap().is_empty());

        let mut visits = 0;
        let _ = tracker.for_each_tree(|tree| {
            assert_eq!(tree.len(), 1);
            visits += 1;
            ControlFlow::Continue(())
        });
        // pid 1 and pid 2 share the identity and its tree
        assert_eq!(visits, 2);

        assert!(tracker.close_file(&child, 1, 10));
        assert!(tracker.files().is_empty());
        assert!(tracker.get_file_tree(pid(2)).unwrap().is_empty());
        drop((parent, lone));
    }

    #[test]
    fn identity_teardown_purges_open_files() {
        let (tracker, _rx) = tracker();
        let task = TaskSnapshot::default();
        let posix = tracker.create_process(start(20, 99, true, &task)).unwrap();
        tracker.open_file(&posix, 2, 200, Some("/var/log/x"), false);
        tracker.open_file(&posix, 2, 201, Some("/var/log/y"), false);
        assert_eq!(tracker.files().len(), 2);
        assert!(tracker.report_exit(pid(20), Timestamp::from(1), 0));
        assert_eq!(tracker.files().len(), 2);
        drop(posix);
        assert!(tracker.files().is_empty());
    }

    #[test]
    fn reports_render() {
        let (tracker, _rx) = tracker();
        let task = TaskSnapshot {
            comm: "bash".to_string(),
            ..Default::default()
        };
        drop(tracker.create_process(start(30, 1, true, &task)));
        let table = tracker.show_table();
        assert_eq!(table.lines().count(), 2);
        assert!(table.lines().nth(1).unwrap().contains("bash"));
        assert!(tracker.show_stats().contains("create=1"));
    }

    #[test]
    fn shutdown_delivers_pending_exits() {
        let (tracker, mut rx) = tracker();
        let task = TaskSnapshot::default();
        let posix = tracker.create_process(start(40, 1, true, &task)).unwrap();
        tracker.store_exit_event(&posix, Event::exit(pid(40), Timestamp::from(4), 0, true));
        drop(posix);
        tracker.shutdown();
        assert!(tracker.is_empty());
        assert_eq!(
            rx.try_recv().unwrap().event_type,
            EventType::ProcessLastExit
        );
    }
}
