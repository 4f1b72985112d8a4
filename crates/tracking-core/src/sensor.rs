//! Routing of raw sensor records into the tracker.

use sensor_common::{RawEvent, RawPayload};

use crate::{
    event::{Event, EventType, IntentType, StartAction},
    posix_identity::PosixIdentity,
    process_tracking::{ExecUpdate, ProcessStart, ProcessTracker},
};

pub struct Sensor {
    tracker: ProcessTracker,
}

impl Sensor {
    pub fn new(tracker: ProcessTracker) -> Self {
        Self { tracker }
    }

    pub fn tracker(&self) -> &ProcessTracker {
        &self.tracker
    }

    /// Apply one raw record. Returns false if the record was dropped.
    pub fn handle(&self, raw: RawEvent) -> bool {
        let RawEvent {
            timestamp,
            pid,
            task,
            payload,
        } = raw;

        match payload {
            RawPayload::Fork { ppid } => {
                let Some(posix) = self.tracker.create_process(ProcessStart {
                    pid,
                    parent: ppid,
                    tid: task.tid.unwrap_or(pid),
                    uid: task.uid,
                    euid: task.euid,
                    start_time: timestamp,
                    action: StartAction::ByFork,
                    is_real_start: true,
                    task: &task,
                }) else {
                    return false;
                };
                posix.counters().record(EventType::ProcessStart);
                self.tracker.send_start(&posix, timestamp, StartAction::ByFork);
                true
            }
            RawPayload::Exec {
                path,
                path_found,
                device,
                inode,
                cmdline,
            } => {
                let Some(posix) = self.tracker.update_process(ExecUpdate {
                    pid,
                    tid: task.tid.unwrap_or(pid),
                    uid: task.uid,
                    euid: task.euid,
                    device,
                    inode,
                    path: path.as_deref(),
                    path_found,
                    start_time: timestamp,
                    action: StartAction::ByExec,
                    event_type: EventType::ProcessStartExec,
                    is_real_start: true,
                    task: &task,
                }) else {
                    return false;
                };
                if let Some(exec) = posix.exec_identity() {
                    exec.set_cmdline(cmdline.as_deref().or(path.as_deref()));
                }
                self.tracker.send_start(&posix, timestamp, StartAction::ByExec);
                true
            }
            RawPayload::Exit { exit_code } => self.tracker.report_exit(pid, timestamp, exit_code),
            payload => {
                let name = payload.name();
                let Some(posix) = self
                    .tracker
                    .get_procinfo_and_create_process_start_if_needed(pid, name, &task, timestamp)
                else {
                    log::debug!("{name}: unable to track {pid}");
                    return false;
                };
                self.handle_activity(&posix, timestamp, payload);
                true
            }
        }
    }

    fn handle_activity(
        &self,
        posix: &PosixIdentity,
        timestamp: sensor_common::time::Timestamp,
        payload: RawPayload,
    ) {
        let pid = posix.pid();
        let event = match payload {
            RawPayload::Blocked {
                device,
                inode,
                path,
            } => {
                posix.mark_exec_blocked();
                self.tracker
                    .send_blocked(posix, timestamp, device, inode, path);
                return;
            }
            RawPayload::FileOpen {
                device,
                inode,
                path,
                is_special,
            } => {
                self.tracker
                    .open_file(posix, device, inode, path.as_deref(), is_special);
                Event::file(
                    EventType::FileOpen,
                    pid,
                    timestamp,
                    device,
                    inode,
                    path,
                    is_special,
                )
            }
            RawPayload::FileClose {
                device,
                inode,
                path,
            } => {
                let is_special = self
                    .tracker
                    .files()
                    .get(pid, device, inode)
                    .is_some_and(|entry| entry.is_special());
                if !self.tracker.close_file(posix, device, inode) {
                    log::debug!("close of untracked file {device}:{inode} by {pid}");
                }
                Event::file(
                    EventType::FileClose,
                    pid,
                    timestamp,
                    device,
                    inode,
                    path,
                    is_special,
                )
            }
            RawPayload::FileWrite {
                device,
                inode,
                path,
            } => Event::file(EventType::FileWrite, pid, timestamp, device, inode, path, false),
            RawPayload::FileCreate {
                device,
                inode,
                path,
            } => Event::file(
                EventType::FileCreate,
                pid,
                timestamp,
                device,
                inode,
                path,
                false,
            ),
            RawPayload::FileDelete {
                device,
                inode,
                path,
            } => Event::file(
                EventType::FileDelete,
                pid,
                timestamp,
                device,
                inode,
                path,
                false,
            ),
            RawPayload::ModuleLoad {
                device,
                inode,
                path,
                base_address,
            } => Event::module_load(pid, timestamp, device, inode, path, base_address),
            RawPayload::NetConnectPre { local, remote } => {
                Event::network(EventType::NetConnectPre, pid, timestamp, local, remote)
            }
            RawPayload::NetConnectPost { local, remote } => {
                Event::network(EventType::NetConnectPost, pid, timestamp, local, remote)
            }
            RawPayload::NetAccept { local, remote } => {
                Event::network(EventType::NetAccept, pid, timestamp, local, remote)
            }
            RawPayload::DnsResponse { name, answers } => Event::dns(pid, timestamp, name, answers),
            RawPayload::Fork { .. } | RawPayload::Exec { .. } | RawPayload::Exit { .. } => {
                log::error!("process record routed as activity for {pid}");
                return;
            }
        };
        self.emit(posix, event);
    }

    fn emit(&self, posix: &PosixIdentity, mut event: Event) {
        posix.counters().record(event.event_type);
        self.tracker
            .set_event_info(posix, IntentType::Report, Some(&mut event));
        self.tracker.context().sink.send(event);
    }
}
