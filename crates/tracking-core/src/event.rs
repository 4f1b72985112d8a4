use std::{
    fmt,
    net::{IpAddr, SocketAddr},
    ops::{Index, IndexMut},
    sync::Arc,
};

use sensor_common::{Pid, serde_pid, time::Timestamp};
use serde::Serialize;
use strum::{Display, EnumString, IntoStaticStr};

use crate::exec_identity::ExecIdentity;

/// Closed set of event categories produced by the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    /// Process start by fork
    ProcessStart,
    ProcessStartExec,
    ProcessExit,
    /// Exit of the last process running an image
    ProcessLastExit,
    ProcessBlocked,
    FileCreate,
    FileDelete,
    FileOpen,
    FileWrite,
    FileClose,
    ModuleLoad,
    NetConnectPre,
    NetConnectPost,
    NetAccept,
    DnsResponse,
}

impl EventType {
    pub fn is_start(self) -> bool {
        matches!(self, EventType::ProcessStart | EventType::ProcessStartExec)
    }

    pub fn is_exit(self) -> bool {
        matches!(self, EventType::ProcessExit | EventType::ProcessLastExit)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Display)]
pub enum StartAction {
    #[default]
    ByFork,
    ByExec,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum IntentType {
    #[default]
    Report,
    Preaction,
    Prevention,
}

/// Identifying details of one process in a lineage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProcessDetails {
    #[serde(with = "serde_pid")]
    pub pid: Pid,
    pub start_time: Timestamp,
    pub device: u64,
    pub inode: u64,
}

impl ProcessDetails {
    pub fn new(pid: Pid, start_time: Timestamp, device: u64, inode: u64) -> Self {
        Self {
            pid,
            start_time,
            device,
            inode,
        }
    }

    /// Details with only a pid, used when nothing else is known.
    pub fn with_pid(pid: Pid) -> Self {
        Self {
            pid,
            ..Default::default()
        }
    }
}

impl Default for ProcessDetails {
    fn default() -> Self {
        Self {
            pid: Pid::from_raw(0),
            start_time: Timestamp::NULL,
            device: 0,
            inode: 0,
        }
    }
}

impl fmt::Display for ProcessDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}:{}) @{}",
            self.pid,
            self.device,
            self.inode,
            self.start_time.raw()
        )
    }
}

/// The six lineage slots of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSlot {
    Fork,
    ForkParent,
    ForkGrandparent,
    Exec,
    ExecParent,
    ExecGrandparent,
}

impl ProcessSlot {
    pub const ALL: [ProcessSlot; 6] = [
        ProcessSlot::Fork,
        ProcessSlot::ForkParent,
        ProcessSlot::ForkGrandparent,
        ProcessSlot::Exec,
        ProcessSlot::ExecParent,
        ProcessSlot::ExecGrandparent,
    ];
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct AllProcessDetails([ProcessDetails; 6]);

impl Index<ProcessSlot> for AllProcessDetails {
    type Output = ProcessDetails;

    fn index(&self, slot: ProcessSlot) -> &ProcessDetails {
        &self.0[slot as usize]
    }
}

impl IndexMut<ProcessSlot> for AllProcessDetails {
    fn index_mut(&mut self, slot: ProcessSlot) -> &mut ProcessDetails {
        &mut self.0[slot as usize]
    }
}

/// Lineage and image information attached to every event.
#[derive(Debug, Default, Clone, Serialize)]
pub struct ProcInfo {
    pub all_process_details: AllProcessDetails,
    pub path: Option<Arc<str>>,
    /// Length of `path` including the terminator byte expected by consumers
    pub path_size: usize,
    pub path_found: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "content")]
pub enum EventPayload {
    Start {
        action: StartAction,
        /// Not reported unless user reporting is enabled
        uid: Option<u32>,
        cmdline: Option<Arc<str>>,
    },
    Exit {
        exit_code: u32,
    },
    Blocked {
        device: u64,
        inode: u64,
        path: Option<String>,
    },
    File {
        device: u64,
        inode: u64,
        path: Option<String>,
        is_special: bool,
    },
    ModuleLoad {
        device: u64,
        inode: u64,
        path: Option<String>,
        base_address: u64,
    },
    Network {
        local: SocketAddr,
        remote: SocketAddr,
    },
    Dns {
        name: String,
        answers: Vec<IpAddr>,
    },
}

impl fmt::Display for EventPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventPayload::Start { action, uid, cmdline } => {
                write!(f, "Start {{ action: {action}, ")?;
                match uid {
                    Some(uid) => write!(f, "uid: {uid}, ")?,
                    None => write!(f, "uid: -1, ")?,
                }
                write!(f, "cmdline: {} }}", cmdline.as_deref().unwrap_or(""))
            }
            EventPayload::Exit { exit_code } => write!(f, "Exit {{ exit_code: {exit_code} }}"),
            EventPayload::Blocked { device, inode, path } => write!(
                f,
                "Blocked {{ device: {device}, inode: {inode}, path: {} }}",
                path.as_deref().unwrap_or("")
            ),
            EventPayload::File { device, inode, path, is_special } => write!(
                f,
                "File {{ device: {device}, inode: {inode}, path: {}, is_special: {is_special} }}",
                path.as_deref().unwrap_or("")
            ),
            EventPayload::ModuleLoad { device, inode, path, base_address } => write!(
                f,
                "Module Load {{ device: {device}, inode: {inode}, path: {}, base_address: {base_address:#x} }}",
                path.as_deref().unwrap_or("")
            ),
            EventPayload::Network { local, remote } => {
                write!(f, "Network {{ local: {local}, remote: {remote} }}")
            }
            EventPayload::Dns { name, answers } => {
                write!(f, "Dns Response {{ name: {name}, answers: [")?;
                for (i, answer) in answers.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{answer}")?;
                }
                write!(f, "] }}")
            }
        }
    }
}

/// A fully populated record ready to be handed to an [`EventSink`].
///
/// The attached identity holds the referenced [`ExecIdentity`] alive until
/// the sink drops the event.
///
/// [`EventSink`]: crate::sink::EventSink
#[derive(Debug, Serialize)]
pub struct Event {
    pub event_type: EventType,
    pub intent: IntentType,
    pub timestamp: Timestamp,
    #[serde(with = "serde_pid")]
    pub pid: Pid,
    pub proc_info: ProcInfo,
    pub payload: EventPayload,
    #[serde(skip)]
    process_data: Option<Arc<ExecIdentity>>,
}

impl Event {
    pub fn new(event_type: EventType, pid: Pid, timestamp: Timestamp, payload: EventPayload) -> Self {
        Self {
            event_type,
            intent: IntentType::Report,
            timestamp,
            pid,
            proc_info: ProcInfo::default(),
            payload,
            process_data: None,
        }
    }

    pub fn start(
        pid: Pid,
        timestamp: Timestamp,
        action: StartAction,
        uid: Option<u32>,
        cmdline: Option<Arc<str>>,
    ) -> Self {
        let event_type = match action {
            StartAction::ByFork => EventType::ProcessStart,
            StartAction::ByExec => EventType::ProcessStartExec,
        };
        Self::new(
            event_type,
            pid,
            timestamp,
            EventPayload::Start {
                action,
                uid,
                cmdline,
            },
        )
    }

    pub fn exit(pid: Pid, timestamp: Timestamp, exit_code: u32, last: bool) -> Self {
        let event_type = if last {
            EventType::ProcessLastExit
        } else {
            EventType::ProcessExit
        };
        Self::new(event_type, pid, timestamp, EventPayload::Exit { exit_code })
    }

    pub fn blocked(
        pid: Pid,
        timestamp: Timestamp,
        device: u64,
        inode: u64,
        path: Option<String>,
    ) -> Self {
        Self::new(
            EventType::ProcessBlocked,
            pid,
            timestamp,
            EventPayload::Blocked {
                device,
                inode,
                path,
            },
        )
    }

    pub fn file(
        event_type: EventType,
        pid: Pid,
        timestamp: Timestamp,
        device: u64,
        inode: u64,
        path: Option<String>,
        is_special: bool,
    ) -> Self {
        Self::new(
            event_type,
            pid,
            timestamp,
            EventPayload::File {
                device,
                inode,
                path,
                is_special,
            },
        )
    }

    pub fn module_load(
        pid: Pid,
        timestamp: Timestamp,
        device: u64,
        inode: u64,
        path: Option<String>,
        base_address: u64,
    ) -> Self {
        Self::new(
            EventType::ModuleLoad,
            pid,
            timestamp,
            EventPayload::ModuleLoad {
                device,
                inode,
                path,
                base_address,
            },
        )
    }

    pub fn network(
        event_type: EventType,
        pid: Pid,
        timestamp: Timestamp,
        local: SocketAddr,
        remote: SocketAddr,
    ) -> Self {
        Self::new(event_type, pid, timestamp, EventPayload::Network { local, remote })
    }

    pub fn dns(pid: Pid, timestamp: Timestamp, name: String, answers: Vec<IpAddr>) -> Self {
        Self::new(
            EventType::DnsResponse,
            pid,
            timestamp,
            EventPayload::Dns { name, answers },
        )
    }

    /// The exec identity this event keeps alive, if any.
    pub fn process_data(&self) -> Option<&Arc<ExecIdentity>> {
        self.process_data.as_ref()
    }

    /// Attach `identity`, releasing the previously attached one.
    pub fn set_process_data(&mut self, identity: Option<Arc<ExecIdentity>>) {
        self.process_data = identity;
    }

    pub fn take_process_data(&mut self) -> Option<Arc<ExecIdentity>> {
        self.process_data.take()
    }

    pub fn details(&self, slot: ProcessSlot) -> &ProcessDetails {
        &self.proc_info.all_process_details[slot]
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = self.proc_info.path.as_deref().unwrap_or("<unknown>");
        let intent = match self.intent {
            IntentType::Report => String::new(),
            other => format!(" {}", other.to_string().to_uppercase()),
        };
        write!(
            f,
            "[{} {}{} {} ({})] {}",
            self.timestamp, self.event_type, intent, path, self.pid, self.payload
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_names() {
        assert_eq!(EventType::ProcessLastExit.to_string(), "PROCESS_LAST_EXIT");
        assert_eq!(
            "FILE_OPEN".parse::<EventType>().unwrap(),
            EventType::FileOpen
        );
        assert!(EventType::ProcessStartExec.is_start());
        assert!(EventType::ProcessLastExit.is_exit());
        assert!(!EventType::ProcessBlocked.is_exit());
    }

    #[test]
    fn lineage_slots_are_independent() {
        let mut all = AllProcessDetails::default();
        all[ProcessSlot::ExecParent] = ProcessDetails::with_pid(Pid::from_raw(7));
        for slot in ProcessSlot::ALL {
            let expected = if slot == ProcessSlot::ExecParent { 7 } else { 0 };
            assert_eq!(all[slot].pid.as_raw(), expected);
        }
    }

    #[test]
    fn exit_constructor() {
        let event = Event::exit(Pid::from_raw(3), Timestamp::from(10), 1, true);
        assert_eq!(event.event_type, EventType::ProcessLastExit);
        assert_eq!(event.intent, IntentType::Report);
        assert!(event.process_data().is_none());
        assert!(event.to_string().contains("PROCESS_LAST_EXIT"));
    }

    #[test]
    fn serialize_skips_identity() {
        let event = Event::start(
            Pid::from_raw(5),
            Timestamp::from(1),
            StartAction::ByExec,
            None,
            Some("ls -l".into()),
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "PROCESS_START_EXEC");
        assert_eq!(json["pid"], 5);
        assert_eq!(json["payload"]["content"]["cmdline"], "ls -l");
        assert!(json.get("process_data").is_none());
    }
}
