//! Raw notification records, as produced by the probe layer.
//!
//! A [`RawEvent`] carries the pid which triggered the notification, a
//! snapshot of the current task (used when the process was never seen
//! before) and a type-specific [`RawPayload`].

use std::{
    fmt,
    net::{IpAddr, SocketAddr},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{Pid, serde_pid, time::Timestamp};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEvent {
    pub timestamp: Timestamp,
    #[serde(with = "serde_pid")]
    pub pid: Pid,
    #[serde(default)]
    pub task: TaskSnapshot,
    pub payload: RawPayload,
}

/// What the probe could read from the task struct of the current process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSnapshot {
    #[serde(with = "serde_pid::option")]
    pub tid: Option<Pid>,
    pub uid: u32,
    pub euid: u32,
    /// Short command name, used as path when the real one is unknown
    pub comm: String,
    /// Full path of the executable image, if the probe could resolve it
    pub exe_path: Option<String>,
    /// Device and inode of the executable image
    pub device: u64,
    pub inode: u64,
    #[serde(with = "serde_pid::option")]
    pub parent_pid: Option<Pid>,
    pub parent_device: u64,
    pub parent_inode: u64,
    /// The parent is still running and is a userspace task
    pub parent_alive: bool,
    #[serde(with = "serde_pid::option")]
    pub grandparent_pid: Option<Pid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "content")]
pub enum RawPayload {
    Fork {
        #[serde(with = "serde_pid")]
        ppid: Pid,
    },
    Exec {
        path: Option<String>,
        #[serde(default)]
        path_found: bool,
        device: u64,
        inode: u64,
        cmdline: Option<String>,
    },
    Exit {
        #[serde(default)]
        exit_code: u32,
    },
    Blocked {
        device: u64,
        inode: u64,
        path: Option<String>,
    },
    FileCreate {
        device: u64,
        inode: u64,
        path: Option<String>,
    },
    FileDelete {
        device: u64,
        inode: u64,
        path: Option<String>,
    },
    FileOpen {
        device: u64,
        inode: u64,
        path: Option<String>,
        #[serde(default)]
        is_special: bool,
    },
    FileWrite {
        device: u64,
        inode: u64,
        path: Option<String>,
    },
    FileClose {
        device: u64,
        inode: u64,
        path: Option<String>,
    },
    ModuleLoad {
        device: u64,
        inode: u64,
        path: Option<String>,
        #[serde(default)]
        base_address: u64,
    },
    NetConnectPre {
        local: SocketAddr,
        remote: SocketAddr,
    },
    NetConnectPost {
        local: SocketAddr,
        remote: SocketAddr,
    },
    NetAccept {
        local: SocketAddr,
        remote: SocketAddr,
    },
    DnsResponse {
        name: String,
        answers: Vec<IpAddr>,
    },
}

#[derive(Debug, Error)]
pub enum RawEventError {
    #[error("malformed raw record")]
    Malformed(#[from] serde_json::Error),
    #[error("raw record for pid 0 ({0})")]
    KernelPid(&'static str),
}

impl RawEvent {
    /// Parse one JSON encoded record. Records for pid 0 are refused since
    /// the kernel itself is never tracked.
    pub fn from_json(line: &str) -> Result<Self, RawEventError> {
        let event: RawEvent = serde_json::from_str(line)?;
        if event.pid.as_raw() == 0 {
            return Err(RawEventError::KernelPid(event.payload.name()));
        }
        Ok(event)
    }
}

impl RawPayload {
    pub fn name(&self) -> &'static str {
        match self {
            RawPayload::Fork { .. } => "fork",
            RawPayload::Exec { .. } => "exec",
            RawPayload::Exit { .. } => "exit",
            RawPayload::Blocked { .. } => "blocked",
            RawPayload::FileCreate { .. } => "file-create",
            RawPayload::FileDelete { .. } => "file-delete",
            RawPayload::FileOpen { .. } => "file-open",
            RawPayload::FileWrite { .. } => "file-write",
            RawPayload::FileClose { .. } => "file-close",
            RawPayload::ModuleLoad { .. } => "module-load",
            RawPayload::NetConnectPre { .. } => "net-connect-pre",
            RawPayload::NetConnectPost { .. } => "net-connect-post",
            RawPayload::NetAccept { .. } => "net-accept",
            RawPayload::DnsResponse { .. } => "dns-response",
        }
    }
}

impl fmt::Display for RawEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.timestamp, self.pid, self.payload.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_exec_record() {
        let line = r#"{"timestamp":15,"pid":42,"task":{"comm":"x","parent_pid":1},
            "payload":{"type":"Exec","content":{"path":"/bin/x","device":3,"inode":7,"cmdline":"x -v"}}}"#;
        let event = RawEvent::from_json(line).unwrap();
        assert_eq!(event.pid, Pid::from_raw(42));
        assert_eq!(event.task.parent_pid, Some(Pid::from_raw(1)));
        assert_eq!(event.task.tid, None);
        match event.payload {
            RawPayload::Exec {
                path,
                path_found,
                inode,
                ..
            } => {
                assert_eq!(path.as_deref(), Some("/bin/x"));
                assert!(!path_found);
                assert_eq!(inode, 7);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn refuse_kernel_pid() {
        let line = r#"{"timestamp":1,"pid":0,"payload":{"type":"Exit","content":{}}}"#;
        assert!(matches!(
            RawEvent::from_json(line),
            Err(RawEventError::KernelPid("exit"))
        ));
    }

    #[test]
    fn refuse_garbage() {
        assert!(matches!(
            RawEvent::from_json("{not json"),
            Err(RawEventError::Malformed(_))
        ));
    }
}
