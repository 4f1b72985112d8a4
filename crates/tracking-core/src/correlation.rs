//! Attaching identities to events.
//!
//! Every event keeps an exec identity alive until the sink drops it, and an
//! identity only delivers its stored exit event when it is torn down. Which
//! identity an event holds therefore decides what the consumer sees first:
//!
//! - start by exec and blocked events hold the parent image, so the
//!   parent's last exit comes after the child's start
//! - exit events hold the image that replaced the exiting one, so that
//!   image's own exit comes after
//! - every other event holds its own image, so the image's exit comes after
//!   all of its activity

use crate::{
    event::{Event, EventType, IntentType, ProcessSlot},
    posix_identity::PosixIdentity,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentitySource {
    /// The identity currently attached to the process
    Natural,
    /// The identity staged in the process handoff slot
    Handoff,
}

impl EventType {
    pub fn identity_source(self) -> IdentitySource {
        match self {
            EventType::ProcessExit
            | EventType::ProcessLastExit
            | EventType::ProcessStartExec
            | EventType::ProcessBlocked => IdentitySource::Handoff,
            EventType::ProcessStart
            | EventType::FileCreate
            | EventType::FileDelete
            | EventType::FileOpen
            | EventType::FileWrite
            | EventType::FileClose
            | EventType::ModuleLoad
            | EventType::NetConnectPre
            | EventType::NetConnectPost
            | EventType::NetAccept
            | EventType::DnsResponse => IdentitySource::Natural,
        }
    }
}

/// Fill lineage, path and intent of `event` and attach the identity its
/// category calls for.
///
/// The handoff slot of `posix` is emptied whether or not an event is given,
/// so this is also how a staged identity is released when no event is
/// built.
pub fn set_event_info(posix: &PosixIdentity, intent: IntentType, event: Option<&mut Event>) {
    let handoff = posix.take_handoff();
    let natural = posix.exec_identity();

    let (Some(event), Some(natural)) = (event, natural) else {
        return;
    };

    let details = &mut event.proc_info.all_process_details;
    details[ProcessSlot::Fork] = posix.posix_details();
    details[ProcessSlot::ForkParent] = *posix.posix_parent_details();
    details[ProcessSlot::ForkGrandparent] = *posix.posix_grandparent_details();
    let lineage = natural.lineage();
    details[ProcessSlot::Exec] = lineage.exec;
    details[ProcessSlot::ExecParent] = lineage.exec_parent;
    details[ProcessSlot::ExecGrandparent] = lineage.exec_grandparent;

    let path = natural.path();
    event.proc_info.path_found = natural.path_found();
    event.proc_info.path_size = path.as_ref().map_or(0, |path| path.len() + 1);
    event.proc_info.path = path;

    match event.event_type.identity_source() {
        IdentitySource::Handoff => event.set_process_data(handoff),
        IdentitySource::Natural => event.set_process_data(Some(natural)),
    }
    event.intent = intent;
}
