use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::Serialize;

use crate::{
    config::TrackerConfig, event::StartAction, file_tracking::FileTracker, sink::EventSink,
};

/// State shared by the process registry and every exec identity.
pub struct TrackingContext {
    pub config: TrackerConfig,
    pub sink: Box<dyn EventSink>,
    pub files: FileTracker,
    pub stats: TrackingStats,
}

impl TrackingContext {
    pub fn new(config: TrackerConfig, sink: impl EventSink) -> Self {
        let files = FileTracker::new(config.table_size);
        Self {
            config,
            sink: Box::new(sink),
            files,
            stats: TrackingStats::default(),
        }
    }
}

#[derive(Debug, Default)]
pub struct TrackingStats {
    op_cnt: AtomicU64,
    create: AtomicU64,
    exit: AtomicU64,
    create_by_fork: AtomicU64,
    create_by_exec: AtomicU64,
    live_exec_identities: AtomicI64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub op_cnt: u64,
    pub create: u64,
    pub exit: u64,
    pub create_by_fork: u64,
    pub create_by_exec: u64,
    pub live_exec_identities: i64,
}

impl TrackingStats {
    /// A process entered the table.
    pub(crate) fn record_create(&self, action: StartAction) {
        self.op_cnt.fetch_add(1, Ordering::Relaxed);
        self.create.fetch_add(1, Ordering::Relaxed);
        match action {
            StartAction::ByFork => self.create_by_fork.fetch_add(1, Ordering::Relaxed),
            StartAction::ByExec => self.create_by_exec.fetch_add(1, Ordering::Relaxed),
        };
    }

    /// A tracked process replaced its image.
    pub(crate) fn record_exec(&self) {
        self.op_cnt.fetch_add(1, Ordering::Relaxed);
        self.create_by_exec.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_exit(&self) {
        self.op_cnt.fetch_add(1, Ordering::Relaxed);
        self.exit.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn exec_identity_created(&self) {
        self.live_exec_identities.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn exec_identity_destroyed(&self) {
        self.live_exec_identities.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            op_cnt: self.op_cnt.load(Ordering::Relaxed),
            create: self.create.load(Ordering::Relaxed),
            exit: self.exit.load(Ordering::Relaxed),
            create_by_fork: self.create_by_fork.load(Ordering::Relaxed),
            create_by_exec: self.create_by_exec.load(Ordering::Relaxed),
            live_exec_identities: self.live_exec_identities.load(Ordering::Acquire),
        }
    }
}
