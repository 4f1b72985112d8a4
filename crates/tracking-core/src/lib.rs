//! Identity and file tracking engine.
//!
//! Keeps track of every running process (its posix identity), the image
//! each one runs (its exec identity) and the files they hold open, and
//! attaches that state to outgoing events so consumers always see a
//! process start before its activity and its exit after both.
//!
//! [`sensor::Sensor`] is the entry point: it routes raw probe records into
//! a [`process_tracking::ProcessTracker`], which emits into an
//! [`sink::EventSink`].

pub mod config;
pub mod context;
pub mod correlation;
pub mod event;
pub mod exec_identity;
pub mod file_tracking;
pub mod file_tree;
pub mod posix_identity;
pub mod process_handle;
pub mod process_tracking;
pub mod report;
pub mod sensor;
pub mod sink;
pub mod store;
mod sync;

pub use event::{Event, EventType};
pub use process_tracking::ProcessTracker;
pub use sensor::Sensor;
