use tokio::sync::mpsc;

use crate::event::Event;

/// Receiver of fully populated events.
///
/// `send` is called from tracking paths and from identity teardown, so it
/// must never block.
pub trait EventSink: Send + Sync + 'static {
    fn send(&self, event: Event);
}

impl EventSink for mpsc::UnboundedSender<Event> {
    fn send(&self, event: Event) {
        if let Err(mpsc::error::SendError(event)) = mpsc::UnboundedSender::send(self, event) {
            log::warn!(
                "event sink closed: dropping {} for {}",
                event.event_type,
                event.pid
            );
        }
    }
}

/// Sink discarding every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn send(&self, event: Event) {
        log::trace!("discarding {} for {}", event.event_type, event.pid);
    }
}
