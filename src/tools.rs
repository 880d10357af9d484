//! Hooks into the tools/event layer.
//!
//! The core only guarantees that listeners run with the perf-events lock held
//! for read and after the mutation they describe has been applied.

use crate::lock::{LockMode, LockOrder, OrderToken};
use crate::processor::ProcessorId;
use parking_lot::RwLock;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MakeResidentCause {
    Fault,
    ReadDuplicate,
    PolicyChange,
    Eviction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapRemoteCause {
    AccessedBy,
    Coherence,
    PreferredLocation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PerfEvent {
    RangeDestroy {
        start: u64,
        end: u64,
    },
    /// A managed range was split; `new_start` begins the new upper half.
    RangeShrink {
        start: u64,
        end: u64,
        new_start: u64,
    },
    Migration {
        src: Option<ProcessorId>,
        dst: ProcessorId,
        address: u64,
        pages: usize,
        cause: MakeResidentCause,
    },
    ReadDuplicate {
        dst: ProcessorId,
        address: u64,
        pages: usize,
    },
    MapRemote {
        processor: ProcessorId,
        residency: ProcessorId,
        address: u64,
        pages: usize,
        cause: MapRemoteCause,
    },
    Unmap {
        processor: ProcessorId,
        address: u64,
        pages: usize,
    },
    PolicyChange {
        start: u64,
        end: u64,
    },
}

pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &PerfEvent);
}

/// Per-VA-space listener registry.
#[derive(Default)]
pub struct PerfEvents {
    listeners: RwLock<Vec<Arc<dyn EventListener>>>,
}

impl std::fmt::Debug for PerfEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerfEvents")
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

impl PerfEvents {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, listener: Arc<dyn EventListener>) {
        let _token = OrderToken::acquire(LockOrder::PerfEvents, LockMode::Exclusive);
        self.listeners.write().push(listener);
    }

    pub fn unregister(&self, listener: &Arc<dyn EventListener>) {
        let _token = OrderToken::acquire(LockOrder::PerfEvents, LockMode::Exclusive);
        self.listeners
            .write()
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub fn notify(&self, event: &PerfEvent) {
        self.notify_all(std::slice::from_ref(event));
    }

    pub fn notify_all(&self, events: &[PerfEvent]) {
        if events.is_empty() {
            return;
        }
        let _token = OrderToken::acquire(LockOrder::PerfEvents, LockMode::Shared);
        let listeners = self.listeners.read();
        for event in events {
            for listener in listeners.iter() {
                listener.on_event(event);
            }
        }
    }
}

/// Listener that keeps every event it sees. Useful for tests and tooling.
#[derive(Debug, Default)]
pub struct EventRecorder {
    events: parking_lot::Mutex<Vec<PerfEvent>>,
}

impl EventRecorder {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[must_use]
    pub fn take(&self) -> Vec<PerfEvent> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl EventListener for EventRecorder {
    fn on_event(&self, event: &PerfEvent) {
        self.events.lock().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_notify_unregister() {
        let events = PerfEvents::new();
        let recorder = EventRecorder::new();
        let listener: Arc<dyn EventListener> = recorder.clone();

        events.register(Arc::clone(&listener));
        events.notify(&PerfEvent::RangeDestroy {
            start: 0,
            end: 0xfff,
        });
        assert_eq!(recorder.take().len(), 1);

        events.unregister(&listener);
        events.notify(&PerfEvent::RangeDestroy {
            start: 0,
            end: 0xfff,
        });
        assert!(recorder.take().is_empty());
    }
}
