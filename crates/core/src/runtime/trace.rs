//! Call-order recorder for the simulated platform.
//!
//! The host runtime and the simulated transport append one [`TraceEvent`] per
//! enqueued operation, in issue order. Tests use the recorded sequence to
//! assert stream choreography (which stage went first, which slot was
//! released on which stream) without real devices.

use std::ops::Range;
use std::sync::{Arc, Mutex};

use super::StreamKind;

/// One operation enqueued on the simulated platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    /// A kernel was compiled for a device.
    Compile { entry: String, device: usize },
    /// A kernel was launched.
    Launch {
        entry: String,
        device: usize,
        stream: StreamKind,
    },
    /// An event slot was recorded on a stream ("release").
    EventRecord { slot: usize, stream: StreamKind },
    /// A stream was made to wait on an event slot ("acquire").
    EventWait { slot: usize, stream: StreamKind },
    /// A buffer was registered as used by a stream it was not allocated on.
    RecordStream { stream: StreamKind },
    /// Start of a grouped collective round.
    GroupStart,
    /// End of a grouped collective round.
    GroupEnd,
    /// Point-to-point send of a byte range.
    Send {
        peer: usize,
        bytes: Range<usize>,
        stream: StreamKind,
    },
    /// Point-to-point receive into a byte range.
    Recv {
        peer: usize,
        bytes: Range<usize>,
        stream: StreamKind,
    },
    /// Broadcast from `root`.
    Broadcast { root: usize },
    /// In-place sum all-reduce.
    AllReduce,
}

/// Shared, append-only log of [`TraceEvent`]s.
///
/// Cloning is cheap; all clones append to the same log.
#[derive(Debug, Clone, Default)]
pub struct CallTrace {
    events: Arc<Mutex<Vec<TraceEvent>>>,
}

impl CallTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: TraceEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }

    /// Snapshot of every event recorded so far.
    pub fn events(&self) -> Vec<TraceEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }

    /// Slots released on `stream`, in issue order.
    pub fn released_slots(&self, stream: StreamKind) -> Vec<usize> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                TraceEvent::EventRecord { slot, stream: s } if s == stream => Some(slot),
                _ => None,
            })
            .collect()
    }

    /// Slots acquired on `stream`, in issue order.
    pub fn acquired_slots(&self, stream: StreamKind) -> Vec<usize> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                TraceEvent::EventWait { slot, stream: s } if s == stream => Some(slot),
                _ => None,
            })
            .collect()
    }

    /// Number of compilations recorded for `entry`.
    pub fn compile_count(&self, entry: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, TraceEvent::Compile { entry: name, .. } if name == entry))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_log() {
        let trace = CallTrace::new();
        let other = trace.clone();
        other.push(TraceEvent::GroupStart);
        trace.push(TraceEvent::GroupEnd);
        assert_eq!(
            trace.events(),
            vec![TraceEvent::GroupStart, TraceEvent::GroupEnd]
        );
    }

    #[test]
    fn slot_filters_respect_stream() {
        let trace = CallTrace::new();
        trace.push(TraceEvent::EventRecord {
            slot: 1,
            stream: StreamKind::Comm,
        });
        trace.push(TraceEvent::EventRecord {
            slot: 0,
            stream: StreamKind::Compute,
        });
        trace.push(TraceEvent::EventWait {
            slot: 1,
            stream: StreamKind::Compute,
        });
        assert_eq!(trace.released_slots(StreamKind::Comm), vec![1]);
        assert_eq!(trace.released_slots(StreamKind::Compute), vec![0]);
        assert_eq!(trace.acquired_slots(StreamKind::Compute), vec![1]);
        assert!(trace.acquired_slots(StreamKind::Comm).is_empty());
    }
}
