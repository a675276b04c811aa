//! Cross-stream event slots.
//!
//! A fixed pool of device events indexed by pipeline split. Releasing a slot
//! records an event at the current tail of one stream; acquiring it makes
//! another stream wait for that point. Neither blocks the host.
//!
//! Each slot cycles `Idle -> Released -> Acquired -> Idle`: an acquire moves
//! the slot to `Acquired` while the wait is enqueued and the handed-off
//! buffer is registered with the acquiring stream, then back to `Idle`.
//! Ordering is the caller's discipline; the pool only observes it and warns
//! on release-after-release and acquire-before-release.

use std::sync::{Arc, Mutex};

use super::error::{DistributedError, Result};
use crate::buffer::DeviceBuffer;
use crate::runtime::{DeviceRuntime, Stream, StreamKind};

/// Observed state of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Released { by: StreamKind },
    Acquired { by: StreamKind },
}

#[derive(Debug, Clone, Copy)]
struct SlotRecord {
    state: SlotState,
    previous: SlotState,
    handoffs: usize,
}

impl SlotRecord {
    const IDLE: Self = Self {
        state: SlotState::Idle,
        previous: SlotState::Idle,
        handoffs: 0,
    };

    fn enter(&mut self, state: SlotState) {
        self.previous = self.state;
        self.state = state;
    }
}

/// Fixed-size pool of events on one device.
pub struct EventPool<R: DeviceRuntime> {
    runtime: Arc<R>,
    device: usize,
    events: Vec<R::Event>,
    slots: Mutex<Vec<SlotRecord>>,
}

impl<R: DeviceRuntime> EventPool<R> {
    pub fn new(runtime: Arc<R>, device: usize, capacity: usize) -> Result<Self> {
        let events = (0..capacity)
            .map(|slot| runtime.create_event(device, slot))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        tracing::debug!(device, capacity, "event pool created");
        Ok(Self {
            runtime,
            device,
            events,
            slots: Mutex::new(vec![SlotRecord::IDLE; capacity]),
        })
    }

    pub fn capacity(&self) -> usize {
        self.events.len()
    }

    pub fn device(&self) -> usize {
        self.device
    }

    fn record(&self, slot: usize) -> Option<SlotRecord> {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(slot)
            .copied()
    }

    pub fn state(&self, slot: usize) -> Option<SlotState> {
        self.record(slot).map(|r| r.state)
    }

    /// State `slot` was in before its last transition.
    pub fn previous_state(&self, slot: usize) -> Option<SlotState> {
        self.record(slot).map(|r| r.previous)
    }

    /// Completed release/acquire round trips of `slot`.
    pub fn handoffs(&self, slot: usize) -> Option<usize> {
        self.record(slot).map(|r| r.handoffs)
    }

    fn event(&self, slot: usize) -> Result<&R::Event> {
        self.events
            .get(slot)
            .ok_or(DistributedError::EventSlotOutOfRange {
                slot,
                capacity: self.events.len(),
            })
    }

    fn transition(&self, slot: usize, state: SlotState) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let record = &mut slots[slot];
        match (record.state, state) {
            (SlotState::Released { by }, SlotState::Released { by: stream }) => tracing::warn!(
                slot,
                previous = %by,
                stream = %stream,
                "event slot released again before any acquire"
            ),
            (SlotState::Idle, SlotState::Acquired { by: stream }) => tracing::warn!(
                slot,
                stream = %stream,
                "event slot acquired before it was released"
            ),
            (SlotState::Acquired { .. }, SlotState::Idle) => record.handoffs += 1,
            _ => {}
        }
        tracing::trace!(slot, from = ?record.state, to = ?state, "event slot transition");
        record.enter(state);
    }

    /// Record `slot` at the tail of `stream`.
    pub fn release(&self, slot: usize, stream: Stream) -> Result<()> {
        let event = self.event(slot)?;
        self.runtime.record_event(event, stream)?;
        self.transition(slot, SlotState::Released { by: stream.kind });
        Ok(())
    }

    /// Make `stream` wait for the last release of `slot`, registering
    /// `buffers` as used by `stream` before the slot returns to idle.
    pub fn acquire_for(&self, slot: usize, stream: Stream, buffers: &[&DeviceBuffer]) -> Result<()> {
        let event = self.event(slot)?;
        self.runtime.wait_event(event, stream)?;
        self.transition(slot, SlotState::Acquired { by: stream.kind });
        for buffer in buffers {
            self.runtime.record_stream(buffer, stream)?;
        }
        self.transition(slot, SlotState::Idle);
        Ok(())
    }

    /// Make `stream` wait for the last release of `slot`.
    pub fn acquire(&self, slot: usize, stream: Stream) -> Result<()> {
        self.acquire_for(slot, stream, &[])
    }

    fn on(&self, kind: StreamKind) -> Result<Stream> {
        Ok(self.runtime.stream(self.device, kind)?)
    }

    /// Hand `buffer` off from the compute stream at `slot`.
    pub fn release_on_compute(&self, buffer: &DeviceBuffer, slot: usize) -> Result<DeviceBuffer> {
        self.release(slot, self.on(StreamKind::Compute)?)?;
        Ok(buffer.clone())
    }

    /// Take `buffer` over on the compute stream once `slot` was released.
    pub fn acquire_on_compute(&self, buffer: &DeviceBuffer, slot: usize) -> Result<DeviceBuffer> {
        self.acquire_for(slot, self.on(StreamKind::Compute)?, &[buffer])?;
        Ok(buffer.clone())
    }

    /// Hand `buffer` off from the communication stream at `slot`.
    pub fn release_on_comm(&self, buffer: &DeviceBuffer, slot: usize) -> Result<DeviceBuffer> {
        self.release(slot, self.on(StreamKind::Comm)?)?;
        Ok(buffer.clone())
    }

    /// Take `buffer` over on the communication stream once `slot` was
    /// released.
    pub fn acquire_on_comm(&self, buffer: &DeviceBuffer, slot: usize) -> Result<DeviceBuffer> {
        self.acquire_for(slot, self.on(StreamKind::Comm)?, &[buffer])?;
        Ok(buffer.clone())
    }
}
