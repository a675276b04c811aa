//! Point-to-point and collective transport seam.
//!
//! A [`Transport`] is one participant's handle into an established group.
//! Every operation is enqueued on a device stream and returns without waiting
//! for the peers; grouped rounds are bracketed by
//! [`Transport::group_start`]/[`Transport::group_end`] so that all sends and
//! receives of a round progress together.
//!
//! [`CollectiveBackend`] creates transports through the out-of-band
//! rendezvous: one participant calls [`CollectiveBackend::unique_id`], the
//! id travels to every other participant by other means, and all of them call
//! [`CollectiveBackend::connect`] with it.

use std::ops::Range;
use std::time::Duration;

use super::error::Result;
use crate::buffer::DeviceBuffer;
use crate::runtime::Stream;

/// Opaque group id produced by one participant and shared with all others.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RendezvousId(pub Vec<u8>);

impl RendezvousId {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One participant's view of an established communication group.
pub trait Transport: Send + Sync {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Device this participant's buffers must live on.
    fn device(&self) -> usize;

    /// Open a grouped round. Groups may nest; only the outermost
    /// [`Transport::group_end`] issues the round.
    fn group_start(&self) -> Result<()>;

    fn group_end(&self) -> Result<()>;

    /// Send `bytes` of `buffer` to `peer`.
    fn send(&self, buffer: &DeviceBuffer, bytes: Range<usize>, peer: usize, stream: Stream)
        -> Result<()>;

    /// Receive from `peer` into `bytes` of `buffer`.
    fn recv(&self, buffer: &DeviceBuffer, bytes: Range<usize>, peer: usize, stream: Stream)
        -> Result<()>;

    /// In-place broadcast of the whole buffer from `root`.
    fn broadcast(&self, buffer: &DeviceBuffer, root: usize, stream: Stream) -> Result<()>;

    /// In-place elementwise sum over all participants.
    fn all_reduce_sum(&self, buffer: &DeviceBuffer, stream: Stream) -> Result<()>;
}

/// Factory for transports of one collective library.
pub trait CollectiveBackend: Send + Sync {
    type Transport: Transport + 'static;

    fn name(&self) -> &'static str;

    /// Fresh group id. Called by exactly one participant per group.
    fn unique_id(&self) -> Result<RendezvousId>;

    /// Join the group identified by `id`, blocking until all `world_size`
    /// participants have joined or `timeout` elapses.
    fn connect(
        &self,
        id: &RendezvousId,
        world_size: usize,
        rank: usize,
        device: usize,
        timeout: Duration,
    ) -> Result<Self::Transport>;
}

/// Byte range `[offset, offset + len)`.
pub(crate) fn span(offset: usize, len: usize) -> Range<usize> {
    offset..offset + len
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendezvous_id_accessors() {
        let id = RendezvousId(vec![1, 2, 3]);
        assert_eq!(id.len(), 3);
        assert!(!id.is_empty());
        assert_eq!(id.as_bytes(), &[1, 2, 3]);
    }

    #[test]
    fn span_is_half_open() {
        assert_eq!(span(4, 3), 4..7);
        assert!(span(9, 0).is_empty());
    }
}
