//! Variable-size batched collectives over a [`Transport`].
//!
//! All operations run on the compute stream of the communicator's device
//! and are validated completely before the first transfer is issued, so a
//! rejected call leaves no partial round behind.

use std::sync::Arc;

use candle_core::DType;

use super::error::{DistributedError, Result};
use super::transport::{span, Transport};
use crate::buffer::DeviceBuffer;
use crate::runtime::{DeviceRuntime, Stream, StreamKind};

/// Group geometry of one communicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommunicatorState {
    pub world_size: usize,
    pub world_rank: usize,
    /// Devices per node.
    pub local_size: usize,
    /// Rank within the node.
    pub local_rank: usize,
}

impl CommunicatorState {
    /// Ranks are assumed to be numbered node by node, `local_size` per node.
    pub fn new(world_size: usize, world_rank: usize, local_size: usize) -> Self {
        assert!(world_size > 0, "world_size must be > 0");
        assert!(
            world_rank < world_size,
            "world_rank {world_rank} must be < world_size {world_size}"
        );
        assert!(local_size > 0, "local_size must be > 0");
        Self {
            world_size,
            world_rank,
            local_size,
            local_rank: world_rank % local_size,
        }
    }

    /// Number of nodes, rounded down.
    pub fn num_nodes(&self) -> usize {
        self.world_size / self.local_size
    }

    pub fn node_rank(&self) -> usize {
        self.world_rank / self.local_size
    }
}

/// One communication group plus the platform its buffers live on.
pub struct Communicator<R: DeviceRuntime, T: Transport> {
    runtime: Arc<R>,
    transport: T,
    state: CommunicatorState,
}

impl<R: DeviceRuntime, T: Transport> Communicator<R, T> {
    pub fn new(runtime: Arc<R>, transport: T, local_size: usize) -> Self {
        let state = CommunicatorState::new(transport.world_size(), transport.rank(), local_size);
        Self {
            runtime,
            transport,
            state,
        }
    }

    pub fn state(&self) -> &CommunicatorState {
        &self.state
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn runtime(&self) -> &Arc<R> {
        &self.runtime
    }

    pub fn world_size(&self) -> usize {
        self.state.world_size
    }

    pub fn rank(&self) -> usize {
        self.state.world_rank
    }

    pub fn device(&self) -> usize {
        self.transport.device()
    }

    pub(crate) fn stream(&self, kind: StreamKind) -> Result<Stream> {
        Ok(self.runtime.stream(self.device(), kind)?)
    }

    pub(crate) fn check_device(&self, buffer: &DeviceBuffer) -> Result<()> {
        if buffer.device() != self.device() {
            return Err(DistributedError::DeviceMismatch {
                expected: self.device(),
                actual: buffer.device(),
            });
        }
        Ok(())
    }

    fn check_counts(&self, op: &'static str, name: &str, sizes: &[usize]) -> Result<()> {
        if sizes.len() != self.world_size() {
            return Err(DistributedError::InvalidSplit(format!(
                "{op}: {name} has {} entries for {} participants",
                sizes.len(),
                self.world_size()
            )));
        }
        Ok(())
    }

    /// Shared checks of the batched variable collectives: matching list
    /// lengths, one element count and dtype for all inputs, outputs of the
    /// same dtype, everything on this device.
    fn check_batch(
        &self,
        op: &'static str,
        inputs: &[DeviceBuffer],
        outputs: &[DeviceBuffer],
    ) -> Result<Option<DType>> {
        if inputs.len() != outputs.len() {
            return Err(DistributedError::ShapeMismatch {
                op,
                expected: vec![inputs.len()],
                actual: vec![outputs.len()],
            });
        }
        let Some(first) = inputs.first() else {
            return Ok(None);
        };
        for buffer in inputs.iter().chain(outputs) {
            self.check_device(buffer)?;
            if buffer.dtype() != first.dtype() {
                return Err(DistributedError::DtypeMismatch {
                    op,
                    expected: format!("{:?}", first.dtype()),
                    actual: format!("{:?}", buffer.dtype()),
                });
            }
        }
        for input in inputs {
            if input.numel() != first.numel() {
                return Err(DistributedError::ShapeMismatch {
                    op,
                    expected: first.shape().to_vec(),
                    actual: input.shape().to_vec(),
                });
            }
        }
        Ok(Some(first.dtype()))
    }

    /// Sum of `sizes`, checked so that the byte count `sum * elem` (and so
    /// every offset below it) fits in `usize`.
    fn checked_total(op: &'static str, sizes: &[usize], elem: usize) -> Result<usize> {
        sizes
            .iter()
            .try_fold(0usize, |acc, &n| acc.checked_add(n))
            .filter(|total| total.checked_mul(elem).is_some())
            .ok_or_else(|| DistributedError::ShapeMismatch {
                op,
                expected: vec![usize::MAX / elem.max(1)],
                actual: sizes.to_vec(),
            })
    }

    fn check_capacity(
        op: &'static str,
        buffers: &[DeviceBuffer],
        needed: usize,
    ) -> Result<()> {
        for buffer in buffers {
            if buffer.numel() < needed {
                return Err(DistributedError::ShapeMismatch {
                    op,
                    expected: vec![needed],
                    actual: vec![buffer.numel()],
                });
            }
        }
        Ok(())
    }

    /// For each `(inputs[k], outputs[k])` pair, one grouped round sending
    /// `in_sizes[i]` elements to rank `i` and receiving `out_sizes[i]`
    /// elements from it, packed back to back on both sides.
    pub fn batch_all_to_all_variable(
        &self,
        inputs: &[DeviceBuffer],
        outputs: &[DeviceBuffer],
        in_sizes: &[usize],
        out_sizes: &[usize],
    ) -> Result<()> {
        const OP: &str = "batch_all_to_all_variable";
        self.check_counts(OP, "in_sizes", in_sizes)?;
        self.check_counts(OP, "out_sizes", out_sizes)?;
        let Some(dtype) = self.check_batch(OP, inputs, outputs)? else {
            return Ok(());
        };
        let elem = dtype.size_in_bytes();
        Self::check_capacity(OP, inputs, Self::checked_total(OP, in_sizes, elem)?)?;
        Self::check_capacity(OP, outputs, Self::checked_total(OP, out_sizes, elem)?)?;

        let stream = self.stream(StreamKind::Compute)?;
        for (input, output) in inputs.iter().zip(outputs) {
            self.transport.group_start()?;
            let (mut in_offset, mut out_offset) = (0, 0);
            for peer in 0..self.world_size() {
                let (send_len, recv_len) = (in_sizes[peer] * elem, out_sizes[peer] * elem);
                self.transport
                    .send(input, span(in_offset, send_len), peer, stream)?;
                self.transport
                    .recv(output, span(out_offset, recv_len), peer, stream)?;
                in_offset += send_len;
                out_offset += recv_len;
            }
            self.transport.group_end()?;
        }
        tracing::trace!(
            rounds = inputs.len(),
            rank = self.rank(),
            "batch_all_to_all_variable issued"
        );
        Ok(())
    }

    /// For each `(inputs[k], outputs[k])` pair, every rank contributes its
    /// first `out_sizes[rank]` elements; the output holds all contributions
    /// in rank order. Zero-sized transfers are not issued.
    pub fn batch_all_gather_variable(
        &self,
        inputs: &[DeviceBuffer],
        outputs: &[DeviceBuffer],
        out_sizes: &[usize],
    ) -> Result<()> {
        const OP: &str = "batch_all_gather_variable";
        self.check_counts(OP, "out_sizes", out_sizes)?;
        let Some(dtype) = self.check_batch(OP, inputs, outputs)? else {
            return Ok(());
        };
        let elem = dtype.size_in_bytes();
        let own = out_sizes[self.rank()];
        Self::check_capacity(OP, outputs, Self::checked_total(OP, out_sizes, elem)?)?;
        Self::check_capacity(OP, inputs, own)?;

        let stream = self.stream(StreamKind::Compute)?;
        for (input, output) in inputs.iter().zip(outputs) {
            self.transport.group_start()?;
            let mut out_offset = 0;
            for (peer, &count) in out_sizes.iter().enumerate() {
                if own > 0 {
                    self.transport.send(input, span(0, own * elem), peer, stream)?;
                }
                if count > 0 {
                    self.transport
                        .recv(output, span(out_offset, count * elem), peer, stream)?;
                }
                out_offset += count * elem;
            }
            self.transport.group_end()?;
        }
        Ok(())
    }

    /// In-place broadcast from `root`.
    pub fn broadcast(&self, buffer: &DeviceBuffer, root: usize) -> Result<()> {
        if root >= self.world_size() {
            return Err(DistributedError::InvalidRank {
                rank: root,
                world_size: self.world_size(),
            });
        }
        self.check_device(buffer)?;
        let stream = self.stream(StreamKind::Compute)?;
        self.transport.broadcast(buffer, root, stream)
    }

    /// In-place sum over all ranks.
    pub fn allreduce(&self, buffer: &DeviceBuffer) -> Result<()> {
        self.check_device(buffer)?;
        let stream = self.stream(StreamKind::Compute)?;
        self.transport.all_reduce_sum(buffer, stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::sim::{SimBackend, SimNetwork};
    use crate::distributed::transport::CollectiveBackend;
    use crate::runtime::host::HostRuntime;
    use crate::runtime::CallTrace;
    use std::time::Duration;

    fn single() -> (Communicator<HostRuntime, crate::distributed::sim::SimTransport>, CallTrace) {
        let trace = CallTrace::new();
        let backend = SimBackend::new(SimNetwork::new(), trace.clone());
        let id = backend.unique_id().unwrap();
        let transport = backend
            .connect(&id, 1, 0, 0, Duration::from_secs(1))
            .unwrap();
        let runtime = Arc::new(HostRuntime::with_trace(1, trace.clone()));
        (Communicator::new(runtime, transport, 1), trace)
    }

    #[test]
    fn state_derives_node_geometry() {
        let state = CommunicatorState::new(8, 6, 4);
        assert_eq!(state.local_rank, 2);
        assert_eq!(state.node_rank(), 1);
        assert_eq!(state.num_nodes(), 2);
    }

    #[test]
    #[should_panic(expected = "world_rank 3 must be < world_size 2")]
    fn state_rejects_bad_rank() {
        CommunicatorState::new(2, 3, 1);
    }

    #[test]
    fn mismatched_inputs_fail_before_any_transfer() {
        let (comm, trace) = single();
        let a = DeviceBuffer::zeros_host(0, DType::F32, &[4]);
        let b = DeviceBuffer::zeros_host(0, DType::F32, &[6]);
        let out = DeviceBuffer::zeros_host(0, DType::F32, &[6]);
        let err = comm
            .batch_all_to_all_variable(&[a.clone(), b], &[out.clone(), out.clone()], &[4], &[4])
            .unwrap_err();
        assert!(matches!(err, DistributedError::ShapeMismatch { .. }));

        let c = DeviceBuffer::zeros_host(0, DType::F64, &[4]);
        let err = comm
            .batch_all_to_all_variable(&[a, c], &[out.clone(), out], &[4], &[4])
            .unwrap_err();
        assert!(matches!(err, DistributedError::DtypeMismatch { .. }));
        assert!(trace.events().is_empty());
    }

    #[test]
    fn oversized_counts_fail_before_any_transfer() {
        let (comm, trace) = single();
        let a = DeviceBuffer::zeros_host(0, DType::F32, &[4]);
        let out = DeviceBuffer::zeros_host(0, DType::F32, &[4]);
        // usize::MAX elements of 4 bytes cannot be addressed.
        let err = comm
            .batch_all_to_all_variable(&[a.clone()], &[out.clone()], &[usize::MAX], &[4])
            .unwrap_err();
        assert!(matches!(err, DistributedError::ShapeMismatch { .. }));
        let err = comm
            .batch_all_gather_variable(&[a], &[out], &[usize::MAX / 2])
            .unwrap_err();
        assert!(matches!(err, DistributedError::ShapeMismatch { .. }));
        assert!(trace.events().is_empty());

        type Comm = Communicator<HostRuntime, crate::distributed::sim::SimTransport>;
        assert!(matches!(
            Comm::checked_total("test", &[usize::MAX, 1], 1),
            Err(DistributedError::ShapeMismatch { .. })
        ));
        assert_eq!(Comm::checked_total("test", &[3, 0, 5], 8).unwrap(), 8);
    }

    #[test]
    fn size_list_must_cover_every_rank() {
        let (comm, _) = single();
        let a = DeviceBuffer::zeros_host(0, DType::U8, &[4]);
        let err = comm
            .batch_all_gather_variable(&[a.clone()], &[a], &[1, 2])
            .unwrap_err();
        assert!(matches!(err, DistributedError::InvalidSplit(_)));
    }

    #[test]
    fn single_rank_all_to_all_copies() {
        let (comm, _) = single();
        let input = DeviceBuffer::from_slice(0, &[1u32, 2, 3, 4], &[4]).unwrap();
        let output = DeviceBuffer::zeros_host(0, DType::U32, &[4]);
        comm.batch_all_to_all_variable(&[input], &[output.clone()], &[3], &[3])
            .unwrap();
        assert_eq!(output.to_vec::<u32>().unwrap(), vec![1, 2, 3, 0]);
    }

    #[test]
    fn broadcast_root_out_of_range() {
        let (comm, _) = single();
        let buf = DeviceBuffer::zeros_host(0, DType::I64, &[2]);
        assert!(matches!(
            comm.broadcast(&buf, 1),
            Err(DistributedError::InvalidRank { rank: 1, .. })
        ));
    }

    #[test]
    fn buffers_on_other_devices_are_rejected() {
        let (comm, _) = single();
        let buf = DeviceBuffer::zeros_host(3, DType::F32, &[2]);
        assert!(matches!(
            comm.allreduce(&buf),
            Err(DistributedError::DeviceMismatch {
                expected: 0,
                actual: 3
            })
        ));
    }
}
