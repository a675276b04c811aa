//! Split-pipelined and hierarchical all-to-all.
//!
//! A split exchange moves one fused buffer through `num_split` grouped
//! rounds on the comm stream, one per stage buffer, so compute on the
//! stages already delivered can overlap the remaining rounds. Stage
//! hand-off between the streams goes through the [`EventPool`] slot of the
//! same index:
//!
//! - scatter: comm waits on slot 0 (the fused input is ready), then
//!   releases slot `stage` after stage `stage` has been received
//! - gather: comm waits on slot `stage` before sending stage `stage`, then
//!   releases slot 0 once the fused output is complete
//!
//! The caller mirrors this on the compute stream.

use std::sync::Arc;

use candle_core::DType;

use super::plan::{Direction, HierarchyPlan, SplitPlan};
use super::stride_copy::StrideCopyKernels;
use crate::buffer::DeviceBuffer;
use crate::config::RuntimeConfig;
use crate::distributed::{span, Communicator, DistributedError, EventPool, Result, Transport};
use crate::jit::KernelInvoker;
use crate::logging::FallbackNotice;
use crate::runtime::{DeviceRuntime, Stream, StreamKind};

/// Pipelined exchange engine of one process.
pub struct ExchangeScheduler<R: DeviceRuntime, T: Transport> {
    comm: Communicator<R, T>,
    invoker: Arc<KernelInvoker<R>>,
    events: EventPool<R>,
    stride: StrideCopyKernels,
    flat_notice: FallbackNotice,
}

impl<R: DeviceRuntime, T: Transport> ExchangeScheduler<R, T> {
    /// Create the event pool (`max_num_split` slots) and compile the stride
    /// kernels for the communicator's device.
    pub fn new(
        comm: Communicator<R, T>,
        invoker: Arc<KernelInvoker<R>>,
        config: &RuntimeConfig,
    ) -> Result<Self> {
        let device = comm.device();
        let events = EventPool::new(Arc::clone(comm.runtime()), device, config.max_num_split())?;
        let stride = StrideCopyKernels::install(&invoker, device)?;
        tracing::info!(
            rank = comm.rank(),
            world_size = comm.world_size(),
            local_size = comm.state().local_size,
            device,
            max_num_split = events.capacity(),
            "exchange scheduler ready"
        );
        Ok(Self {
            comm,
            invoker,
            events,
            stride,
            flat_notice: FallbackNotice::new(config.fallback_log()),
        })
    }

    pub fn communicator(&self) -> &Communicator<R, T> {
        &self.comm
    }

    pub fn events(&self) -> &EventPool<R> {
        &self.events
    }

    pub fn invoker(&self) -> &Arc<KernelInvoker<R>> {
        &self.invoker
    }

    pub fn max_num_split(&self) -> usize {
        self.events.capacity()
    }

    fn plan(
        &self,
        total_bytes: usize,
        num_split: usize,
        num_slices_per_split: usize,
        direction: Direction,
    ) -> Result<SplitPlan> {
        SplitPlan::new(
            total_bytes,
            num_split,
            num_slices_per_split,
            self.comm.world_size(),
            self.max_num_split(),
            direction,
        )
    }

    fn register(&self, buffer: &DeviceBuffer, stream: Stream) -> Result<()> {
        Ok(self.comm.runtime().record_stream(buffer, stream)?)
    }

    /// Split the fused `input` into `num_split` stage buffers of
    /// `output_shape`, exchanging slice `j` of every stage with rank
    /// `world_size * j / num_slices_per_split`.
    ///
    /// Returns immediately after the rounds are enqueued; stage `s` is
    /// readable on the compute stream after acquiring slot `s`.
    pub fn scatter_async(
        &self,
        input: &DeviceBuffer,
        output_shape: &[usize],
        num_split: usize,
        num_slices_per_split: usize,
        direction: Direction,
    ) -> Result<Vec<DeviceBuffer>> {
        const OP: &str = "scatter_async";
        self.comm.check_device(input)?;
        let plan = self.plan(input.nbytes(), num_split, num_slices_per_split, direction)?;
        check_stage_shape(OP, &plan, input.dtype(), output_shape)?;

        let comm = self.comm.stream(StreamKind::Comm)?;
        let compute = self.comm.stream(StreamKind::Compute)?;
        self.register(input, comm)?;
        let outputs = (0..num_split)
            .map(|_| {
                let output = self.comm.runtime().alloc(input.dtype(), output_shape, comm)?;
                self.comm.runtime().record_stream(&output, compute)?;
                Ok(output)
            })
            .collect::<Result<Vec<_>>>()?;

        let transport = self.comm.transport();
        self.events.acquire(0, comm)?;
        for stage in plan.stage_order() {
            tracing::trace!(stage, %direction, slice = plan.slice_size, "scatter stage");
            transport.group_start()?;
            for j in 0..plan.num_slices_per_split {
                let peer = plan.peer(j);
                transport.send(input, plan.fused_range(j, stage), peer, comm)?;
                transport.recv(&outputs[stage], plan.stage_range(j), peer, comm)?;
            }
            transport.group_end()?;
            self.events.release(stage, comm)?;
        }
        Ok(outputs)
    }

    /// Inverse of [`scatter_async`](Self::scatter_async): exchange the stage
    /// buffers back into one fused buffer of `output_shape`.
    ///
    /// Stage `s` is read only after the comm stream acquires slot `s`; the
    /// fused output is readable on the compute stream after acquiring slot 0.
    pub fn gather_async(
        &self,
        inputs: &[DeviceBuffer],
        output_shape: &[usize],
        num_split: usize,
        num_slices_per_split: usize,
        direction: Direction,
    ) -> Result<DeviceBuffer> {
        const OP: &str = "gather_async";
        if inputs.len() != num_split {
            return Err(DistributedError::InvalidSplit(format!(
                "{OP}: {} stage buffers for num_split {num_split}",
                inputs.len()
            )));
        }
        let Some(first) = inputs.first() else {
            return Err(DistributedError::InvalidSplit(format!(
                "{OP}: num_split must be positive"
            )));
        };
        let dtype = first.dtype();
        for input in inputs {
            self.comm.check_device(input)?;
            if input.dtype() != dtype {
                return Err(DistributedError::DtypeMismatch {
                    op: OP,
                    expected: format!("{dtype:?}"),
                    actual: format!("{:?}", input.dtype()),
                });
            }
        }
        let total_bytes = output_shape.iter().product::<usize>() * dtype.size_in_bytes();
        let plan = self.plan(total_bytes, num_split, num_slices_per_split, direction)?;
        for input in inputs {
            if input.nbytes() != plan.stage_bytes() {
                return Err(DistributedError::ShapeMismatch {
                    op: OP,
                    expected: vec![plan.stage_bytes() / dtype.size_in_bytes()],
                    actual: input.shape().to_vec(),
                });
            }
        }

        let comm = self.comm.stream(StreamKind::Comm)?;
        let compute = self.comm.stream(StreamKind::Compute)?;
        for input in inputs {
            self.register(input, comm)?;
        }
        let output = self.comm.runtime().alloc(dtype, output_shape, comm)?;
        self.register(&output, compute)?;

        let transport = self.comm.transport();
        for stage in plan.stage_order() {
            tracing::trace!(stage, %direction, slice = plan.slice_size, "gather stage");
            self.events.acquire(stage, comm)?;
            transport.group_start()?;
            for j in 0..plan.num_slices_per_split {
                let peer = plan.peer(j);
                transport.send(&inputs[stage], plan.stage_range(j), peer, comm)?;
                transport.recv(&output, plan.fused_range(j, stage), peer, comm)?;
            }
            transport.group_end()?;
        }
        self.events.release(0, comm)?;
        Ok(output)
    }

    /// Two-level all-to-all of `input`, one equal chunk per destination rank
    /// in rank order.
    ///
    /// With more than one node and more than one device per node, the
    /// exchange runs as an intra-node round followed by an inter-node round
    /// and the result is written back into `input`, which is returned.
    /// Otherwise a single flat round writes a fresh buffer.
    pub fn hierarchical_exchange(&self, input: &DeviceBuffer) -> Result<DeviceBuffer> {
        self.comm.check_device(input)?;
        let plan = HierarchyPlan::new(input.nbytes(), self.comm.state())?;

        let comm = self.comm.stream(StreamKind::Comm)?;
        let compute = self.comm.stream(StreamKind::Compute)?;
        self.register(input, comm)?;
        let tmp = self.comm.runtime().alloc(input.dtype(), input.shape(), comm)?;
        let transport = self.comm.transport();

        if plan.is_flat() {
            if self.flat_notice.should_log() {
                tracing::info!(
                    nodes = plan.nodes,
                    local_size = plan.local_size,
                    "single-level topology, hierarchical exchange runs flat"
                );
            }
            transport.group_start()?;
            for peer in 0..plan.world_size() {
                let range = span(peer * plan.slice_size, plan.slice_size);
                transport.send(input, range.clone(), peer, comm)?;
                transport.recv(&tmp, range, peer, comm)?;
            }
            transport.group_end()?;
            self.register(&tmp, compute)?;
            return Ok(tmp);
        }

        tracing::trace!(
            nodes = plan.nodes,
            local_size = plan.local_size,
            slice = plan.slice_size,
            "hierarchical exchange"
        );
        self.stride.launch(
            &self.invoker,
            comm,
            &tmp,
            input,
            plan.slice_size,
            plan.local_size,
            plan.nodes,
        )?;
        transport.group_start()?;
        for g in 0..plan.local_size {
            let peer = plan.intra_peer(g);
            transport.send(&tmp, plan.intra_block(g), peer, comm)?;
            transport.recv(input, plan.intra_block(g), peer, comm)?;
        }
        transport.group_end()?;

        self.stride.launch(
            &self.invoker,
            comm,
            &tmp,
            input,
            plan.slice_size,
            plan.nodes,
            plan.local_size,
        )?;
        transport.group_start()?;
        for n in 0..plan.nodes {
            let peer = plan.inter_peer(n);
            transport.send(&tmp, plan.inter_block(n), peer, comm)?;
            transport.recv(input, plan.inter_block(n), peer, comm)?;
        }
        transport.group_end()?;
        self.register(input, compute)?;
        Ok(input.clone())
    }
}

fn check_stage_shape(
    op: &'static str,
    plan: &SplitPlan,
    dtype: DType,
    output_shape: &[usize],
) -> Result<()> {
    let bytes = output_shape.iter().product::<usize>() * dtype.size_in_bytes();
    if bytes != plan.stage_bytes() {
        return Err(DistributedError::ShapeMismatch {
            op,
            expected: vec![plan.stage_bytes() / dtype.size_in_bytes()],
            actual: output_shape.to_vec(),
        });
    }
    Ok(())
}
