//! Process-scoped runtime context.
//!
//! Owns the kernel invoker and the two communication groups of a process:
//!
//! - the *global* group drives the exchange scheduler
//! - the *shared* group carries the batched variable collectives and the
//!   auxiliary broadcast and allreduce traffic
//!
//! Groups are created by explicit `init_*` calls and torn down by
//! [`ExchangeContext::shutdown`] (or on drop).

use std::sync::Arc;

use crate::buffer::DeviceBuffer;
use crate::config::RuntimeConfig;
use crate::distributed::{
    exchange_id, CollectiveBackend, Communicator, DistributedConfig, DistributedError, EventPool,
    RendezvousId, Result,
};
use crate::exchange::{Direction, ExchangeScheduler};
use crate::jit::{KernelHandle, KernelInvoker, LaunchOverride};
use crate::ops::{AddKernels, CumsumKernel};
use crate::runtime::{DeviceRuntime, ScalarArg};

const GLOBAL: &str = "global";
const SHARED: &str = "shared";

type GroupTransport<B> = <B as CollectiveBackend>::Transport;

/// Kernel cache plus the communicators of one process.
pub struct ExchangeContext<R: DeviceRuntime, B: CollectiveBackend> {
    runtime: Arc<R>,
    backend: B,
    config: RuntimeConfig,
    invoker: Arc<KernelInvoker<R>>,
    add: AddKernels,
    cumsum: CumsumKernel,
    global: Option<ExchangeScheduler<R, GroupTransport<B>>>,
    shared: Option<Communicator<R, GroupTransport<B>>>,
}

impl<R: DeviceRuntime, B: CollectiveBackend> ExchangeContext<R, B> {
    pub fn new(runtime: Arc<R>, backend: B, config: RuntimeConfig) -> Result<Self> {
        let invoker = Arc::new(KernelInvoker::new(Arc::clone(&runtime), &config));
        let add = AddKernels::install(&invoker)?;
        let cumsum = CumsumKernel::install(&invoker)?;
        tracing::debug!(
            platform = runtime.name(),
            backend = backend.name(),
            devices = runtime.device_count(),
            "exchange context created"
        );
        Ok(Self {
            runtime,
            backend,
            config,
            invoker,
            add,
            cumsum,
            global: None,
            shared: None,
        })
    }

    pub fn runtime(&self) -> &Arc<R> {
        &self.runtime
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn invoker(&self) -> &Arc<KernelInvoker<R>> {
        &self.invoker
    }

    /// Fresh rendezvous id to distribute to every participant out of band.
    pub fn rendezvous_id(&self) -> Result<RendezvousId> {
        self.backend.unique_id()
    }

    /// Devices per node: configured value, else the platform's device count,
    /// capped at the group size.
    fn local_size(&self, world_size: usize) -> usize {
        self.config
            .local_size
            .unwrap_or_else(|| self.runtime.device_count())
            .clamp(1, world_size.max(1))
    }

    fn connect(
        &self,
        id: &RendezvousId,
        world_size: usize,
        world_rank: usize,
        device: usize,
    ) -> Result<Communicator<R, GroupTransport<B>>> {
        let transport = self.backend.connect(
            id,
            world_size,
            world_rank,
            device,
            self.config.rendezvous_timeout(),
        )?;
        Ok(Communicator::new(
            Arc::clone(&self.runtime),
            transport,
            self.local_size(world_size),
        ))
    }

    /// Join the global group and prepare the exchange scheduler: event pool
    /// and stride kernels on `device`.
    pub fn init_global(
        &mut self,
        id: &RendezvousId,
        world_size: usize,
        world_rank: usize,
        device: usize,
    ) -> Result<()> {
        if self.global.is_some() {
            return Err(DistributedError::AlreadyInitialized(GLOBAL));
        }
        let comm = self.connect(id, world_size, world_rank, device)?;
        let state = *comm.state();
        let scheduler = ExchangeScheduler::new(comm, Arc::clone(&self.invoker), &self.config)?;
        tracing::info!(
            backend = self.backend.name(),
            world_size = state.world_size,
            world_rank = state.world_rank,
            local_size = state.local_size,
            local_rank = state.local_rank,
            device,
            "global communicator initialized"
        );
        self.global = Some(scheduler);
        Ok(())
    }

    /// Join the shared group used by the batched variable collectives,
    /// [`broadcast`](Self::broadcast), [`allreduce`](Self::allreduce) and
    /// [`allreduce_add`](Self::allreduce_add).
    pub fn init_shared(
        &mut self,
        id: &RendezvousId,
        world_size: usize,
        world_rank: usize,
        device: usize,
    ) -> Result<()> {
        if self.shared.is_some() {
            return Err(DistributedError::AlreadyInitialized(SHARED));
        }
        let comm = self.connect(id, world_size, world_rank, device)?;
        tracing::info!(
            backend = self.backend.name(),
            world_size,
            world_rank,
            device,
            "shared communicator initialized"
        );
        self.shared = Some(comm);
        Ok(())
    }

    /// Form the global group from launcher settings, exchanging the id over
    /// TCP with rank 0.
    pub fn init_global_from(&mut self, dist: &DistributedConfig) -> Result<()> {
        if self.global.is_some() {
            return Err(DistributedError::AlreadyInitialized(GLOBAL));
        }
        let id = exchange_id(&self.backend, dist)?;
        self.init_global(&id, dist.world_size, dist.rank, dist.cuda_device())
    }

    /// Form the shared group from launcher settings. Each group needs its
    /// own id, so global and shared must be served on different ports.
    pub fn init_shared_from(&mut self, dist: &DistributedConfig) -> Result<()> {
        if self.shared.is_some() {
            return Err(DistributedError::AlreadyInitialized(SHARED));
        }
        let id = exchange_id(&self.backend, dist)?;
        self.init_shared(&id, dist.world_size, dist.rank, dist.cuda_device())
    }

    pub fn is_initialized(&self) -> bool {
        self.global.is_some()
    }

    /// Tear down both groups. Calling it again is a no-op.
    pub fn shutdown(&mut self) {
        if let Some(global) = self.global.take() {
            tracing::info!(rank = global.communicator().rank(), "global communicator shut down");
        }
        if let Some(shared) = self.shared.take() {
            tracing::info!(rank = shared.rank(), "shared communicator shut down");
        }
    }

    pub fn global(&self) -> Result<&ExchangeScheduler<R, GroupTransport<B>>> {
        self.global
            .as_ref()
            .ok_or(DistributedError::NotInitialized(GLOBAL))
    }

    pub fn shared(&self) -> Result<&Communicator<R, GroupTransport<B>>> {
        self.shared
            .as_ref()
            .ok_or(DistributedError::NotInitialized(SHARED))
    }

    /// Event slots of the global group.
    pub fn events(&self) -> Result<&EventPool<R>> {
        Ok(self.global()?.events())
    }

    pub fn inject_source(&self, text: &str) -> Result<KernelHandle> {
        Ok(self.invoker.inject_source(text)?)
    }

    pub fn invoke(
        &self,
        handle: KernelHandle,
        device: usize,
        buffers: &[&DeviceBuffer],
        scalars: &[ScalarArg],
        launch: Option<LaunchOverride>,
    ) -> Result<()> {
        Ok(self
            .invoker
            .invoke(handle, device, buffers, scalars, launch)?)
    }

    pub fn scatter_async(
        &self,
        input: &DeviceBuffer,
        output_shape: &[usize],
        num_split: usize,
        num_slices_per_split: usize,
        direction: Direction,
    ) -> Result<Vec<DeviceBuffer>> {
        self.global()?.scatter_async(
            input,
            output_shape,
            num_split,
            num_slices_per_split,
            direction,
        )
    }

    pub fn gather_async(
        &self,
        inputs: &[DeviceBuffer],
        output_shape: &[usize],
        num_split: usize,
        num_slices_per_split: usize,
        direction: Direction,
    ) -> Result<DeviceBuffer> {
        self.global()?.gather_async(
            inputs,
            output_shape,
            num_split,
            num_slices_per_split,
            direction,
        )
    }

    pub fn hierarchical_exchange(&self, input: &DeviceBuffer) -> Result<DeviceBuffer> {
        self.global()?.hierarchical_exchange(input)
    }

    pub fn batch_all_to_all_variable(
        &self,
        inputs: &[DeviceBuffer],
        outputs: &[DeviceBuffer],
        in_sizes: &[usize],
        out_sizes: &[usize],
    ) -> Result<()> {
        self.shared()?
            .batch_all_to_all_variable(inputs, outputs, in_sizes, out_sizes)
    }

    pub fn batch_all_gather_variable(
        &self,
        inputs: &[DeviceBuffer],
        outputs: &[DeviceBuffer],
        out_sizes: &[usize],
    ) -> Result<()> {
        self.shared()?
            .batch_all_gather_variable(inputs, outputs, out_sizes)
    }

    pub fn broadcast(&self, buffer: &DeviceBuffer, root: usize) -> Result<()> {
        self.shared()?.broadcast(buffer, root)
    }

    pub fn allreduce(&self, buffer: &DeviceBuffer) -> Result<()> {
        self.shared()?.allreduce(buffer)
    }

    /// Sum `t` over the shared group in place, then return `x + t`.
    pub fn allreduce_add(&self, x: &DeviceBuffer, t: &DeviceBuffer) -> Result<DeviceBuffer> {
        self.allreduce(t)?;
        Ok(self.add.add(&self.invoker, x, t)?)
    }

    /// Zero-based running location per column of a `[samples, batch]` mask.
    pub fn cumsum(&self, input: &DeviceBuffer) -> Result<DeviceBuffer> {
        Ok(self.cumsum.run(&self.invoker, input)?)
    }
}

impl<R: DeviceRuntime, B: CollectiveBackend> Drop for ExchangeContext<R, B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
