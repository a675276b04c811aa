//! Kernel invoker: compile on first use, then launch.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

use super::compiler::{CompileTarget, CompilerChain};
use super::error::{JitError, Result};
use super::source::KernelSource;
use super::table::{KernelHandle, KernelTable};
use crate::buffer::DeviceBuffer;
use crate::config::RuntimeConfig;
use crate::runtime::{
    DeviceRuntime, Dim3, KernelArg, LaunchGeometry, ScalarArg, Stream, StreamKind,
};

/// Explicit launch geometry, taking precedence over source annotations per
/// component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LaunchOverride {
    pub blocks: Option<Dim3>,
    pub threads: Option<Dim3>,
}

impl LaunchOverride {
    /// Override the block extents only (1 to 3 axes).
    pub fn blocks(extents: &[u32]) -> Self {
        Self {
            blocks: Some(Dim3::from_slice(extents)),
            threads: None,
        }
    }

    pub fn with_threads(mut self, extents: &[u32]) -> Self {
        self.threads = Some(Dim3::from_slice(extents));
        self
    }

    /// Effective geometry given the annotated one.
    pub fn resolve(&self, annotated: LaunchGeometry) -> LaunchGeometry {
        LaunchGeometry {
            blocks: self.blocks.unwrap_or(annotated.blocks),
            threads: self.threads.unwrap_or(annotated.threads),
        }
    }
}

/// Compilation and launch counters.
#[derive(Debug, Default)]
pub struct JitStats {
    compilations: AtomicUsize,
    launches: AtomicUsize,
}

impl JitStats {
    pub fn compilations(&self) -> usize {
        self.compilations.load(Ordering::Relaxed)
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::Relaxed)
    }
}

/// Registry of injected kernels with per-device compile cache.
pub struct KernelInvoker<R: DeviceRuntime> {
    runtime: Arc<R>,
    compilers: CompilerChain,
    table: KernelTable<R::Function>,
    arch: Vec<OnceLock<String>>,
    sdk_home: RwLock<PathBuf>,
    stats: JitStats,
}

impl<R: DeviceRuntime> KernelInvoker<R> {
    /// Invoker with the default compiler chain for `runtime`.
    pub fn new(runtime: Arc<R>, config: &RuntimeConfig) -> Self {
        let compilers = if runtime.is_host() {
            CompilerChain::host(config)
        } else {
            CompilerChain::for_cuda(config)
        };
        Self::with_compilers(runtime, compilers, config)
    }

    pub fn with_compilers(runtime: Arc<R>, compilers: CompilerChain, config: &RuntimeConfig) -> Self {
        let devices = runtime.device_count();
        Self {
            table: KernelTable::new(devices),
            arch: (0..devices).map(|_| OnceLock::new()).collect(),
            sdk_home: RwLock::new(config.sdk_home()),
            stats: JitStats::default(),
            compilers,
            runtime,
        }
    }

    pub fn runtime(&self) -> &Arc<R> {
        &self.runtime
    }

    pub fn stats(&self) -> &JitStats {
        &self.stats
    }

    /// Register a kernel source and return its handle.
    pub fn inject_source(&self, text: &str) -> Result<KernelHandle> {
        let source = KernelSource::parse(text)?;
        tracing::debug!(
            entry = source.entry(),
            blocks = ?source.geometry().blocks,
            threads = ?source.geometry().threads,
            "injected kernel source"
        );
        Ok(self.table.insert(source))
    }

    /// Toolkit location used by subsequent compilations.
    pub fn set_sdk_home(&self, path: impl AsRef<Path>) {
        let mut sdk_home = self.sdk_home.write().unwrap_or_else(|e| e.into_inner());
        *sdk_home = path.as_ref().to_path_buf();
        tracing::debug!(sdk_home = %sdk_home.display(), "updated SDK home");
    }

    pub fn sdk_home(&self) -> PathBuf {
        self.sdk_home
            .read()
            .map(|p| p.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    /// Entry point name of `handle`.
    pub fn entry(&self, handle: KernelHandle) -> Result<String> {
        Ok(self.table.get(handle)?.source().entry().to_string())
    }

    /// Geometry declared by the source of `handle`.
    pub fn geometry(&self, handle: KernelHandle) -> Result<LaunchGeometry> {
        Ok(self.table.get(handle)?.source().geometry())
    }

    fn check_device(&self, device: usize) -> Result<()> {
        if device >= self.arch.len() {
            return Err(JitError::InvalidDevice {
                device,
                device_count: self.arch.len(),
            });
        }
        Ok(())
    }

    fn arch(&self, device: usize) -> Result<String> {
        self.check_device(device)?;
        if let Some(arch) = self.arch[device].get() {
            return Ok(arch.clone());
        }
        let arch = self.runtime.arch(device)?;
        let _ = self.arch[device].set(arch.clone());
        Ok(arch)
    }

    /// Loaded function of `handle` on `device`, compiling it on first use.
    pub fn function(&self, handle: KernelHandle, device: usize) -> Result<Arc<R::Function>> {
        self.check_device(device)?;
        self.table.get_or_compile(handle, device, |source| {
            let arch = self.arch(device)?;
            let sdk_home = self.sdk_home();
            let target = CompileTarget {
                arch: &arch,
                sdk_home: &sdk_home,
            };
            let image = self.compilers.compile(source, &target, device)?;
            let function = self.runtime.load_function(
                device,
                &image,
                source.entry(),
                source.launch_bound(),
            )?;
            self.stats.compilations.fetch_add(1, Ordering::Relaxed);
            Ok(function)
        })
    }

    /// Launch `handle` on the compute stream of `device`.
    pub fn invoke(
        &self,
        handle: KernelHandle,
        device: usize,
        buffers: &[&DeviceBuffer],
        scalars: &[ScalarArg],
        launch: Option<LaunchOverride>,
    ) -> Result<()> {
        self.check_device(device)?;
        let stream = self.runtime.stream(device, StreamKind::Compute)?;
        self.invoke_on(stream, handle, buffers, scalars, launch)
    }

    /// Launch `handle` on an explicit stream.
    pub fn invoke_on(
        &self,
        stream: Stream,
        handle: KernelHandle,
        buffers: &[&DeviceBuffer],
        scalars: &[ScalarArg],
        launch: Option<LaunchOverride>,
    ) -> Result<()> {
        let device = stream.device;
        for (index, buffer) in buffers.iter().enumerate() {
            if buffer.device() != device {
                return Err(JitError::DeviceMismatch {
                    index,
                    expected: device,
                    actual: buffer.device(),
                });
            }
        }
        let function = self.function(handle, device)?;
        let geometry = launch.unwrap_or_default().resolve(self.geometry(handle)?);

        let args: Vec<KernelArg<'_>> = buffers
            .iter()
            .map(|b| KernelArg::Buffer(*b))
            .chain(scalars.iter().map(|s| KernelArg::Scalar(*s)))
            .collect();
        tracing::trace!(
            %handle,
            device,
            stream = %stream.kind,
            blocks = ?geometry.blocks,
            threads = ?geometry.threads,
            "launching kernel"
        );
        self.runtime.launch(&function, &geometry, &args, stream)?;
        self.stats.launches.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
