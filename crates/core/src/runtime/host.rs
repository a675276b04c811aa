//! Host-memory platform simulating one or more devices in-process.
//!
//! Kernels are Rust closures registered by entry name; "compiling" a source
//! for this platform resolves the entry against the registry. Every launch
//! runs synchronously on the calling thread, so stream and event operations
//! only need to be recorded in the [`CallTrace`], not enforced.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use candle_core::DType;

use super::{
    CallTrace, DeviceError, DeviceRuntime, KernelArg, KernelImage, LaunchGeometry, Result,
    Stream, StreamKind, TraceEvent,
};
use crate::buffer::{DeviceBuffer, Memory};

/// Host implementation of a kernel entry point.
pub type HostKernelFn = dyn Fn(&LaunchGeometry, &[KernelArg<'_>]) -> Result<()> + Send + Sync;

/// Architecture string reported for every simulated device.
pub const HOST_ARCH: &str = "host-sim";

/// Kernel resolved from the host registry.
pub struct HostFunction {
    entry: String,
    device: usize,
    kernel: Arc<HostKernelFn>,
}

impl HostFunction {
    pub fn entry(&self) -> &str {
        &self.entry
    }
}

/// Event slot on the host platform; only its identity is traced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostEvent {
    pub device: usize,
    pub slot: usize,
}

/// Simulated platform backed by host memory.
pub struct HostRuntime {
    num_devices: usize,
    kernels: RwLock<HashMap<String, Arc<HostKernelFn>>>,
    trace: CallTrace,
}

impl HostRuntime {
    /// Platform with `num_devices` simulated devices and the built-in kernels
    /// (stride permutation, cumsum, elementwise add) registered.
    pub fn new(num_devices: usize) -> Self {
        Self::with_trace(num_devices, CallTrace::new())
    }

    /// Same as [`HostRuntime::new`], appending to an existing trace.
    pub fn with_trace(num_devices: usize, trace: CallTrace) -> Self {
        assert!(num_devices > 0, "host runtime needs at least one device");
        let runtime = Self {
            num_devices,
            kernels: RwLock::new(HashMap::new()),
            trace,
        };
        crate::exchange::stride_copy::register_host_kernels(&runtime);
        crate::ops::register_host_kernels(&runtime);
        runtime
    }

    /// Register (or replace) the host implementation of `entry`.
    pub fn register_kernel<F>(&self, entry: impl Into<String>, kernel: F)
    where
        F: Fn(&LaunchGeometry, &[KernelArg<'_>]) -> Result<()> + Send + Sync + 'static,
    {
        let mut kernels = self.kernels.write().unwrap_or_else(|e| e.into_inner());
        kernels.insert(entry.into(), Arc::new(kernel));
    }

    pub fn has_kernel(&self, entry: &str) -> bool {
        self.kernels
            .read()
            .map(|k| k.contains_key(entry))
            .unwrap_or(false)
    }

    /// Call trace shared with the simulated transport.
    pub fn trace(&self) -> &CallTrace {
        &self.trace
    }

    fn check_device(&self, device: usize) -> Result<()> {
        if device >= self.num_devices {
            return Err(DeviceError::InvalidDevice {
                device,
                device_count: self.num_devices,
            });
        }
        Ok(())
    }
}

impl DeviceRuntime for HostRuntime {
    type Function = HostFunction;
    type Event = HostEvent;

    fn name(&self) -> &'static str {
        "host"
    }

    fn device_count(&self) -> usize {
        self.num_devices
    }

    fn arch(&self, device: usize) -> Result<String> {
        self.check_device(device)?;
        Ok(HOST_ARCH.to_string())
    }

    fn is_host(&self) -> bool {
        true
    }

    fn stream(&self, device: usize, kind: StreamKind) -> Result<Stream> {
        self.check_device(device)?;
        Ok(Stream::new(device, kind, 0))
    }

    fn alloc(&self, dtype: DType, shape: &[usize], stream: Stream) -> Result<DeviceBuffer> {
        self.check_device(stream.device)?;
        let bytes = shape.iter().product::<usize>() * dtype.size_in_bytes();
        let memory = Memory::Host(RwLock::new(vec![0; bytes]));
        Ok(DeviceBuffer::from_memory(
            memory,
            dtype,
            shape,
            stream.device,
            stream,
        ))
    }

    fn record_stream(&self, buffer: &DeviceBuffer, stream: Stream) -> Result<()> {
        buffer.mark_used_by(stream);
        self.trace.push(TraceEvent::RecordStream {
            stream: stream.kind,
        });
        Ok(())
    }

    fn write_buffer(&self, buffer: &DeviceBuffer, bytes: &[u8]) -> Result<()> {
        if bytes.len() != buffer.nbytes() {
            return Err(DeviceError::SizeMismatch {
                expected: buffer.nbytes(),
                actual: bytes.len(),
            });
        }
        buffer.with_host_bytes_mut(|dst| dst.copy_from_slice(bytes))
    }

    fn read_buffer(&self, buffer: &DeviceBuffer) -> Result<Vec<u8>> {
        buffer.host_bytes()
    }

    fn load_function(
        &self,
        device: usize,
        image: &KernelImage,
        entry: &str,
        _launch_bound: u32,
    ) -> Result<HostFunction> {
        self.check_device(device)?;
        let KernelImage::Host { entry: image_entry } = image else {
            return Err(DeviceError::UnsupportedImage {
                runtime: "host",
                reason: format!("cannot load a {} image", image.kind()),
            });
        };
        if image_entry != entry {
            return Err(DeviceError::UnsupportedImage {
                runtime: "host",
                reason: format!("image exports `{image_entry}`, requested `{entry}`"),
            });
        }
        let kernel = self
            .kernels
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(entry)
            .cloned()
            .ok_or_else(|| DeviceError::MissingHostKernel(entry.to_string()))?;
        self.trace.push(TraceEvent::Compile {
            entry: entry.to_string(),
            device,
        });
        Ok(HostFunction {
            entry: entry.to_string(),
            device,
            kernel,
        })
    }

    fn launch(
        &self,
        function: &HostFunction,
        geometry: &LaunchGeometry,
        args: &[KernelArg<'_>],
        stream: Stream,
    ) -> Result<()> {
        for arg in args {
            if let KernelArg::Buffer(buf) = arg {
                if !buf.is_host() {
                    return Err(DeviceError::MemoryKind {
                        expected: "host",
                        actual: "cuda",
                    });
                }
            }
        }
        self.trace.push(TraceEvent::Launch {
            entry: function.entry.clone(),
            device: function.device,
            stream: stream.kind,
        });
        (function.kernel)(geometry, args)
    }

    fn max_potential_geometry(&self, _function: &HostFunction) -> Result<(u32, u32)> {
        Ok((1, 1024))
    }

    fn create_event(&self, device: usize, slot: usize) -> Result<HostEvent> {
        self.check_device(device)?;
        Ok(HostEvent { device, slot })
    }

    fn record_event(&self, event: &HostEvent, stream: Stream) -> Result<()> {
        self.trace.push(TraceEvent::EventRecord {
            slot: event.slot,
            stream: stream.kind,
        });
        Ok(())
    }

    fn wait_event(&self, event: &HostEvent, stream: Stream) -> Result<()> {
        self.trace.push(TraceEvent::EventWait {
            slot: event.slot,
            stream: stream.kind,
        });
        Ok(())
    }

    fn synchronize(&self, _stream: Stream) -> Result<()> {
        Ok(())
    }
}

/// Split kernel arguments into leading buffers and trailing scalars, checking
/// the expected counts.
pub fn split_args<'a>(
    entry: &str,
    args: &'a [KernelArg<'a>],
    buffers: usize,
    scalars: usize,
) -> Result<(Vec<&'a DeviceBuffer>, Vec<super::ScalarArg>)> {
    let mut bufs = Vec::with_capacity(buffers);
    let mut vals = Vec::with_capacity(scalars);
    for arg in args {
        match arg {
            KernelArg::Buffer(b) if vals.is_empty() => bufs.push(*b),
            KernelArg::Buffer(_) => {
                return Err(DeviceError::InvalidArguments {
                    entry: entry.to_string(),
                    reason: "buffer argument after a scalar".to_string(),
                })
            }
            KernelArg::Scalar(s) => vals.push(*s),
        }
    }
    if bufs.len() != buffers || vals.len() != scalars {
        return Err(DeviceError::InvalidArguments {
            entry: entry.to_string(),
            reason: format!(
                "expected {buffers} buffers and {scalars} scalars, got {} and {}",
                bufs.len(),
                vals.len()
            ),
        });
    }
    Ok((bufs, vals))
}

/// Integer scalar argument `index` as a `usize`.
pub fn scalar_usize(entry: &str, scalars: &[super::ScalarArg], index: usize) -> Result<usize> {
    scalars
        .get(index)
        .and_then(|s| s.as_usize())
        .ok_or_else(|| DeviceError::InvalidArguments {
            entry: entry.to_string(),
            reason: format!("scalar {index} must be a non-negative integer"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ScalarArg;

    fn runtime() -> HostRuntime {
        HostRuntime::new(2)
    }

    #[test]
    fn reports_devices_and_arch() {
        let rt = runtime();
        assert_eq!(rt.device_count(), 2);
        assert_eq!(rt.arch(1).unwrap(), HOST_ARCH);
        assert!(matches!(
            rt.arch(2),
            Err(DeviceError::InvalidDevice {
                device: 2,
                device_count: 2
            })
        ));
    }

    #[test]
    fn alloc_attributes_owner_stream() {
        let rt = runtime();
        let comm = rt.stream(1, StreamKind::Comm).unwrap();
        let buf = rt.alloc(DType::F32, &[3, 2], comm).unwrap();
        assert_eq!(buf.device(), 1);
        assert_eq!(buf.nbytes(), 24);
        assert_eq!(buf.used_by(), vec![comm]);
    }

    #[test]
    fn registered_kernel_runs_and_is_traced() {
        let rt = runtime();
        rt.register_kernel("fill_seven", |_geom, args| {
            let (bufs, scalars) = split_args("fill_seven", args, 1, 1)?;
            let n = scalar_usize("fill_seven", &scalars, 0)?;
            bufs[0].with_host_bytes_mut(|b| b[..n].fill(7))
        });
        let image = KernelImage::Host {
            entry: "fill_seven".to_string(),
        };
        let f = rt.load_function(0, &image, "fill_seven", 1024).unwrap();
        let stream = rt.stream(0, StreamKind::Compute).unwrap();
        let buf = rt.alloc(DType::U8, &[4], stream).unwrap();
        rt.launch(
            &f,
            &LaunchGeometry::default(),
            &[KernelArg::Buffer(&buf), KernelArg::Scalar(ScalarArg::I32(3))],
            stream,
        )
        .unwrap();
        assert_eq!(buf.host_bytes().unwrap(), vec![7, 7, 7, 0]);
        assert_eq!(rt.trace().compile_count("fill_seven"), 1);
        assert!(rt.trace().events().contains(&TraceEvent::Launch {
            entry: "fill_seven".to_string(),
            device: 0,
            stream: StreamKind::Compute,
        }));
    }

    #[test]
    fn unknown_entry_is_rejected() {
        let rt = runtime();
        let image = KernelImage::Host {
            entry: "nope".to_string(),
        };
        assert!(matches!(
            rt.load_function(0, &image, "nope", 1024),
            Err(DeviceError::MissingHostKernel(_))
        ));
        assert!(matches!(
            rt.load_function(0, &KernelImage::Ptx(String::new()), "nope", 1024),
            Err(DeviceError::UnsupportedImage { .. })
        ));
    }

    #[test]
    fn split_args_enforces_order_and_counts() {
        let buf = DeviceBuffer::zeros_host(0, DType::U8, &[1]);
        let ok = [KernelArg::Buffer(&buf), KernelArg::Scalar(ScalarArg::I64(1))];
        assert!(split_args("k", &ok, 1, 1).is_ok());
        let misordered = [KernelArg::Scalar(ScalarArg::I64(1)), KernelArg::Buffer(&buf)];
        assert!(split_args("k", &misordered, 1, 1).is_err());
        assert!(split_args("k", &ok, 2, 0).is_err());
    }

    #[test]
    fn events_are_traced_per_stream() {
        let rt = runtime();
        let event = rt.create_event(0, 3).unwrap();
        let comm = rt.stream(0, StreamKind::Comm).unwrap();
        let compute = rt.stream(0, StreamKind::Compute).unwrap();
        rt.record_event(&event, comm).unwrap();
        rt.wait_event(&event, compute).unwrap();
        assert_eq!(rt.trace().released_slots(StreamKind::Comm), vec![3]);
        assert_eq!(rt.trace().acquired_slots(StreamKind::Compute), vec![3]);
    }
}
