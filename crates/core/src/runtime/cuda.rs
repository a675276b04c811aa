//! CUDA platform, loaded at runtime.
//!
//! Two vendor libraries are opened with `libloading`:
//! - the CUDA runtime (`libcudart`) for devices, streams, events and
//!   stream-ordered memory
//! - the CUDA driver (`libcuda`) for module loading, kernel launch and
//!   occupancy queries
//!
//! Nothing links against CUDA at build time, so the crate builds and its
//! simulated tests run on machines without a GPU.
//!
//! # Loading order
//!
//! The runtime library is looked up as:
//! 1. `EXPERTLINK_CUDART_SO_PATH` environment variable (if set)
//! 2. `libcudart.so.12`
//! 3. `libcudart.so.11`
//! 4. `libcudart.so`

use std::collections::HashMap;
use std::ffi::{c_char, c_int, c_uint, c_void, CString};
use std::sync::{Arc, Mutex};

use candle_core::DType;
use libloading::Library;

use super::{
    DeviceError, DeviceRuntime, KernelArg, KernelImage, LaunchGeometry, Result, Stream,
    StreamKind,
};
use crate::buffer::{DeviceBuffer, Memory};

/// Environment variable for a custom CUDA runtime library path.
const CUDART_SO_PATH_ENV: &str = "EXPERTLINK_CUDART_SO_PATH";

/// cudaError_t / CUresult.
type CudaStatus = c_int;

const CUDA_SUCCESS: CudaStatus = 0;

const CUDA_DEV_ATTR_COMPUTE_CAPABILITY_MAJOR: c_int = 75;
const CUDA_DEV_ATTR_COMPUTE_CAPABILITY_MINOR: c_int = 76;
const CUDA_STREAM_NON_BLOCKING: c_uint = 1;
const CUDA_EVENT_DISABLE_TIMING: c_uint = 2;
const CUDA_MEMCPY_HOST_TO_DEVICE: c_int = 1;
const CUDA_MEMCPY_DEVICE_TO_HOST: c_int = 2;

const CU_JIT_THREADS_PER_BLOCK: c_int = 1;
const CU_JIT_OPTIMIZATION_LEVEL: c_int = 7;
const JIT_OPTIMIZATION_LEVEL: usize = 4;

type RawStream = *mut c_void;
type RawEvent = *mut c_void;
type CuModule = *mut c_void;
type CuFunction = *mut c_void;

type CudaSetDeviceFn = unsafe extern "C" fn(c_int) -> CudaStatus;
type CudaGetDeviceCountFn = unsafe extern "C" fn(*mut c_int) -> CudaStatus;
type CudaDeviceGetAttributeFn = unsafe extern "C" fn(*mut c_int, c_int, c_int) -> CudaStatus;
type CudaDeviceSynchronizeFn = unsafe extern "C" fn() -> CudaStatus;
type CudaStreamCreateWithFlagsFn = unsafe extern "C" fn(*mut RawStream, c_uint) -> CudaStatus;
type CudaStreamSynchronizeFn = unsafe extern "C" fn(RawStream) -> CudaStatus;
type CudaEventCreateWithFlagsFn = unsafe extern "C" fn(*mut RawEvent, c_uint) -> CudaStatus;
type CudaEventRecordFn = unsafe extern "C" fn(RawEvent, RawStream) -> CudaStatus;
type CudaStreamWaitEventFn = unsafe extern "C" fn(RawStream, RawEvent, c_uint) -> CudaStatus;
type CudaEventDestroyFn = unsafe extern "C" fn(RawEvent) -> CudaStatus;
type CudaMallocFn = unsafe extern "C" fn(*mut *mut c_void, usize) -> CudaStatus;
type CudaFreeFn = unsafe extern "C" fn(*mut c_void) -> CudaStatus;
type CudaMallocAsyncFn = unsafe extern "C" fn(*mut *mut c_void, usize, RawStream) -> CudaStatus;
type CudaFreeAsyncFn = unsafe extern "C" fn(*mut c_void, RawStream) -> CudaStatus;
type CudaMemcpyFn = unsafe extern "C" fn(*mut c_void, *const c_void, usize, c_int) -> CudaStatus;
type CudaGetErrorStringFn = unsafe extern "C" fn(CudaStatus) -> *const c_char;

type CuModuleLoadDataExFn = unsafe extern "C" fn(
    *mut CuModule,
    *const c_void,
    c_uint,
    *mut c_int,
    *mut *mut c_void,
) -> CudaStatus;
type CuModuleGetFunctionFn =
    unsafe extern "C" fn(*mut CuFunction, CuModule, *const c_char) -> CudaStatus;
type CuModuleUnloadFn = unsafe extern "C" fn(CuModule) -> CudaStatus;
#[allow(clippy::type_complexity)]
type CuLaunchKernelFn = unsafe extern "C" fn(
    CuFunction,
    c_uint,
    c_uint,
    c_uint,
    c_uint,
    c_uint,
    c_uint,
    c_uint,
    RawStream,
    *mut *mut c_void,
    *mut *mut c_void,
) -> CudaStatus;
type CuOccupancyMaxPotentialBlockSizeFn = unsafe extern "C" fn(
    *mut c_int,
    *mut c_int,
    CuFunction,
    *const c_void,
    usize,
    c_int,
) -> CudaStatus;
type CuGetErrorStringFn = unsafe extern "C" fn(CudaStatus, *mut *const c_char) -> CudaStatus;

fn symbol<T: Copy>(library: &Library, name: &str) -> std::result::Result<T, String> {
    // SAFETY: callers pair each symbol name with its documented C signature.
    unsafe {
        library
            .get::<T>(name.as_bytes())
            .map(|s| *s)
            .map_err(|e| format!("{name}: {e}"))
    }
}

/// Entry points resolved from `libcudart` and `libcuda`.
struct CudaApi {
    _runtime: Library,
    _driver: Library,
    set_device: CudaSetDeviceFn,
    get_device_count: CudaGetDeviceCountFn,
    device_get_attribute: CudaDeviceGetAttributeFn,
    device_synchronize: CudaDeviceSynchronizeFn,
    stream_create: CudaStreamCreateWithFlagsFn,
    stream_synchronize: CudaStreamSynchronizeFn,
    event_create: CudaEventCreateWithFlagsFn,
    event_record: CudaEventRecordFn,
    stream_wait_event: CudaStreamWaitEventFn,
    event_destroy: CudaEventDestroyFn,
    malloc: CudaMallocFn,
    free: CudaFreeFn,
    malloc_async: CudaMallocAsyncFn,
    free_async: CudaFreeAsyncFn,
    memcpy: CudaMemcpyFn,
    get_error_string: CudaGetErrorStringFn,
    module_load_data_ex: CuModuleLoadDataExFn,
    module_get_function: CuModuleGetFunctionFn,
    module_unload: CuModuleUnloadFn,
    launch_kernel: CuLaunchKernelFn,
    occupancy_max_potential_block_size: CuOccupancyMaxPotentialBlockSizeFn,
    cu_get_error_string: CuGetErrorStringFn,
}

// SAFETY: the struct holds library handles and plain function pointers.
unsafe impl Send for CudaApi {}
unsafe impl Sync for CudaApi {}

impl CudaApi {
    fn load() -> Result<Self> {
        let runtime = open_runtime_library()?;
        let driver = unsafe { Library::new("libcuda.so.1") }
            .or_else(|_| unsafe { Library::new("libcuda.so") })
            .map_err(|e| DeviceError::LibraryLoad {
                library: "libcuda".to_string(),
                message: e.to_string(),
            })?;

        let rt_err = |message: String| DeviceError::LibraryLoad {
            library: "libcudart".to_string(),
            message,
        };
        let drv_err = |message: String| DeviceError::LibraryLoad {
            library: "libcuda".to_string(),
            message,
        };

        Ok(Self {
            set_device: symbol(&runtime, "cudaSetDevice").map_err(&rt_err)?,
            get_device_count: symbol(&runtime, "cudaGetDeviceCount").map_err(&rt_err)?,
            device_get_attribute: symbol(&runtime, "cudaDeviceGetAttribute").map_err(&rt_err)?,
            device_synchronize: symbol(&runtime, "cudaDeviceSynchronize").map_err(&rt_err)?,
            stream_create: symbol(&runtime, "cudaStreamCreateWithFlags").map_err(&rt_err)?,
            stream_synchronize: symbol(&runtime, "cudaStreamSynchronize").map_err(&rt_err)?,
            event_create: symbol(&runtime, "cudaEventCreateWithFlags").map_err(&rt_err)?,
            event_record: symbol(&runtime, "cudaEventRecord").map_err(&rt_err)?,
            stream_wait_event: symbol(&runtime, "cudaStreamWaitEvent").map_err(&rt_err)?,
            event_destroy: symbol(&runtime, "cudaEventDestroy").map_err(&rt_err)?,
            malloc: symbol(&runtime, "cudaMalloc").map_err(&rt_err)?,
            free: symbol(&runtime, "cudaFree").map_err(&rt_err)?,
            malloc_async: symbol(&runtime, "cudaMallocAsync").map_err(&rt_err)?,
            free_async: symbol(&runtime, "cudaFreeAsync").map_err(&rt_err)?,
            memcpy: symbol(&runtime, "cudaMemcpy").map_err(&rt_err)?,
            get_error_string: symbol(&runtime, "cudaGetErrorString").map_err(&rt_err)?,
            module_load_data_ex: symbol(&driver, "cuModuleLoadDataEx").map_err(&drv_err)?,
            module_get_function: symbol(&driver, "cuModuleGetFunction").map_err(&drv_err)?,
            module_unload: symbol(&driver, "cuModuleUnload").map_err(&drv_err)?,
            launch_kernel: symbol(&driver, "cuLaunchKernel").map_err(&drv_err)?,
            occupancy_max_potential_block_size: symbol(
                &driver,
                "cuOccupancyMaxPotentialBlockSize",
            )
            .map_err(&drv_err)?,
            cu_get_error_string: symbol(&driver, "cuGetErrorString").map_err(&drv_err)?,
            _runtime: runtime,
            _driver: driver,
        })
    }

    fn check(&self, status: CudaStatus, op: &str) -> Result<()> {
        if status == CUDA_SUCCESS {
            return Ok(());
        }
        let ptr = unsafe { (self.get_error_string)(status) };
        let message = if ptr.is_null() {
            "unknown CUDA error".to_string()
        } else {
            unsafe { std::ffi::CStr::from_ptr(ptr).to_string_lossy().into_owned() }
        };
        Err(DeviceError::Driver {
            op: op.to_string(),
            code: status,
            message,
        })
    }

    fn check_driver(&self, status: CudaStatus, op: &str) -> Result<()> {
        if status == CUDA_SUCCESS {
            return Ok(());
        }
        let mut ptr: *const c_char = std::ptr::null();
        let lookup = unsafe { (self.cu_get_error_string)(status, &mut ptr) };
        let message = if lookup != CUDA_SUCCESS || ptr.is_null() {
            "unknown CUDA driver error".to_string()
        } else {
            unsafe { std::ffi::CStr::from_ptr(ptr).to_string_lossy().into_owned() }
        };
        Err(DeviceError::Driver {
            op: op.to_string(),
            code: status,
            message,
        })
    }

    fn set_device(&self, device: usize) -> Result<()> {
        let status = unsafe { (self.set_device)(device as c_int) };
        self.check(status, &format!("cudaSetDevice({device})"))
    }
}

fn open_runtime_library() -> Result<Library> {
    if let Ok(path) = std::env::var(CUDART_SO_PATH_ENV) {
        match unsafe { Library::new(&path) } {
            Ok(lib) => {
                tracing::debug!(path = %path, "loaded CUDA runtime from {}", CUDART_SO_PATH_ENV);
                return Ok(lib);
            }
            Err(e) => tracing::warn!(
                path = %path,
                error = %e,
                "{} set but failed to load, trying default names",
                CUDART_SO_PATH_ENV
            ),
        }
    }
    for name in ["libcudart.so.12", "libcudart.so.11", "libcudart.so"] {
        if let Ok(lib) = unsafe { Library::new(name) } {
            tracing::debug!(library = name, "loaded CUDA runtime");
            return Ok(lib);
        }
    }
    Err(DeviceError::LibraryLoad {
        library: "libcudart".to_string(),
        message: format!(
            "tried {CUDART_SO_PATH_ENV}, libcudart.so.12, libcudart.so.11, libcudart.so"
        ),
    })
}

/// Stream-ordered device allocation.
pub(crate) struct CudaMemory {
    ptr: u64,
    owner: Stream,
    api: Arc<CudaApi>,
}

impl CudaMemory {
    pub(crate) fn ptr(&self) -> u64 {
        self.ptr
    }

    /// Free on the owner stream after every other user stream has reached its
    /// current tail.
    pub(crate) fn release(&self, used_by: &[Stream]) {
        if let Err(e) = self.release_inner(used_by) {
            tracing::warn!(error = %e, ptr = self.ptr, "failed to release device buffer");
        }
    }

    fn release_inner(&self, used_by: &[Stream]) -> Result<()> {
        let api = &self.api;
        api.set_device(self.owner.device)?;
        for stream in used_by.iter().filter(|s| **s != self.owner) {
            let mut event: RawEvent = std::ptr::null_mut();
            api.check(
                unsafe { (api.event_create)(&mut event, CUDA_EVENT_DISABLE_TIMING) },
                "cudaEventCreateWithFlags",
            )?;
            api.check(
                unsafe { (api.event_record)(event, stream.as_ptr()) },
                "cudaEventRecord",
            )?;
            api.check(
                unsafe { (api.stream_wait_event)(self.owner.as_ptr(), event, 0) },
                "cudaStreamWaitEvent",
            )?;
            api.check(unsafe { (api.event_destroy)(event) }, "cudaEventDestroy")?;
        }
        api.check(
            unsafe { (api.free_async)(self.ptr as *mut c_void, self.owner.as_ptr()) },
            "cudaFreeAsync",
        )
    }
}

/// Kernel loaded from a module on one device.
pub struct CudaFunction {
    module: CuModule,
    function: CuFunction,
    device: usize,
    entry: String,
    api: Arc<CudaApi>,
}

// SAFETY: module and function handles are context-global and may be used
// from any thread once the owning device is made current.
unsafe impl Send for CudaFunction {}
unsafe impl Sync for CudaFunction {}

impl CudaFunction {
    pub fn entry(&self) -> &str {
        &self.entry
    }
}

impl Drop for CudaFunction {
    fn drop(&mut self) {
        if self.api.set_device(self.device).is_ok() {
            let status = unsafe { (self.api.module_unload)(self.module) };
            if status != CUDA_SUCCESS {
                tracing::warn!(entry = %self.entry, status, "cuModuleUnload failed");
            }
        }
    }
}

/// Event backing one pool slot.
pub struct CudaEvent {
    raw: RawEvent,
    device: usize,
    api: Arc<CudaApi>,
}

// SAFETY: CUDA events may be recorded and waited on from any thread.
unsafe impl Send for CudaEvent {}
unsafe impl Sync for CudaEvent {}

impl Drop for CudaEvent {
    fn drop(&mut self) {
        if self.api.set_device(self.device).is_ok() {
            unsafe { (self.api.event_destroy)(self.raw) };
        }
    }
}

/// CUDA implementation of [`DeviceRuntime`].
pub struct CudaPlatform {
    api: Arc<CudaApi>,
    device_count: usize,
    streams: Mutex<HashMap<(usize, StreamKind), usize>>,
}

impl CudaPlatform {
    /// Load the CUDA runtime and driver libraries.
    pub fn new() -> Result<Self> {
        let api = Arc::new(CudaApi::load()?);
        let mut count: c_int = 0;
        api.check(
            unsafe { (api.get_device_count)(&mut count) },
            "cudaGetDeviceCount",
        )?;
        tracing::info!(devices = count, "CUDA platform loaded");
        Ok(Self {
            api,
            device_count: count.max(0) as usize,
            streams: Mutex::new(HashMap::new()),
        })
    }

    /// Select `device` and force its context to exist before communicator
    /// creation, by allocating and freeing a small buffer.
    pub fn set_device_eager(&self, device: usize) -> Result<()> {
        self.check_device(device)?;
        let api = &self.api;
        api.set_device(device)?;
        let mut ptr: *mut c_void = std::ptr::null_mut();
        api.check(unsafe { (api.malloc)(&mut ptr, 64) }, "cudaMalloc(64)")?;
        api.check(unsafe { (api.free)(ptr) }, "cudaFree")?;
        api.check(
            unsafe { (api.device_synchronize)() },
            "cudaDeviceSynchronize",
        )?;
        tracing::trace!(device, "CUDA device context eagerly initialized");
        Ok(())
    }

    fn check_device(&self, device: usize) -> Result<()> {
        if device >= self.device_count {
            return Err(DeviceError::InvalidDevice {
                device,
                device_count: self.device_count,
            });
        }
        Ok(())
    }

    fn check_cuda_buffer(buffer: &DeviceBuffer) -> Result<u64> {
        buffer.device_ptr().ok_or(DeviceError::MemoryKind {
            expected: "cuda",
            actual: "host",
        })
    }
}

impl DeviceRuntime for CudaPlatform {
    type Function = CudaFunction;
    type Event = CudaEvent;

    fn name(&self) -> &'static str {
        "cuda"
    }

    fn device_count(&self) -> usize {
        self.device_count
    }

    fn arch(&self, device: usize) -> Result<String> {
        self.check_device(device)?;
        let (mut major, mut minor): (c_int, c_int) = (0, 0);
        let api = &self.api;
        api.check(
            unsafe {
                (api.device_get_attribute)(
                    &mut major,
                    CUDA_DEV_ATTR_COMPUTE_CAPABILITY_MAJOR,
                    device as c_int,
                )
            },
            "cudaDeviceGetAttribute(major)",
        )?;
        api.check(
            unsafe {
                (api.device_get_attribute)(
                    &mut minor,
                    CUDA_DEV_ATTR_COMPUTE_CAPABILITY_MINOR,
                    device as c_int,
                )
            },
            "cudaDeviceGetAttribute(minor)",
        )?;
        Ok(format!("{major}{minor}"))
    }

    fn stream(&self, device: usize, kind: StreamKind) -> Result<Stream> {
        self.check_device(device)?;
        let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(raw) = streams.get(&(device, kind)) {
            return Ok(Stream::new(device, kind, *raw));
        }
        self.api.set_device(device)?;
        let mut raw: RawStream = std::ptr::null_mut();
        self.api.check(
            unsafe { (self.api.stream_create)(&mut raw, CUDA_STREAM_NON_BLOCKING) },
            "cudaStreamCreateWithFlags",
        )?;
        tracing::debug!(device, stream = %kind, "created CUDA stream");
        streams.insert((device, kind), raw as usize);
        Ok(Stream::new(device, kind, raw as usize))
    }

    fn alloc(&self, dtype: DType, shape: &[usize], stream: Stream) -> Result<DeviceBuffer> {
        self.check_device(stream.device)?;
        let bytes = shape.iter().product::<usize>() * dtype.size_in_bytes();
        self.api.set_device(stream.device)?;
        let mut ptr: *mut c_void = std::ptr::null_mut();
        self.api.check(
            unsafe { (self.api.malloc_async)(&mut ptr, bytes.max(1), stream.as_ptr()) },
            &format!("cudaMallocAsync({bytes})"),
        )?;
        let memory = Memory::Cuda(CudaMemory {
            ptr: ptr as u64,
            owner: stream,
            api: Arc::clone(&self.api),
        });
        Ok(DeviceBuffer::from_memory(
            memory,
            dtype,
            shape,
            stream.device,
            stream,
        ))
    }

    fn write_buffer(&self, buffer: &DeviceBuffer, bytes: &[u8]) -> Result<()> {
        let ptr = Self::check_cuda_buffer(buffer)?;
        if bytes.len() != buffer.nbytes() {
            return Err(DeviceError::SizeMismatch {
                expected: buffer.nbytes(),
                actual: bytes.len(),
            });
        }
        for stream in buffer.used_by() {
            self.synchronize(stream)?;
        }
        self.api.check(
            unsafe {
                (self.api.memcpy)(
                    ptr as *mut c_void,
                    bytes.as_ptr() as *const c_void,
                    bytes.len(),
                    CUDA_MEMCPY_HOST_TO_DEVICE,
                )
            },
            "cudaMemcpy(HtoD)",
        )
    }

    fn read_buffer(&self, buffer: &DeviceBuffer) -> Result<Vec<u8>> {
        let ptr = Self::check_cuda_buffer(buffer)?;
        for stream in buffer.used_by() {
            self.synchronize(stream)?;
        }
        let mut out = vec![0u8; buffer.nbytes()];
        self.api.check(
            unsafe {
                (self.api.memcpy)(
                    out.as_mut_ptr() as *mut c_void,
                    ptr as *const c_void,
                    out.len(),
                    CUDA_MEMCPY_DEVICE_TO_HOST,
                )
            },
            "cudaMemcpy(DtoH)",
        )?;
        Ok(out)
    }

    fn load_function(
        &self,
        device: usize,
        image: &KernelImage,
        entry: &str,
        launch_bound: u32,
    ) -> Result<CudaFunction> {
        self.check_device(device)?;
        let data: Vec<u8> = match image {
            KernelImage::Binary(bytes) => bytes.clone(),
            KernelImage::Ptx(ptx) => {
                let mut bytes = ptx.clone().into_bytes();
                bytes.push(0);
                bytes
            }
            KernelImage::Host { .. } => {
                return Err(DeviceError::UnsupportedImage {
                    runtime: "cuda",
                    reason: "host images only run on the host platform".to_string(),
                })
            }
        };
        let api = &self.api;
        api.set_device(device)?;

        let mut options = [CU_JIT_OPTIMIZATION_LEVEL, CU_JIT_THREADS_PER_BLOCK];
        let mut values = [
            JIT_OPTIMIZATION_LEVEL as *mut c_void,
            launch_bound as usize as *mut c_void,
        ];
        let mut module: CuModule = std::ptr::null_mut();
        api.check_driver(
            unsafe {
                (api.module_load_data_ex)(
                    &mut module,
                    data.as_ptr() as *const c_void,
                    options.len() as c_uint,
                    options.as_mut_ptr(),
                    values.as_mut_ptr(),
                )
            },
            "cuModuleLoadDataEx",
        )?;

        let name = CString::new(entry).map_err(|_| DeviceError::InvalidArguments {
            entry: entry.to_string(),
            reason: "entry name contains a NUL byte".to_string(),
        })?;
        let mut function: CuFunction = std::ptr::null_mut();
        let status = unsafe { (api.module_get_function)(&mut function, module, name.as_ptr()) };
        if let Err(e) = api.check_driver(status, &format!("cuModuleGetFunction({entry})")) {
            unsafe { (api.module_unload)(module) };
            return Err(e);
        }
        tracing::debug!(entry, device, image = image.kind(), "loaded CUDA module");
        Ok(CudaFunction {
            module,
            function,
            device,
            entry: entry.to_string(),
            api: Arc::clone(&self.api),
        })
    }

    fn launch(
        &self,
        function: &CudaFunction,
        geometry: &LaunchGeometry,
        args: &[KernelArg<'_>],
        stream: Stream,
    ) -> Result<()> {
        // One 8-byte slot per argument; scalars narrower than 8 bytes occupy
        // the low bytes (little-endian hosts).
        let mut slots: Vec<u64> = Vec::with_capacity(args.len());
        for arg in args {
            match arg {
                KernelArg::Buffer(buf) => slots.push(Self::check_cuda_buffer(buf)?),
                KernelArg::Scalar(s) => slots.push(s.to_bits()),
            }
        }
        let mut params: Vec<*mut c_void> = slots
            .iter_mut()
            .map(|slot| slot as *mut u64 as *mut c_void)
            .collect();

        let api = &self.api;
        api.set_device(function.device)?;
        let (b, t) = (geometry.blocks, geometry.threads);
        api.check_driver(
            unsafe {
                (api.launch_kernel)(
                    function.function,
                    b.x,
                    b.y,
                    b.z,
                    t.x,
                    t.y,
                    t.z,
                    0,
                    stream.as_ptr(),
                    params.as_mut_ptr(),
                    std::ptr::null_mut(),
                )
            },
            &format!("cuLaunchKernel({})", function.entry),
        )
    }

    fn max_potential_geometry(&self, function: &CudaFunction) -> Result<(u32, u32)> {
        let (mut grid, mut block): (c_int, c_int) = (0, 0);
        let api = &self.api;
        api.set_device(function.device)?;
        api.check_driver(
            unsafe {
                (api.occupancy_max_potential_block_size)(
                    &mut grid,
                    &mut block,
                    function.function,
                    std::ptr::null(),
                    0,
                    0,
                )
            },
            "cuOccupancyMaxPotentialBlockSize",
        )?;
        Ok((grid.max(1) as u32, block.max(1) as u32))
    }

    fn create_event(&self, device: usize, _slot: usize) -> Result<CudaEvent> {
        self.check_device(device)?;
        self.api.set_device(device)?;
        let mut raw: RawEvent = std::ptr::null_mut();
        self.api.check(
            unsafe { (self.api.event_create)(&mut raw, CUDA_EVENT_DISABLE_TIMING) },
            "cudaEventCreateWithFlags",
        )?;
        Ok(CudaEvent {
            raw,
            device,
            api: Arc::clone(&self.api),
        })
    }

    fn record_event(&self, event: &CudaEvent, stream: Stream) -> Result<()> {
        self.api.set_device(event.device)?;
        self.api.check(
            unsafe { (self.api.event_record)(event.raw, stream.as_ptr()) },
            "cudaEventRecord",
        )
    }

    fn wait_event(&self, event: &CudaEvent, stream: Stream) -> Result<()> {
        self.api.set_device(stream.device)?;
        self.api.check(
            unsafe { (self.api.stream_wait_event)(stream.as_ptr(), event.raw, 0) },
            "cudaStreamWaitEvent",
        )
    }

    fn synchronize(&self, stream: Stream) -> Result<()> {
        self.api.set_device(stream.device)?;
        self.api.check(
            unsafe { (self.api.stream_synchronize)(stream.as_ptr()) },
            "cudaStreamSynchronize",
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore = "Requires CUDA"]
    fn platform_reports_arch() {
        let platform = CudaPlatform::new().unwrap();
        assert!(platform.device_count() > 0);
        let arch = platform.arch(0).unwrap();
        assert!(arch.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    #[ignore = "Requires CUDA"]
    fn buffer_roundtrip_through_device_memory() {
        let platform = CudaPlatform::new().unwrap();
        platform.set_device_eager(0).unwrap();
        let stream = platform.stream(0, StreamKind::Compute).unwrap();
        let buf = platform.alloc(DType::U8, &[5], stream).unwrap();
        platform.write_buffer(&buf, &[1, 2, 3, 4, 5]).unwrap();
        assert_eq!(platform.read_buffer(&buf).unwrap(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn missing_library_reports_load_error() {
        if let Err(e) = CudaPlatform::new() {
            assert!(matches!(e, DeviceError::LibraryLoad { .. } | DeviceError::Driver { .. }));
        }
    }
}
