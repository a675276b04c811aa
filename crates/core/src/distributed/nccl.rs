//! NCCL (NVIDIA Collective Communications Library) bindings.
//!
//! The library is loaded at runtime with `libloading`, so builds and
//! simulated runs never need NCCL installed.
//!
//! # Architecture
//!
//! - Dynamic loading (no static linking), `EXPERTLINK_NCCL_SO_PATH` first
//! - Unique id generated by one rank and shipped out of band
//! - Communicator creation on a helper thread so the rendezvous can time out
//! - All transfers are byte-typed (`ncclUint8`) and stream-ordered
//!
//! # Usage
//!
//! ```ignore
//! use expertlink_core::distributed::nccl::NcclBackend;
//!
//! let backend = NcclBackend::new(platform)?;
//! let id = backend.unique_id()?; // rank 0, then ship it
//! let transport = backend.connect(&id, world_size, rank, device, timeout)?;
//! ```

use std::ffi::{c_char, c_int, c_void};
use std::ops::Range;
use std::sync::{mpsc, Arc};
use std::time::Duration;

use libloading::Library;

use super::error::{DistributedError, Result};
use super::transport::{CollectiveBackend, RendezvousId, Transport};
use crate::buffer::DeviceBuffer;
use crate::runtime::cuda::CudaPlatform;
use crate::runtime::{DeviceError, Stream};

/// Environment variable for a custom NCCL library path.
const NCCL_SO_PATH_ENV: &str = "EXPERTLINK_NCCL_SO_PATH";

/// NCCL result code.
pub type NcclResult = c_int;

/// NCCL communicator handle.
pub type NcclComm = *mut c_void;

/// CUDA stream handle.
pub type CudaStream = *mut c_void;

/// Size of `ncclUniqueId` in bytes.
pub const NCCL_UNIQUE_ID_BYTES: usize = 128;

/// NCCL unique ID for communicator initialization.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct NcclUniqueId {
    internal: [c_char; NCCL_UNIQUE_ID_BYTES],
}

impl Default for NcclUniqueId {
    fn default() -> Self {
        Self {
            internal: [0; NCCL_UNIQUE_ID_BYTES],
        }
    }
}

impl NcclUniqueId {
    pub fn to_rendezvous_id(&self) -> RendezvousId {
        RendezvousId(self.internal.iter().map(|&b| b as u8).collect())
    }

    pub fn from_rendezvous_id(id: &RendezvousId) -> Result<Self> {
        if id.len() != NCCL_UNIQUE_ID_BYTES {
            return Err(DistributedError::Rendezvous(format!(
                "NCCL unique id must be {NCCL_UNIQUE_ID_BYTES} bytes, got {}",
                id.len()
            )));
        }
        let mut unique = Self::default();
        for (dst, &src) in unique.internal.iter_mut().zip(id.as_bytes()) {
            *dst = src as c_char;
        }
        Ok(unique)
    }
}

/// NCCL data types.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NcclDataType {
    Int8 = 0,
    Uint8 = 1,
    Int32 = 2,
    Uint32 = 3,
    Int64 = 4,
    Uint64 = 5,
    Float16 = 6,
    Float32 = 7,
    Float64 = 8,
    Bfloat16 = 9,
}

impl NcclDataType {
    /// Convert from candle DType.
    pub fn from_dtype(dtype: candle_core::DType) -> Option<Self> {
        match dtype {
            candle_core::DType::U8 => Some(Self::Uint8),
            candle_core::DType::U32 => Some(Self::Uint32),
            candle_core::DType::I64 => Some(Self::Int64),
            candle_core::DType::BF16 => Some(Self::Bfloat16),
            candle_core::DType::F16 => Some(Self::Float16),
            candle_core::DType::F32 => Some(Self::Float32),
            candle_core::DType::F64 => Some(Self::Float64),
            #[allow(unreachable_patterns)]
            _ => None,
        }
    }
}

/// NCCL reduction operations.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NcclRedOp {
    Sum = 0,
    Prod = 1,
    Max = 2,
    Min = 3,
    Avg = 4,
}

type NcclGetVersionFn = unsafe extern "C" fn(*mut c_int) -> NcclResult;
type NcclGetUniqueIdFn = unsafe extern "C" fn(*mut NcclUniqueId) -> NcclResult;
type NcclCommInitRankFn =
    unsafe extern "C" fn(*mut NcclComm, c_int, NcclUniqueId, c_int) -> NcclResult;
type NcclCommDestroyFn = unsafe extern "C" fn(NcclComm) -> NcclResult;
type NcclCommCuDeviceFn = unsafe extern "C" fn(NcclComm, *mut c_int) -> NcclResult;
type NcclGetErrorStringFn = unsafe extern "C" fn(NcclResult) -> *const c_char;

type NcclAllReduceFn = unsafe extern "C" fn(
    *const c_void,
    *mut c_void,
    usize,
    NcclDataType,
    NcclRedOp,
    NcclComm,
    CudaStream,
) -> NcclResult;

type NcclBroadcastFn = unsafe extern "C" fn(
    *const c_void,
    *mut c_void,
    usize,
    NcclDataType,
    c_int,
    NcclComm,
    CudaStream,
) -> NcclResult;

type NcclSendFn = unsafe extern "C" fn(
    *const c_void,
    usize,
    NcclDataType,
    c_int,
    NcclComm,
    CudaStream,
) -> NcclResult;

type NcclRecvFn =
    unsafe extern "C" fn(*mut c_void, usize, NcclDataType, c_int, NcclComm, CudaStream) -> NcclResult;

type NcclGroupStartFn = unsafe extern "C" fn() -> NcclResult;
type NcclGroupEndFn = unsafe extern "C" fn() -> NcclResult;

fn symbol<T: Copy>(library: &Library, name: &str) -> Result<T> {
    // SAFETY: callers pair each symbol name with its documented NCCL signature.
    unsafe { library.get::<T>(name.as_bytes()) }
        .map(|s| *s)
        .map_err(|e| DistributedError::NcclError(format!("{name}: {e}")))
}

fn open_library() -> Result<Library> {
    if let Ok(path) = std::env::var(NCCL_SO_PATH_ENV) {
        match unsafe { Library::new(&path) } {
            Ok(lib) => {
                tracing::debug!(path = %path, "loaded NCCL from {}", NCCL_SO_PATH_ENV);
                return Ok(lib);
            }
            Err(e) => tracing::warn!(
                path = %path,
                error = %e,
                "{} set but failed to load, trying default names",
                NCCL_SO_PATH_ENV
            ),
        }
    }
    ["libnccl.so.2", "libnccl.so"]
        .iter()
        .find_map(|name| unsafe { Library::new(name) }.ok())
        .ok_or_else(|| {
            DistributedError::NcclError(format!(
                "failed to load NCCL, tried {NCCL_SO_PATH_ENV}, libnccl.so.2, libnccl.so"
            ))
        })
}

/// Dynamically loaded NCCL library.
pub struct NcclLibrary {
    _library: Library,
    version: i32,
    get_unique_id: NcclGetUniqueIdFn,
    comm_init_rank: NcclCommInitRankFn,
    comm_destroy: NcclCommDestroyFn,
    comm_cu_device: NcclCommCuDeviceFn,
    get_error_string: NcclGetErrorStringFn,
    all_reduce: NcclAllReduceFn,
    broadcast: NcclBroadcastFn,
    send: NcclSendFn,
    recv: NcclRecvFn,
    group_start: NcclGroupStartFn,
    group_end: NcclGroupEndFn,
}

// SAFETY: library handle plus plain function pointers; NCCL entry points are
// thread-safe for distinct communicators.
unsafe impl Send for NcclLibrary {}
unsafe impl Sync for NcclLibrary {}

impl NcclLibrary {
    pub fn new() -> Result<Self> {
        let library = open_library()?;
        let get_version: NcclGetVersionFn = symbol(&library, "ncclGetVersion")?;
        let mut version: c_int = 0;
        if unsafe { get_version(&mut version) } != 0 {
            return Err(DistributedError::NcclError(
                "failed to get NCCL version".to_string(),
            ));
        }

        Ok(Self {
            version,
            get_unique_id: symbol(&library, "ncclGetUniqueId")?,
            comm_init_rank: symbol(&library, "ncclCommInitRank")?,
            comm_destroy: symbol(&library, "ncclCommDestroy")?,
            comm_cu_device: symbol(&library, "ncclCommCuDevice")?,
            get_error_string: symbol(&library, "ncclGetErrorString")?,
            all_reduce: symbol(&library, "ncclAllReduce")?,
            broadcast: symbol(&library, "ncclBroadcast")?,
            send: symbol(&library, "ncclSend")?,
            recv: symbol(&library, "ncclRecv")?,
            group_start: symbol(&library, "ncclGroupStart")?,
            group_end: symbol(&library, "ncclGroupEnd")?,
            _library: library,
        })
    }

    /// NCCL version as (major, minor, patch).
    pub fn version(&self) -> (i32, i32, i32) {
        let major = self.version / 10000;
        let minor = (self.version % 10000) / 100;
        let patch = self.version % 100;
        (major, minor, patch)
    }

    pub fn get_unique_id(&self) -> Result<NcclUniqueId> {
        let mut id = NcclUniqueId::default();
        let result = unsafe { (self.get_unique_id)(&mut id) };
        self.check_result(result, "ncclGetUniqueId")?;
        Ok(id)
    }

    /// Blocks until all `world_size` ranks have called it with `unique_id`.
    pub fn comm_init_rank(
        &self,
        world_size: usize,
        unique_id: NcclUniqueId,
        rank: usize,
    ) -> Result<NcclComm> {
        let mut comm: NcclComm = std::ptr::null_mut();
        let result = unsafe {
            (self.comm_init_rank)(&mut comm, world_size as c_int, unique_id, rank as c_int)
        };
        self.check_result(result, "ncclCommInitRank")?;
        Ok(comm)
    }

    /// # Safety
    /// The `comm` handle must be valid and not already destroyed.
    pub unsafe fn comm_destroy(&self, comm: NcclComm) -> Result<()> {
        let result = (self.comm_destroy)(comm);
        self.check_result(result, "ncclCommDestroy")
    }

    /// CUDA device a communicator is bound to.
    ///
    /// # Safety
    /// The `comm` handle must be valid.
    pub unsafe fn comm_cu_device(&self, comm: NcclComm) -> Result<usize> {
        let mut device: c_int = 0;
        let result = (self.comm_cu_device)(comm, &mut device);
        self.check_result(result, "ncclCommCuDevice")?;
        Ok(device.max(0) as usize)
    }

    pub fn get_error_string(&self, result: NcclResult) -> String {
        let ptr = unsafe { (self.get_error_string)(result) };
        if ptr.is_null() {
            return format!("unknown NCCL error {result}");
        }
        unsafe { std::ffi::CStr::from_ptr(ptr).to_string_lossy().into_owned() }
    }

    fn check_result(&self, result: NcclResult, op: &str) -> Result<()> {
        if result == 0 {
            Ok(())
        } else {
            Err(DistributedError::NcclError(format!(
                "{op}: {}",
                self.get_error_string(result)
            )))
        }
    }

    /// # Safety
    /// Buffers must be valid device memory for `count` elements, `comm` and
    /// `stream` must be live handles on the same device.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn all_reduce(
        &self,
        send_buf: *const c_void,
        recv_buf: *mut c_void,
        count: usize,
        dtype: NcclDataType,
        op: NcclRedOp,
        comm: NcclComm,
        stream: CudaStream,
    ) -> Result<()> {
        let result = (self.all_reduce)(send_buf, recv_buf, count, dtype, op, comm, stream);
        self.check_result(result, "ncclAllReduce")
    }

    /// # Safety
    /// See [`NcclLibrary::all_reduce`].
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn broadcast(
        &self,
        send_buf: *const c_void,
        recv_buf: *mut c_void,
        count: usize,
        dtype: NcclDataType,
        root: usize,
        comm: NcclComm,
        stream: CudaStream,
    ) -> Result<()> {
        let result = (self.broadcast)(
            send_buf,
            recv_buf,
            count,
            dtype,
            root as c_int,
            comm,
            stream,
        );
        self.check_result(result, "ncclBroadcast")
    }

    /// # Safety
    /// `buf` must be valid device memory for `count` elements.
    pub unsafe fn send(
        &self,
        buf: *const c_void,
        count: usize,
        dtype: NcclDataType,
        dest: usize,
        comm: NcclComm,
        stream: CudaStream,
    ) -> Result<()> {
        let result = (self.send)(buf, count, dtype, dest as c_int, comm, stream);
        self.check_result(result, "ncclSend")
    }

    /// # Safety
    /// `buf` must be valid device memory with room for `count` elements.
    pub unsafe fn recv(
        &self,
        buf: *mut c_void,
        count: usize,
        dtype: NcclDataType,
        src: usize,
        comm: NcclComm,
        stream: CudaStream,
    ) -> Result<()> {
        let result = (self.recv)(buf, count, dtype, src as c_int, comm, stream);
        self.check_result(result, "ncclRecv")
    }

    pub fn group_start(&self) -> Result<()> {
        let result = unsafe { (self.group_start)() };
        self.check_result(result, "ncclGroupStart")
    }

    pub fn group_end(&self) -> Result<()> {
        let result = unsafe { (self.group_end)() };
        self.check_result(result, "ncclGroupEnd")
    }
}

/// Run a blocking communicator init on its own thread, giving up after
/// `timeout`. A result that arrives after the caller gave up is dropped,
/// either on the init thread or with the abandoned channel, which tears the
/// communicator down.
fn init_with_timeout<T, F>(rank: usize, world_size: usize, timeout: Duration, init: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    std::thread::Builder::new()
        .name(format!("nccl-init-{rank}"))
        .spawn(move || {
            if let Err(mpsc::SendError(Ok(_late))) = tx.send(init()) {
                tracing::warn!(
                    rank,
                    world_size,
                    "rendezvous completed after the caller timed out, destroying communicator"
                );
            }
        })
        .map_err(|e| DistributedError::NcclError(format!("spawn init thread: {e}")))?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => {
            tracing::warn!(rank, world_size, ?timeout, "NCCL rendezvous timed out");
            Err(DistributedError::RendezvousTimeout {
                timeout_ms: timeout.as_millis() as u64,
            })
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(DistributedError::NcclError(
            "communicator init thread exited without a result".to_string(),
        )),
    }
}

/// Check if NCCL is available on this system.
pub fn is_nccl_available() -> bool {
    NcclLibrary::new().is_ok()
}

/// [`Transport`] over one NCCL communicator.
pub struct NcclTransport {
    nccl: Arc<NcclLibrary>,
    comm: NcclComm,
    rank: usize,
    world_size: usize,
    device: usize,
}

// SAFETY: NCCL communicators may be driven from any thread as long as calls
// are not interleaved within a group, which the communicator guarantees.
unsafe impl Send for NcclTransport {}
unsafe impl Sync for NcclTransport {}

impl NcclTransport {
    fn device_ptr(&self, buffer: &DeviceBuffer, offset: usize) -> Result<*mut c_void> {
        if buffer.device() != self.device {
            return Err(DistributedError::DeviceMismatch {
                expected: self.device,
                actual: buffer.device(),
            });
        }
        let base = buffer.device_ptr().ok_or(DeviceError::MemoryKind {
            expected: "cuda",
            actual: "host",
        })?;
        Ok((base + offset as u64) as *mut c_void)
    }

    fn element_type(buffer: &DeviceBuffer) -> Result<NcclDataType> {
        NcclDataType::from_dtype(buffer.dtype()).ok_or_else(|| DistributedError::DtypeMismatch {
            op: "nccl",
            expected: "an NCCL-supported dtype".to_string(),
            actual: format!("{:?}", buffer.dtype()),
        })
    }
}

impl Transport for NcclTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn device(&self) -> usize {
        self.device
    }

    fn group_start(&self) -> Result<()> {
        self.nccl.group_start()
    }

    fn group_end(&self) -> Result<()> {
        self.nccl.group_end()
    }

    fn send(
        &self,
        buffer: &DeviceBuffer,
        bytes: Range<usize>,
        peer: usize,
        stream: Stream,
    ) -> Result<()> {
        let ptr = self.device_ptr(buffer, bytes.start)?;
        unsafe {
            self.nccl.send(
                ptr,
                bytes.len(),
                NcclDataType::Uint8,
                peer,
                self.comm,
                stream.as_ptr(),
            )
        }
    }

    fn recv(
        &self,
        buffer: &DeviceBuffer,
        bytes: Range<usize>,
        peer: usize,
        stream: Stream,
    ) -> Result<()> {
        let ptr = self.device_ptr(buffer, bytes.start)?;
        unsafe {
            self.nccl.recv(
                ptr,
                bytes.len(),
                NcclDataType::Uint8,
                peer,
                self.comm,
                stream.as_ptr(),
            )
        }
    }

    fn broadcast(&self, buffer: &DeviceBuffer, root: usize, stream: Stream) -> Result<()> {
        let ptr = self.device_ptr(buffer, 0)?;
        let dtype = Self::element_type(buffer)?;
        unsafe {
            self.nccl.broadcast(
                ptr,
                ptr,
                buffer.numel(),
                dtype,
                root,
                self.comm,
                stream.as_ptr(),
            )
        }
    }

    fn all_reduce_sum(&self, buffer: &DeviceBuffer, stream: Stream) -> Result<()> {
        let ptr = self.device_ptr(buffer, 0)?;
        let dtype = Self::element_type(buffer)?;
        unsafe {
            self.nccl.all_reduce(
                ptr,
                ptr,
                buffer.numel(),
                dtype,
                NcclRedOp::Sum,
                self.comm,
                stream.as_ptr(),
            )
        }
    }
}

impl Drop for NcclTransport {
    fn drop(&mut self) {
        // SAFETY: `comm` was created by `comm_init_rank` and is destroyed once.
        if let Err(e) = unsafe { self.nccl.comm_destroy(self.comm) } {
            tracing::warn!(error = %e, rank = self.rank, "failed to destroy NCCL communicator");
        } else {
            tracing::info!(rank = self.rank, world_size = self.world_size, "NCCL communicator destroyed");
        }
    }
}

/// [`CollectiveBackend`] creating NCCL communicators on a CUDA platform.
pub struct NcclBackend {
    nccl: Arc<NcclLibrary>,
    platform: Arc<CudaPlatform>,
}

impl NcclBackend {
    pub fn new(platform: Arc<CudaPlatform>) -> Result<Self> {
        let nccl = NcclLibrary::new()?;
        let (major, minor, patch) = nccl.version();
        tracing::info!(version = %format!("{major}.{minor}.{patch}"), "NCCL loaded");
        Ok(Self {
            nccl: Arc::new(nccl),
            platform,
        })
    }

    pub fn library(&self) -> &NcclLibrary {
        &self.nccl
    }
}

impl CollectiveBackend for NcclBackend {
    type Transport = NcclTransport;

    fn name(&self) -> &'static str {
        "nccl"
    }

    fn unique_id(&self) -> Result<RendezvousId> {
        Ok(self.nccl.get_unique_id()?.to_rendezvous_id())
    }

    fn connect(
        &self,
        id: &RendezvousId,
        world_size: usize,
        rank: usize,
        device: usize,
        timeout: Duration,
    ) -> Result<NcclTransport> {
        if rank >= world_size {
            return Err(DistributedError::InvalidRank { rank, world_size });
        }
        let unique_id = NcclUniqueId::from_rendezvous_id(id)?;
        self.platform.set_device_eager(device)?;

        tracing::debug!(rank, world_size, device, "initializing NCCL communicator");
        let nccl = Arc::clone(&self.nccl);
        let platform = Arc::clone(&self.platform);
        let transport = init_with_timeout(rank, world_size, timeout, move || {
            platform.set_device_eager(device)?;
            let comm = nccl.comm_init_rank(world_size, unique_id, rank)?;
            // SAFETY: `comm` was just created by `comm_init_rank`.
            let bound = unsafe { nccl.comm_cu_device(comm) }.unwrap_or(device);
            Ok(NcclTransport {
                nccl: Arc::clone(&nccl),
                comm,
                rank,
                world_size,
                device: bound,
            })
        })?;

        tracing::info!(
            rank,
            world_size,
            device = transport.device,
            "NCCL communicator initialized"
        );
        Ok(transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn nccl_data_type_from_dtype() {
        assert_eq!(
            NcclDataType::from_dtype(candle_core::DType::F32),
            Some(NcclDataType::Float32)
        );
        assert_eq!(
            NcclDataType::from_dtype(candle_core::DType::I64),
            Some(NcclDataType::Int64)
        );
        assert_eq!(
            NcclDataType::from_dtype(candle_core::DType::BF16),
            Some(NcclDataType::Bfloat16)
        );
    }

    #[test]
    fn unique_id_converts_through_rendezvous_id() {
        let mut id = NcclUniqueId::default();
        id.internal[0] = 7;
        id.internal[127] = 0x7f;
        let blob = id.to_rendezvous_id();
        assert_eq!(blob.len(), NCCL_UNIQUE_ID_BYTES);
        assert_eq!(blob.as_bytes()[127], 0x7f);
        let back = NcclUniqueId::from_rendezvous_id(&blob).unwrap();
        assert_eq!(back.internal[0], 7);
    }

    #[test]
    fn unique_id_rejects_wrong_length() {
        assert!(matches!(
            NcclUniqueId::from_rendezvous_id(&RendezvousId(vec![0; 3])),
            Err(DistributedError::Rendezvous(_))
        ));
    }

    #[test]
    #[ignore = "Requires NCCL library to be installed"]
    fn nccl_library_load() {
        let nccl = NcclLibrary::new().expect("Failed to load NCCL");
        let (major, _, _) = nccl.version();
        assert!(major >= 2, "NCCL version should be 2.x or higher");
    }

    #[test]
    #[ignore = "Requires CUDA"]
    fn single_rank_connect() {
        let platform = Arc::new(CudaPlatform::new().unwrap());
        let backend = NcclBackend::new(platform).unwrap();
        let id = backend.unique_id().unwrap();
        let transport = backend
            .connect(&id, 1, 0, 0, Duration::from_secs(30))
            .unwrap();
        assert_eq!(transport.world_size(), 1);
        assert_eq!(transport.device(), 0);
    }

    struct Tracked(Arc<AtomicUsize>);

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn late_init_result_is_dropped() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let handle = Arc::clone(&dropped);
        let result = init_with_timeout(0, 2, Duration::from_millis(20), move || {
            std::thread::sleep(Duration::from_millis(200));
            Ok(Tracked(handle))
        });
        assert!(matches!(
            result,
            Err(DistributedError::RendezvousTimeout { timeout_ms: 20 })
        ));
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while dropped.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn timely_init_result_is_returned() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let handle = Arc::clone(&dropped);
        let tracked =
            init_with_timeout(0, 1, Duration::from_secs(5), move || Ok(Tracked(handle))).unwrap();
        assert_eq!(dropped.load(Ordering::SeqCst), 0);
        drop(tracked);
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn is_nccl_available_check() {
        let _ = is_nccl_available();
    }
}
