//! NVRTC runtime compiler, loaded on first use.

use std::ffi::{c_char, c_int, c_void, CString};
use std::sync::OnceLock;

use libloading::Library;

use super::compiler::{CompileTarget, KernelCompiler};
use super::source::KernelSource;
use crate::runtime::KernelImage;

type NvrtcResult = c_int;
type NvrtcProgram = *mut c_void;

type NvrtcCreateProgramFn = unsafe extern "C" fn(
    *mut NvrtcProgram,
    *const c_char,
    *const c_char,
    c_int,
    *const *const c_char,
    *const *const c_char,
) -> NvrtcResult;
type NvrtcCompileProgramFn =
    unsafe extern "C" fn(NvrtcProgram, c_int, *const *const c_char) -> NvrtcResult;
type NvrtcGetSizeFn = unsafe extern "C" fn(NvrtcProgram, *mut usize) -> NvrtcResult;
type NvrtcGetTextFn = unsafe extern "C" fn(NvrtcProgram, *mut c_char) -> NvrtcResult;
type NvrtcDestroyProgramFn = unsafe extern "C" fn(*mut NvrtcProgram) -> NvrtcResult;
type NvrtcGetErrorStringFn = unsafe extern "C" fn(NvrtcResult) -> *const c_char;

fn symbol<T: Copy>(library: &Library, name: &str) -> Result<T, String> {
    // SAFETY: callers pair each symbol name with its documented NVRTC signature.
    unsafe { library.get::<T>(name.as_bytes()) }
        .map(|s| *s)
        .map_err(|e| format!("{name}: {e}"))
}

struct NvrtcLibrary {
    _library: Library,
    create_program: NvrtcCreateProgramFn,
    compile_program: NvrtcCompileProgramFn,
    get_program_log_size: NvrtcGetSizeFn,
    get_program_log: NvrtcGetTextFn,
    get_ptx_size: NvrtcGetSizeFn,
    get_ptx: NvrtcGetTextFn,
    destroy_program: NvrtcDestroyProgramFn,
    get_error_string: NvrtcGetErrorStringFn,
}

// SAFETY: library handle plus plain function pointers; NVRTC programs are
// created and destroyed within a single call.
unsafe impl Send for NvrtcLibrary {}
unsafe impl Sync for NvrtcLibrary {}

impl NvrtcLibrary {
    fn load() -> Result<Self, String> {
        let names = ["libnvrtc.so.12", "libnvrtc.so.11.2", "libnvrtc.so"];
        let library = names
            .iter()
            .find_map(|name| unsafe { Library::new(name) }.ok())
            .ok_or_else(|| format!("failed to load NVRTC, tried {}", names.join(", ")))?;

        Ok(Self {
            create_program: symbol(&library, "nvrtcCreateProgram")?,
            compile_program: symbol(&library, "nvrtcCompileProgram")?,
            get_program_log_size: symbol(&library, "nvrtcGetProgramLogSize")?,
            get_program_log: symbol(&library, "nvrtcGetProgramLog")?,
            get_ptx_size: symbol(&library, "nvrtcGetPTXSize")?,
            get_ptx: symbol(&library, "nvrtcGetPTX")?,
            destroy_program: symbol(&library, "nvrtcDestroyProgram")?,
            get_error_string: symbol(&library, "nvrtcGetErrorString")?,
            _library: library,
        })
    }

    fn error_string(&self, code: NvrtcResult) -> String {
        let ptr = unsafe { (self.get_error_string)(code) };
        if ptr.is_null() {
            return format!("NVRTC error {code}");
        }
        unsafe { std::ffi::CStr::from_ptr(ptr).to_string_lossy().into_owned() }
    }

    fn check(&self, code: NvrtcResult, op: &str) -> Result<(), String> {
        if code == 0 {
            Ok(())
        } else {
            Err(format!("{op} failed: {}", self.error_string(code)))
        }
    }

    fn read_text(
        &self,
        program: NvrtcProgram,
        size_fn: NvrtcGetSizeFn,
        text_fn: NvrtcGetTextFn,
        op: &str,
    ) -> Result<String, String> {
        let mut size = 0usize;
        self.check(unsafe { size_fn(program, &mut size) }, op)?;
        let mut buf = vec![0u8; size.max(1)];
        self.check(unsafe { text_fn(program, buf.as_mut_ptr() as *mut c_char) }, op)?;
        while buf.last() == Some(&0) {
            buf.pop();
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    fn compile(&self, code: &str, options: &[String]) -> Result<String, String> {
        let code = CString::new(code).map_err(|_| "kernel source contains a NUL byte")?;
        let options: Vec<CString> = options
            .iter()
            .map(|o| CString::new(o.as_str()))
            .collect::<Result<_, _>>()
            .map_err(|_| "compiler option contains a NUL byte")?;
        let option_ptrs: Vec<*const c_char> = options.iter().map(|o| o.as_ptr()).collect();

        let mut program: NvrtcProgram = std::ptr::null_mut();
        self.check(
            unsafe {
                (self.create_program)(
                    &mut program,
                    code.as_ptr(),
                    std::ptr::null(),
                    0,
                    std::ptr::null(),
                    std::ptr::null(),
                )
            },
            "nvrtcCreateProgram",
        )?;

        let status = unsafe {
            (self.compile_program)(program, option_ptrs.len() as c_int, option_ptrs.as_ptr())
        };
        let result = if status == 0 {
            self.read_text(program, self.get_ptx_size, self.get_ptx, "nvrtcGetPTX")
        } else {
            let log = self
                .read_text(
                    program,
                    self.get_program_log_size,
                    self.get_program_log,
                    "nvrtcGetProgramLog",
                )
                .unwrap_or_default();
            Err(format!("{}: {}", self.error_string(status), log.trim()))
        };
        unsafe { (self.destroy_program)(&mut program) };
        result
    }
}

/// Runtime compilation to PTX through NVRTC.
#[derive(Default)]
pub struct NvrtcCompiler {
    library: OnceLock<Result<NvrtcLibrary, String>>,
}

impl NvrtcCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options passed to NVRTC for `target`.
    pub fn options(target: &CompileTarget<'_>) -> Vec<String> {
        vec![
            "--restrict".to_string(),
            format!("--include-path={}", target.sdk_home.join("include").display()),
            format!("--gpu-architecture=compute_{}", target.arch),
            "--use_fast_math".to_string(),
            "--extra-device-vectorization".to_string(),
        ]
    }
}

impl KernelCompiler for NvrtcCompiler {
    fn name(&self) -> &'static str {
        "nvrtc"
    }

    fn compile(
        &self,
        source: &KernelSource,
        target: &CompileTarget<'_>,
    ) -> Result<KernelImage, String> {
        let library = self
            .library
            .get_or_init(|| {
                let loaded = NvrtcLibrary::load();
                if loaded.is_ok() {
                    tracing::debug!("loaded NVRTC");
                }
                loaded
            })
            .as_ref()
            .map_err(|e| e.clone())?;
        library
            .compile(source.text(), &Self::options(target))
            .map(KernelImage::Ptx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn options_target_arch_and_sdk_headers() {
        let target = CompileTarget {
            arch: "86",
            sdk_home: Path::new("/opt/cuda"),
        };
        let options = NvrtcCompiler::options(&target);
        assert!(options.contains(&"--gpu-architecture=compute_86".to_string()));
        assert!(options.contains(&"--include-path=/opt/cuda/include".to_string()));
        assert!(options.contains(&"--restrict".to_string()));
    }

    #[test]
    #[ignore = "Requires CUDA"]
    fn compiles_to_ptx() {
        let source = KernelSource::parse(
            "extern \"C\" __global__ void k(int* x) { x[threadIdx.x] = 1; }",
        )
        .unwrap();
        let target = CompileTarget {
            arch: "80",
            sdk_home: Path::new("/usr/local/cuda"),
        };
        match NvrtcCompiler::new().compile(&source, &target).unwrap() {
            KernelImage::Ptx(ptx) => assert!(ptx.contains(".entry k")),
            other => panic!("unexpected image {}", other.kind()),
        }
    }
}
