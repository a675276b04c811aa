//! Compiler backends and the fallback chain.
//!
//! On CUDA the chain is `nvcc` (native fatbin) followed by NVRTC (PTX), or
//! NVRTC alone when `USE_NVRTC` is set. A backend failing hands over to the
//! next one; when every backend fails the kernel is reported as a
//! [`JitError::Compilation`] and no retry happens.

use std::path::{Path, PathBuf};
use std::process::Command;

use super::error::{JitError, Result};
use super::nvrtc::NvrtcCompiler;
use super::source::KernelSource;
use crate::config::RuntimeConfig;
use crate::logging::FallbackNotice;
use crate::runtime::KernelImage;

/// Device architecture and toolkit location for one compilation.
#[derive(Debug, Clone, Copy)]
pub struct CompileTarget<'a> {
    pub arch: &'a str,
    pub sdk_home: &'a Path,
}

/// One way of turning kernel source into a loadable image.
pub trait KernelCompiler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Compile `source` for `target`; the error string is the backend's log.
    fn compile(
        &self,
        source: &KernelSource,
        target: &CompileTarget<'_>,
    ) -> std::result::Result<KernelImage, String>;
}

/// Ahead-of-time compilation with the toolkit's `nvcc`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NvccCompiler;

impl NvccCompiler {
    pub fn executable(sdk_home: &Path) -> PathBuf {
        sdk_home.join("bin").join("nvcc")
    }
}

impl KernelCompiler for NvccCompiler {
    fn name(&self) -> &'static str {
        "nvcc"
    }

    fn compile(
        &self,
        source: &KernelSource,
        target: &CompileTarget<'_>,
    ) -> std::result::Result<KernelImage, String> {
        let nvcc = Self::executable(target.sdk_home);
        if !nvcc.exists() {
            return Err(format!(
                "CUDA compiler not found at {}; set CUDA_HOME to the toolkit location",
                nvcc.display()
            ));
        }

        let dir = tempfile::Builder::new()
            .prefix("expertlink-jit-")
            .tempdir()
            .map_err(|e| format!("failed to create scratch directory: {e}"))?;
        let code_path = dir.path().join("kernel.cu");
        let fatbin_path = dir.path().join("kernel.fatbin");
        std::fs::write(&code_path, source.text())
            .map_err(|e| format!("failed to write {}: {e}", code_path.display()))?;

        let gencode = format!("arch=compute_{0},code=sm_{0}", target.arch);
        let output = Command::new(&nvcc)
            .arg(&code_path)
            .arg("-o")
            .arg(&fatbin_path)
            .args(["--fatbin", "-O4", "-gencode", &gencode])
            .output()
            .map_err(|e| format!("failed to run {}: {e}", nvcc.display()))?;
        if !output.status.success() {
            return Err(format!(
                "nvcc exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        let image = std::fs::read(&fatbin_path)
            .map_err(|e| format!("failed to read {}: {e}", fatbin_path.display()))?;
        if image.is_empty() {
            return Err("nvcc produced an empty image".to_string());
        }
        Ok(KernelImage::Binary(image))
    }
}

/// "Compiler" for the host platform: the image names the entry point, which
/// the host runtime resolves against its kernel registry.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostCompiler;

impl KernelCompiler for HostCompiler {
    fn name(&self) -> &'static str {
        "host"
    }

    fn compile(
        &self,
        source: &KernelSource,
        _target: &CompileTarget<'_>,
    ) -> std::result::Result<KernelImage, String> {
        Ok(KernelImage::Host {
            entry: source.entry().to_string(),
        })
    }
}

/// Ordered list of backends tried until one succeeds.
pub struct CompilerChain {
    stages: Vec<Box<dyn KernelCompiler>>,
    fallback: FallbackNotice,
}

impl CompilerChain {
    pub fn new(stages: Vec<Box<dyn KernelCompiler>>, config: &RuntimeConfig) -> Self {
        assert!(!stages.is_empty(), "compiler chain needs at least one backend");
        Self {
            stages,
            fallback: FallbackNotice::new(config.fallback_log()),
        }
    }

    /// `nvcc` then NVRTC, or NVRTC only when `use_nvrtc` is set.
    pub fn for_cuda(config: &RuntimeConfig) -> Self {
        let stages: Vec<Box<dyn KernelCompiler>> = if config.use_nvrtc() {
            vec![Box::new(NvrtcCompiler::new())]
        } else {
            vec![Box::new(NvccCompiler), Box::new(NvrtcCompiler::new())]
        };
        Self::new(stages, config)
    }

    pub fn host(config: &RuntimeConfig) -> Self {
        Self::new(vec![Box::new(HostCompiler)], config)
    }

    pub fn backend_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Try each backend in order.
    pub fn compile(
        &self,
        source: &KernelSource,
        target: &CompileTarget<'_>,
        device: usize,
    ) -> Result<KernelImage> {
        let mut failures = Vec::new();
        for (i, stage) in self.stages.iter().enumerate() {
            match stage.compile(source, target) {
                Ok(image) => {
                    tracing::debug!(
                        entry = source.entry(),
                        device,
                        arch = target.arch,
                        backend = stage.name(),
                        image = image.kind(),
                        "compiled kernel"
                    );
                    return Ok(image);
                }
                Err(log) => {
                    if let Some(next) = self.stages.get(i + 1) {
                        if self.fallback.should_log() {
                            tracing::warn!(
                                entry = source.entry(),
                                backend = stage.name(),
                                next = next.name(),
                                error = %log,
                                "kernel compilation failed, falling back"
                            );
                        }
                    }
                    failures.push(format!("{}: {}", stage.name(), log));
                }
            }
        }
        Err(JitError::Compilation {
            entry: source.entry().to_string(),
            device,
            arch: target.arch.to_string(),
            details: failures.join("; "),
        })
    }
}
