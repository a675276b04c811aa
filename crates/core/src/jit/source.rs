//! Kernel source text and its annotations.
//!
//! Launch geometry is declared in structured comments:
//!
//! ```text
//! // [thread_extent] blockIdx.x = 16
//! // [thread_extent] threadIdx.x = 256
//! extern "C" __global__ void scale(float* out, const float* in, int n) { ... }
//! ```
//!
//! Unannotated axes default to 1; when an axis is annotated more than once the
//! first annotation wins.

use std::sync::LazyLock;

use regex::Regex;

use super::error::{JitError, Result};
use crate::runtime::{Dim3, LaunchGeometry};

/// Headers prepended to every injected source.
pub const SOURCE_PRELUDE: &str = "#include <cuda_runtime.h>\n#include <cuda_fp16.h>\n";

/// Threads-per-block JIT hint when the source declares no `__launch_bounds__`.
pub const DEFAULT_LAUNCH_BOUND: u32 = 1024;

const ENTRY_MARKER: &str = "__global__";

static THREAD_EXTENT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"//\s*\[thread_extent\]\s*(blockIdx|threadIdx)\.([xyz])\s*=\s*(\d+)")
        .expect("THREAD_EXTENT_REGEX pattern is invalid")
});

static ENTRY_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s+void\s+(?:__launch_bounds__\s*\([^)]*\)\s*)?([A-Za-z_][A-Za-z0-9_]*)\s*\(")
        .expect("ENTRY_REGEX pattern is invalid")
});

static LAUNCH_BOUNDS_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"__launch_bounds__\s*\(\s*(\d+)").expect("LAUNCH_BOUNDS_REGEX pattern is invalid")
});

/// Parsed kernel source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSource {
    text: String,
    entry: String,
    geometry: LaunchGeometry,
    launch_bound: u32,
}

impl KernelSource {
    /// Parse `body`, locating the entry point and the launch annotations.
    ///
    /// The entry-point marker `__global__` must appear exactly once and be
    /// followed by `void <name>(`.
    pub fn parse(body: &str) -> Result<Self> {
        let markers: Vec<usize> = body.match_indices(ENTRY_MARKER).map(|(i, _)| i).collect();
        let start = match markers.as_slice() {
            [only] => *only + ENTRY_MARKER.len(),
            [] => {
                return Err(JitError::MalformedSource(format!(
                    "no `{ENTRY_MARKER}` entry point"
                )))
            }
            many => {
                return Err(JitError::MalformedSource(format!(
                    "`{ENTRY_MARKER}` appears {} times, expected exactly once",
                    many.len()
                )))
            }
        };
        let entry = ENTRY_REGEX
            .captures(&body[start..])
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| {
                JitError::MalformedSource(format!(
                    "`{ENTRY_MARKER}` is not followed by `void <name>(`"
                ))
            })?;

        let launch_bound = LAUNCH_BOUNDS_REGEX
            .captures(body)
            .and_then(|c| c[1].parse().ok())
            .unwrap_or(DEFAULT_LAUNCH_BOUND);

        Ok(Self {
            text: format!("{SOURCE_PRELUDE}{body}"),
            entry,
            geometry: parse_thread_extents(body),
            launch_bound,
        })
    }

    /// Full compilable text, prelude included.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Entry point name.
    pub fn entry(&self) -> &str {
        &self.entry
    }

    /// Geometry from annotations (extent 1 where unannotated).
    pub fn geometry(&self) -> LaunchGeometry {
        self.geometry
    }

    pub fn launch_bound(&self) -> u32 {
        self.launch_bound
    }
}

fn parse_thread_extents(body: &str) -> LaunchGeometry {
    let mut blocks: [Option<u32>; 3] = [None; 3];
    let mut threads: [Option<u32>; 3] = [None; 3];
    for caps in THREAD_EXTENT_REGEX.captures_iter(body) {
        let Ok(value) = caps[3].parse::<u32>() else {
            continue;
        };
        let axis = match &caps[2] {
            "x" => 0,
            "y" => 1,
            _ => 2,
        };
        let target = if &caps[1] == "blockIdx" {
            &mut blocks
        } else {
            &mut threads
        };
        target[axis].get_or_insert(value);
    }
    let dim = |a: [Option<u32>; 3]| Dim3::new(a[0].unwrap_or(1), a[1].unwrap_or(1), a[2].unwrap_or(1));
    LaunchGeometry {
        blocks: dim(blocks),
        threads: dim(threads),
    }
}
