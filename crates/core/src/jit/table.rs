//! Kernel descriptor table.
//!
//! Append-only arena of descriptors addressed by [`KernelHandle`]. Each
//! descriptor owns one slot per device; a slot is filled by the first
//! successful compilation on that device and never replaced. Compilation of
//! one slot is serialized by that slot's lock, so different kernels and
//! different devices never wait on each other.

use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use super::error::{JitError, Result};
use super::source::KernelSource;

/// Stable identity of an injected kernel. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KernelHandle(pub usize);

impl fmt::Display for KernelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct DeviceSlot<F> {
    compiled: OnceLock<Arc<F>>,
    init: Mutex<()>,
}

impl<F> Default for DeviceSlot<F> {
    fn default() -> Self {
        Self {
            compiled: OnceLock::new(),
            init: Mutex::new(()),
        }
    }
}

/// Source plus per-device compiled functions.
pub struct KernelDescriptor<F> {
    source: KernelSource,
    slots: Vec<DeviceSlot<F>>,
}

impl<F> KernelDescriptor<F> {
    pub fn source(&self) -> &KernelSource {
        &self.source
    }

    /// Whether a compiled function is cached for `device`.
    pub fn is_compiled(&self, device: usize) -> bool {
        self.slots
            .get(device)
            .is_some_and(|s| s.compiled.get().is_some())
    }
}

/// Arena of kernel descriptors.
pub struct KernelTable<F> {
    num_devices: usize,
    descriptors: RwLock<Vec<Arc<KernelDescriptor<F>>>>,
}

impl<F> KernelTable<F> {
    pub fn new(num_devices: usize) -> Self {
        Self {
            num_devices,
            descriptors: RwLock::new(Vec::new()),
        }
    }

    /// Append a descriptor and return its fresh handle.
    pub fn insert(&self, source: KernelSource) -> KernelHandle {
        let descriptor = Arc::new(KernelDescriptor {
            source,
            slots: (0..self.num_devices).map(|_| DeviceSlot::default()).collect(),
        });
        let mut descriptors = self.descriptors.write().unwrap_or_else(|e| e.into_inner());
        descriptors.push(descriptor);
        KernelHandle(descriptors.len() - 1)
    }

    pub fn get(&self, handle: KernelHandle) -> Result<Arc<KernelDescriptor<F>>> {
        self.descriptors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(handle.0)
            .cloned()
            .ok_or(JitError::UnknownHandle(handle))
    }

    pub fn len(&self) -> usize {
        self.descriptors
            .read()
            .map(|d| d.len())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cached function of `handle` on `device`, compiling it with `compile`
    /// on first use.
    pub fn get_or_compile(
        &self,
        handle: KernelHandle,
        device: usize,
        compile: impl FnOnce(&KernelSource) -> Result<F>,
    ) -> Result<Arc<F>> {
        let descriptor = self.get(handle)?;
        let slot = descriptor
            .slots
            .get(device)
            .ok_or(JitError::InvalidDevice {
                device,
                device_count: self.num_devices,
            })?;
        if let Some(function) = slot.compiled.get() {
            return Ok(Arc::clone(function));
        }

        let _guard = slot.init.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(function) = slot.compiled.get() {
            return Ok(Arc::clone(function));
        }
        let function = Arc::new(compile(&descriptor.source)?);
        let _ = slot.compiled.set(Arc::clone(&function));
        Ok(function)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn source(name: &str) -> KernelSource {
        KernelSource::parse(&format!("__global__ void {name}() {{}}")).unwrap()
    }

    #[test]
    fn handles_are_sequential_and_stable() {
        let table: KernelTable<String> = KernelTable::new(2);
        assert!(table.is_empty());
        let a = table.insert(source("a"));
        let b = table.insert(source("b"));
        assert_eq!((a, b), (KernelHandle(0), KernelHandle(1)));
        assert_eq!(table.get(b).unwrap().source().entry(), "b");
        assert!(matches!(
            table.get(KernelHandle(9)),
            Err(JitError::UnknownHandle(KernelHandle(9)))
        ));
    }

    #[test]
    fn compiles_once_per_device() {
        let table: KernelTable<String> = KernelTable::new(2);
        let h = table.insert(source("k"));
        let calls = AtomicUsize::new(0);
        let compile = |s: &KernelSource| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("{}-image", s.entry()))
        };
        let first = table.get_or_compile(h, 0, compile).unwrap();
        let again = table.get_or_compile(h, 0, compile).unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        table.get_or_compile(h, 1, compile).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(table.get(h).unwrap().is_compiled(1));
    }

    #[test]
    fn failed_compilation_leaves_slot_empty() {
        let table: KernelTable<String> = KernelTable::new(1);
        let h = table.insert(source("k"));
        let err = table.get_or_compile(h, 0, |_| Err(JitError::MalformedSource("x".into())));
        assert!(err.is_err());
        assert!(!table.get(h).unwrap().is_compiled(0));
        assert!(table.get_or_compile(h, 0, |_| Ok("ok".to_string())).is_ok());
    }

    #[test]
    fn out_of_range_device() {
        let table: KernelTable<String> = KernelTable::new(1);
        let h = table.insert(source("k"));
        assert!(matches!(
            table.get_or_compile(h, 3, |_| Ok(String::new())),
            Err(JitError::InvalidDevice { device: 3, .. })
        ));
    }

    #[test]
    fn concurrent_first_use_compiles_once() {
        let table: Arc<KernelTable<usize>> = Arc::new(KernelTable::new(1));
        let h = table.insert(source("k"));
        let calls = Arc::new(AtomicUsize::new(0));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let table = Arc::clone(&table);
                let calls = Arc::clone(&calls);
                std::thread::spawn(move || {
                    table
                        .get_or_compile(h, 0, |_| {
                            std::thread::sleep(std::time::Duration::from_millis(5));
                            Ok(calls.fetch_add(1, Ordering::SeqCst))
                        })
                        .map(|f| *f)
                })
            })
            .collect();
        for t in threads {
            assert_eq!(t.join().unwrap().unwrap(), 0);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
