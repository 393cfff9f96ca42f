use std::sync::atomic::{AtomicU64, Ordering};

use ferret_core::desc::TensorDesc;
use ferret_core::error::Result;
use ferret_core::kernel::KernelLibrary;
use ferret_core::memory::Memory;
use ferret_core::primitive::{ConvDesc, ExecArgs, PrimitiveDesc};
use ferret_core::stream::{Engine, Task};

/// Counters observed by an [`Instrumented`] library.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Buffers allocated through the library.
    pub allocations: u64,
    /// Reorder tasks created.
    pub reorders: u64,
    /// Primitive execution tasks created.
    pub executions: u64,
    /// Primitives built, hints included.
    pub primitives_built: u64,
}

/// Wraps a [`KernelLibrary`] and counts the traffic passing through it.
///
/// Every call is forwarded to the inner library unchanged.
#[derive(Debug, Default)]
pub struct Instrumented<L> {
    inner: L,
    allocations: AtomicU64,
    reorders: AtomicU64,
    executions: AtomicU64,
    primitives_built: AtomicU64,
}

impl<L: KernelLibrary> Instrumented<L> {
    pub fn new(inner: L) -> Self {
        Instrumented {
            inner,
            allocations: AtomicU64::new(0),
            reorders: AtomicU64::new(0),
            executions: AtomicU64::new(0),
            primitives_built: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            allocations: self.allocations.load(Ordering::Relaxed),
            reorders: self.reorders.load(Ordering::Relaxed),
            executions: self.executions.load(Ordering::Relaxed),
            primitives_built: self.primitives_built.load(Ordering::Relaxed),
        }
    }

    /// Zero all counters.
    pub fn reset(&self) {
        self.allocations.store(0, Ordering::Relaxed);
        self.reorders.store(0, Ordering::Relaxed);
        self.executions.store(0, Ordering::Relaxed);
        self.primitives_built.store(0, Ordering::Relaxed);
    }
}

impl<L: KernelLibrary> KernelLibrary for Instrumented<L> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn engine(&self, index: usize) -> Result<Engine> {
        self.inner.engine(index)
    }

    fn build_primitive(
        &self,
        engine: &Engine,
        desc: &ConvDesc,
        hint: Option<&PrimitiveDesc>,
    ) -> Result<PrimitiveDesc> {
        let pd = self.inner.build_primitive(engine, desc, hint)?;
        self.primitives_built.fetch_add(1, Ordering::Relaxed);
        Ok(pd)
    }

    fn allocate(&self, engine: &Engine, desc: &TensorDesc) -> Result<Memory> {
        let mem = self.inner.allocate(engine, desc)?;
        self.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(mem)
    }

    fn reorder(&self, src: &Memory, dst: &Memory) -> Result<Task> {
        let task = self.inner.reorder(src, dst)?;
        self.reorders.fetch_add(1, Ordering::Relaxed);
        Ok(task)
    }

    fn execute(&self, primitive: &PrimitiveDesc, args: ExecArgs) -> Result<Task> {
        let task = self.inner.execute(primitive, args)?;
        self.executions.fetch_add(1, Ordering::Relaxed);
        Ok(task)
    }

    fn write_host_to_device(&self, host: &[f32], memory: &Memory) -> Result<()> {
        self.inner.write_host_to_device(host, memory)
    }

    fn read_device_to_host(&self, memory: &Memory, host: &mut [f32]) -> Result<()> {
        self.inner.read_device_to_host(memory, host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferret_core::dtype::DType;
    use ferret_core::layout::FormatTag;
    use ferret_cpu::CpuKernelLibrary;

    #[test]
    fn test_counts_allocations_and_reorders() {
        let lib = Instrumented::new(CpuKernelLibrary::new());
        let engine = lib.engine(0).unwrap();
        let a = TensorDesc::new((1, 2, 2, 2), DType::F32, FormatTag::Nhwc);
        let src = lib.allocate(&engine, &a).unwrap();
        let dst = lib.allocate(&engine, &a.with_format(FormatTag::Nchw)).unwrap();
        let task = lib.reorder(&src, &dst).unwrap();
        task().unwrap();

        let stats = lib.stats();
        assert_eq!(stats.allocations, 2);
        assert_eq!(stats.reorders, 1);
        assert_eq!(stats.executions, 0);

        lib.reset();
        assert_eq!(lib.stats(), DispatchStats::default());
    }

    #[test]
    fn test_failed_calls_are_not_counted() {
        let lib = Instrumented::new(CpuKernelLibrary::new());
        let engine = lib.engine(0).unwrap();
        let any = TensorDesc::any((1, 1, 1, 1));
        assert!(lib.allocate(&engine, &any).is_err());
        assert_eq!(lib.stats().allocations, 0);
    }
}
