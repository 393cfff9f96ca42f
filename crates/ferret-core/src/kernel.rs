use crate::desc::TensorDesc;
use crate::error::Result;
use crate::memory::Memory;
use crate::primitive::{ConvDesc, ExecArgs, PrimitiveDesc};
use crate::stream::{Engine, Task};

// KernelLibrary: the seam between dispatch and numeric kernels
//
// Drivers never compute a convolution themselves. They ask a KernelLibrary
// to build a primitive for a request, learn which physical layout it wants
// for each operand, and hand it buffers in exactly those layouts.
//
// Only `engine` and `build_primitive` are library specific. Allocation,
// reorders, execution binding and host copies have default implementations
// over `Memory`; a library overrides them when its buffers live elsewhere,
// and wrappers override them to observe traffic.

/// A numeric kernel library able to build convolution primitives.
pub trait KernelLibrary: Send + Sync {
    /// Short human-readable name (e.g. "cpu-ref").
    fn name(&self) -> &str;

    /// Acquire engine `index`. Must be safe to call from several threads.
    fn engine(&self, index: usize) -> Result<Engine>;

    /// Build a primitive for `desc`, resolving every `any` operand format.
    ///
    /// Backward passes take a forward primitive as `hint`; the library uses
    /// it to keep backward layouts compatible with the forward ones.
    fn build_primitive(
        &self,
        engine: &Engine,
        desc: &ConvDesc,
        hint: Option<&PrimitiveDesc>,
    ) -> Result<PrimitiveDesc>;

    /// Allocate a buffer for a resolved descriptor.
    fn allocate(&self, engine: &Engine, desc: &TensorDesc) -> Result<Memory> {
        Memory::allocate(engine, desc)
    }

    /// A task that converts `src` into `dst`'s layout.
    fn reorder(&self, src: &Memory, dst: &Memory) -> Result<Task> {
        let (src, dst) = (src.clone(), dst.clone());
        Ok(Box::new(move || src.reorder_into(&dst)))
    }

    /// A task that runs `primitive` on `args`.
    fn execute(&self, primitive: &PrimitiveDesc, args: ExecArgs) -> Result<Task> {
        primitive.bind(args)
    }

    /// Copy host data into `memory`. The host slice is in `memory`'s format
    /// and has exactly its element count.
    fn write_host_to_device(&self, host: &[f32], memory: &Memory) -> Result<()> {
        memory.write_from_host(host)
    }

    /// Copy `memory` out to a host slice of exactly its element count.
    fn read_device_to_host(&self, memory: &Memory, host: &mut [f32]) -> Result<()> {
        memory.read_to_host(host)
    }
}
