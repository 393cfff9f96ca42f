use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::desc::TensorDesc;
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::stream::Engine;

// Memory: a device buffer tagged with its descriptor
//
// Cloning a Memory does not copy data: both handles alias one buffer. That
// is how a driver "aliases" the caller's canonical handle to a primitive's
// output when no reorder back is needed.
//
// Buffers hold f32 values laid out densely according to the descriptor's
// format. Reading and writing go through RwLocks so a handle can be shared
// with tasks queued on a stream.

/// Device-resident buffer plus its [`TensorDesc`].
#[derive(Clone)]
pub struct Memory {
    desc: TensorDesc,
    layout: Layout,
    engine: Engine,
    buffer: Arc<RwLock<Vec<f32>>>,
}

impl Memory {
    /// Allocate a zero-filled buffer for `desc` on `engine`.
    ///
    /// Fails if the format is still unconstrained, if the element type is not
    /// f32, or if the allocation itself cannot be satisfied.
    pub fn allocate(engine: &Engine, desc: &TensorDesc) -> Result<Self> {
        let layout = desc.layout()?;
        if desc.dtype() != DType::F32 {
            return Err(Error::unsupported(format!(
                "no {} buffers on engine {engine}",
                desc.dtype()
            )));
        }
        let n = desc.elem_count();
        let mut data: Vec<f32> = Vec::new();
        data.try_reserve_exact(n).map_err(|e| {
            let bytes = n.saturating_mul(desc.dtype().size_in_bytes());
            Error::resource(format!("cannot allocate {bytes} bytes for {desc}: {e}"))
        })?;
        data.resize(n, 0.0);
        Ok(Memory {
            desc: desc.clone(),
            layout,
            engine: engine.clone(),
            buffer: Arc::new(RwLock::new(data)),
        })
    }

    pub fn desc(&self) -> &TensorDesc {
        &self.desc
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn elem_count(&self) -> usize {
        self.desc.elem_count()
    }

    /// Whether both handles point at the same buffer.
    pub fn shares_buffer(&self, other: &Memory) -> bool {
        Arc::ptr_eq(&self.buffer, &other.buffer)
    }

    pub fn read(&self) -> Result<RwLockReadGuard<'_, Vec<f32>>> {
        self.buffer
            .read()
            .map_err(|_| Error::resource(format!("buffer lock poisoned ({})", self.desc)))
    }

    pub fn write(&self) -> Result<RwLockWriteGuard<'_, Vec<f32>>> {
        self.buffer
            .write()
            .map_err(|_| Error::resource(format!("buffer lock poisoned ({})", self.desc)))
    }

    /// Copy a host buffer in. The host data must already be in this handle's
    /// format and have exactly its element count.
    pub fn write_from_host(&self, host: &[f32]) -> Result<()> {
        self.check_host_len(host.len())?;
        self.write()?.copy_from_slice(host);
        Ok(())
    }

    /// Copy this buffer out to the host, in this handle's format.
    pub fn read_to_host(&self, host: &mut [f32]) -> Result<()> {
        self.check_host_len(host.len())?;
        host.copy_from_slice(&self.read()?);
        Ok(())
    }

    /// Copy every element into `dst`, converting from this handle's format to
    /// the destination's. No arithmetic is performed.
    pub fn reorder_into(&self, dst: &Memory) -> Result<()> {
        if self.desc.shape() != dst.desc.shape() {
            return Err(Error::ShapeMismatch {
                role: "reorder destination",
                expected: self.desc.shape().clone(),
                got: dst.desc.shape().clone(),
            });
        }
        if self.desc.dtype() != dst.desc.dtype() {
            return Err(Error::unsupported(format!(
                "reorder cannot convert {} to {}",
                self.desc.dtype(),
                dst.desc.dtype()
            )));
        }
        if self.shares_buffer(dst) {
            if self.layout == dst.layout {
                return Ok(());
            }
            crate::bail!("in-place reorder from {} to {}", self.desc, dst.desc);
        }

        let src_data = self.read()?;
        let mut dst_data = dst.write()?;
        for (s, d) in self
            .layout
            .strided_indices()
            .zip(dst.layout.strided_indices())
        {
            dst_data[d] = src_data[s];
        }
        Ok(())
    }

    fn check_host_len(&self, got: usize) -> Result<()> {
        let expected = self.elem_count();
        if got != expected {
            return Err(Error::ElementCountMismatch {
                shape: self.desc.shape().clone(),
                expected,
                got,
            });
        }
        Ok(())
    }
}

impl PartialEq for Memory {
    /// Same descriptor and same underlying buffer.
    fn eq(&self, other: &Self) -> bool {
        self.desc == other.desc && self.shares_buffer(other)
    }
}

impl fmt::Debug for Memory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memory")
            .field("desc", &self.desc)
            .field("engine", &self.engine)
            .finish()
    }
}
