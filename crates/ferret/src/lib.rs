//! # Ferret
//!
//! Layout-adaptive 2D convolution dispatch.
//!
//! This is the top-level facade crate. Callers hand over plain host slices
//! in the framework's canonical layouts (activations nhwc, weights hwio);
//! the drivers ask a kernel library which layouts its primitive prefers,
//! reorder only when those differ, run the primitive and return results in
//! canonical layout.
//!
//! ## Usage
//!
//! ```rust
//! use ferret::prelude::*;
//!
//! let lib = CpuKernelLibrary::new();
//! let driver = Driver::new(&lib);
//! let params = ConvParams::new(1, 3, 3, 1, 1, 1, 1, 0);
//! let input: Vec<f32> = (0..9).map(|v| v as f32).collect();
//! let mut output = vec![0.0; 9];
//! driver.forward(&params, &input, &[2.0], &mut output)?;
//! assert_eq!(output[4], 8.0);
//! # Ok::<(), ferret::Error>(())
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|----------|
//! | `ferret-core` | Shape, Layout, TensorDesc, Memory, Stream, primitives, KernelLibrary trait |
//! | `ferret-cpu` | Reference CPU kernel library with rayon batch parallelism |
//! | `ferret` | Shape resolver, layout adapter, execution context, drivers |
//!
//! ## Modules
//!
//! - [`resolve`]: output-size formula and problem shapes
//! - [`adapt`]: zero-copy or reorder into a primitive's layout
//! - [`context`]: per-call engine and stream
//! - [`driver`]: forward, backward-weights and backward-input
//! - [`instrument`]: counting wrapper around any kernel library

pub use ferret_core::{
    Algorithm, ArgRole, DType, Engine, Error, ErrorKind, FormatTag, KernelLibrary, Memory,
    PrimitiveDesc, PrimitiveKind, PropKind, Result, Shape, TensorDesc,
};

/// Re-export the CPU kernel library.
pub use ferret_cpu::{CpuKernelConfig, CpuKernelLibrary};

pub mod adapt;
pub mod context;
pub mod driver;
pub mod instrument;
pub mod resolve;

pub use adapt::{adapt, adapt_back};
pub use context::ExecutionContext;
pub use driver::{
    BackwardInputStrategy, BackwardWeightsStrategy, Binding, ConvStrategy, Driver, DriverConfig,
    ForwardStrategy, Operand, OperationKind,
};
pub use instrument::{DispatchStats, Instrumented};
pub use resolve::{resolve, ConvParams, ConvShapes};

/// Prelude: import this for the most common types.
pub mod prelude {
    pub use crate::{
        Algorithm, ConvParams, CpuKernelConfig, CpuKernelLibrary, DispatchStats, Driver,
        DriverConfig, Error, ErrorKind, Instrumented, KernelLibrary, OperationKind, PropKind,
        Result,
    };
}
