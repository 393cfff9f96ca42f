//! # ferret-core
//!
//! Descriptors, buffers and the kernel-library seam for ferret.
//!
//! This crate provides:
//! - [`Shape`] / [`Layout`] / [`FormatTag`]: logical dims and their physical ordering
//! - [`TensorDesc`]: shape + dtype + format, the unit of layout comparison
//! - [`Memory`]: device buffer tagged with a descriptor, with reorders
//! - [`Engine`] / [`Stream`]: device handle and in-order task queue
//! - [`ConvDesc`] / [`PrimitiveDesc`]: primitive requests and built primitives
//! - [`KernelLibrary`] trait: what a numeric backend must supply

pub mod desc;
pub mod dtype;
pub mod error;
pub mod kernel;
pub mod layout;
pub mod memory;
pub mod primitive;
pub mod shape;
pub mod stream;

pub use desc::TensorDesc;
pub use dtype::DType;
pub use error::{Error, ErrorKind, Result};
pub use kernel::KernelLibrary;
pub use layout::{FormatTag, Layout};
pub use memory::Memory;
pub use primitive::{
    Algorithm, ArgRole, ConvDesc, ExecArgs, Primitive, PrimitiveDesc, PrimitiveKind, PropKind,
};
pub use shape::Shape;
pub use stream::{Engine, EngineKind, Stream, Task};
