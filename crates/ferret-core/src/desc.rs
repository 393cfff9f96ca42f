use std::fmt;

use crate::dtype::DType;
use crate::error::Result;
use crate::layout::{FormatTag, Layout};
use crate::shape::Shape;

/// Logical shape, element type and memory format of one tensor.
///
/// Two descriptors compare equal only if all three agree; a driver inserts a
/// reorder exactly when the descriptor it holds differs from the one a
/// primitive asks for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorDesc {
    shape: Shape,
    dtype: DType,
    format: FormatTag,
}

impl TensorDesc {
    pub fn new(shape: impl Into<Shape>, dtype: DType, format: FormatTag) -> Self {
        TensorDesc {
            shape: shape.into(),
            dtype,
            format,
        }
    }

    /// Unconstrained single-precision descriptor, for primitive requests.
    pub fn any(shape: impl Into<Shape>) -> Self {
        Self::new(shape, DType::F32, FormatTag::Any)
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn format(&self) -> FormatTag {
        self.format
    }

    pub fn elem_count(&self) -> usize {
        self.shape.elem_count()
    }

    pub fn is_resolved(&self) -> bool {
        self.format.is_resolved()
    }

    /// Same shape and dtype in another format.
    pub fn with_format(&self, format: FormatTag) -> Self {
        TensorDesc {
            shape: self.shape.clone(),
            dtype: self.dtype,
            format,
        }
    }

    /// Physical layout; fails for [`FormatTag::Any`].
    pub fn layout(&self) -> Result<Layout> {
        Layout::new(&self.shape, self.format)
    }
}

impl fmt::Display for TensorDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}:{}", self.dtype, self.shape, self.format)
    }
}
