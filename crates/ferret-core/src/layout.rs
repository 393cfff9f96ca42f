use std::fmt;

use crate::error::{Error, Result};
use crate::shape::Shape;

// Layout: how a descriptor's logical dims map onto a dense buffer
//
// A FormatTag names a physical ordering of the logical dimensions. Logical
// order is fixed per role ([N, C, H, W] for activations, [O, I, KH, KW] for
// weights); the tag says which of those dims is outermost in memory:
//
//   nchw / oihw  identity order, the layout most kernels compute in
//   nhwc         channels innermost, the framework's activation format
//   hwio         spatial outermost, output channels innermost, the
//                framework's weight format
//   any          no ordering yet; a kernel library replaces it when it
//                builds a primitive
//
// A Layout is the resolved form: the shape plus one stride per logical dim.
// Reorders walk two Layouts of the same shape in logical order and copy
// element by element, so any pair of resolved tags converts directly.

/// Memory format tag of a rank-4 convolution tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormatTag {
    /// Unconstrained: the kernel library picks the physical layout.
    Any,
    Nchw,
    Nhwc,
    Oihw,
    Hwio,
}

impl FormatTag {
    /// Physical order of the logical dimensions, outermost first.
    /// `None` for [`FormatTag::Any`].
    pub fn order(&self) -> Option<[usize; 4]> {
        match self {
            FormatTag::Any => None,
            FormatTag::Nchw | FormatTag::Oihw => Some([0, 1, 2, 3]),
            FormatTag::Nhwc => Some([0, 2, 3, 1]),
            FormatTag::Hwio => Some([2, 3, 1, 0]),
        }
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(self, FormatTag::Any)
    }

    /// Whether the tag describes an activation tensor ([N, C, H, W]).
    pub fn is_activation(&self) -> bool {
        matches!(self, FormatTag::Nchw | FormatTag::Nhwc)
    }

    /// Whether the tag describes a weight tensor ([O, I, KH, KW]).
    pub fn is_weights(&self) -> bool {
        matches!(self, FormatTag::Oihw | FormatTag::Hwio)
    }
}

impl fmt::Display for FormatTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FormatTag::Any => "any",
            FormatTag::Nchw => "nchw",
            FormatTag::Nhwc => "nhwc",
            FormatTag::Oihw => "oihw",
            FormatTag::Hwio => "hwio",
        };
        write!(f, "{s}")
    }
}

/// Resolved physical layout: logical shape plus per-dimension strides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    shape: Shape,
    strides: Vec<usize>,
}

impl Layout {
    /// Build the dense layout of `shape` in the given format.
    pub fn new(shape: &Shape, format: FormatTag) -> Result<Self> {
        let order = format.order().ok_or(Error::UnresolvedFormat { format })?;
        if shape.rank() != order.len() {
            return Err(Error::unsupported(format!(
                "format {format} needs a rank-{} shape, got {shape}",
                order.len()
            )));
        }
        if shape.checked_elem_count().is_none() {
            return Err(Error::InvalidParams(format!(
                "shape {shape} has more elements than fit in memory"
            )));
        }
        Ok(Layout {
            strides: shape.permuted_strides(&order),
            shape: shape.clone(),
        })
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn elem_count(&self) -> usize {
        self.shape.elem_count()
    }

    /// Rank-4 strides, for kernels that index activations or weights directly.
    pub fn strides4(&self) -> [usize; 4] {
        let mut s = [0usize; 4];
        for (dst, src) in s.iter_mut().zip(self.strides.iter()) {
            *dst = *src;
        }
        s
    }

    /// Flat buffer offset of a logical index: `sum(index[i] * stride[i])`.
    pub fn flat_index(&self, index: &[usize]) -> usize {
        index
            .iter()
            .zip(self.strides.iter())
            .map(|(i, s)| i * s)
            .sum()
    }

    /// Iterator over buffer offsets of every element, in logical order.
    pub fn strided_indices(&self) -> StridedIter {
        StridedIter::new(self)
    }
}

/// Yields buffer offsets for each logical element of a [`Layout`].
///
/// Keeps the current offset up to date incrementally: stepping the innermost
/// logical dim adds its stride, and a carry rewinds the finished dim.
pub struct StridedIter {
    current: Vec<usize>,
    dims: Vec<usize>,
    strides: Vec<usize>,
    offset: usize,
    remaining: usize,
    started: bool,
}

impl StridedIter {
    fn new(layout: &Layout) -> Self {
        StridedIter {
            current: vec![0; layout.shape.rank()],
            dims: layout.shape.dims().to_vec(),
            strides: layout.strides.clone(),
            offset: 0,
            remaining: layout.elem_count(),
            started: false,
        }
    }

    fn advance(&mut self) {
        for i in (0..self.dims.len()).rev() {
            self.current[i] += 1;
            self.offset += self.strides[i];
            if self.current[i] < self.dims[i] {
                return;
            }
            self.offset -= self.current[i] * self.strides[i];
            self.current[i] = 0;
        }
    }
}

impl Iterator for StridedIter {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.remaining == 0 {
            return None;
        }
        if self.started {
            self.advance();
        }
        self.started = true;
        self.remaining -= 1;
        Some(self.offset)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for StridedIter {}
