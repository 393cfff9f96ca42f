use std::fmt;

// Shape: logical dimensions of a tensor
//
// Shapes are always expressed in logical order, independent of how the data
// sits in memory. Convolution tensors are rank 4:
//   activations: [N, C, H, W]
//   weights:     [O, I, KH, KW]
// The physical ordering lives in the format tag (see `layout`), so two
// descriptors with the same Shape may still need a reorder between them.

/// N-dimensional logical shape of a tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape(Vec<usize>);

impl Shape {
    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Total number of elements (product of all dimensions).
    ///
    /// Assumes the product fits in `usize`; shapes built from untrusted
    /// sizes are validated with [`checked_elem_count`](Self::checked_elem_count).
    pub fn elem_count(&self) -> usize {
        self.0.iter().product()
    }

    /// Element count, or `None` if the product overflows `usize`.
    pub fn checked_elem_count(&self) -> Option<usize> {
        self.0.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
    }

    /// Strides of a dense buffer whose dimensions are laid out in `order`
    /// (outermost first). The result is indexed by logical dimension.
    ///
    /// For shape [2, 3, 4, 5] and order [0, 2, 3, 1] (channels last):
    ///   physical sizes are [2, 4, 5, 3], so the logical strides are
    ///   [60, 1, 15, 3].
    pub fn permuted_strides(&self, order: &[usize]) -> Vec<usize> {
        debug_assert_eq!(order.len(), self.rank());
        let mut strides = vec![0usize; self.rank()];
        let mut step = 1usize;
        for &d in order.iter().rev() {
            strides[d] = step;
            // Saturates only for empty shapes, whose strides are never used.
            step = step.saturating_mul(self.0[d]);
        }
        strides
    }

    /// Row-major strides, i.e. `permuted_strides` with the identity order.
    pub fn stride_contiguous(&self) -> Vec<usize> {
        let order: Vec<usize> = (0..self.rank()).collect();
        self.permuted_strides(&order)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, "]")
    }
}

impl From<(usize, usize, usize, usize)> for Shape {
    fn from((d0, d1, d2, d3): (usize, usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2, d3])
    }
}

impl From<Vec<usize>> for Shape {
    fn from(v: Vec<usize>) -> Self {
        Shape(v)
    }
}
