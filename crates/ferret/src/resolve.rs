// Shape resolution
//
// Every driver call starts here: the scalar parameters become the three
// logical shapes of the problem, and the same shapes describe both a tensor
// and its gradient. The output size follows
//
//   NH = floor((H - K + 2P) / S) + 1        (NW likewise on W)
//
// with a true floor, so a kernel that overhangs the padded input by less
// than one stride still yields a non-positive size and is rejected.

use ferret_core::desc::TensorDesc;
use ferret_core::dtype::DType;
use ferret_core::error::{Error, Result};
use ferret_core::layout::FormatTag;
use ferret_core::primitive::{Algorithm, ConvDesc, PrimitiveKind};
use ferret_core::shape::Shape;

/// Scalar parameters of a square convolution with symmetric stride and padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConvParams {
    pub n: usize,
    pub h: usize,
    pub w: usize,
    pub c_in: usize,
    pub c_out: usize,
    /// Kernel size (K x K).
    pub k: usize,
    /// Stride on both spatial axes.
    pub s: usize,
    /// Zero padding on every side.
    pub p: usize,
}

impl ConvParams {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        n: usize,
        h: usize,
        w: usize,
        c_in: usize,
        c_out: usize,
        k: usize,
        s: usize,
        p: usize,
    ) -> Self {
        ConvParams {
            n,
            h,
            w,
            c_in,
            c_out,
            k,
            s,
            p,
        }
    }
}

/// Logical shapes of one convolution problem.
///
/// `input` is `[N, C_in, H, W]`, `weight` is `[C_out, C_in, K, K]`,
/// `output` is `[N, C_out, NH, NW]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvShapes {
    pub input: Shape,
    pub weight: Shape,
    pub output: Shape,
    pub strides: [usize; 2],
    pub padding: [usize; 2],
}

impl ConvShapes {
    /// Canonical (nhwc) descriptor of the input and of its gradient.
    pub fn input_desc(&self) -> TensorDesc {
        TensorDesc::new(self.input.clone(), DType::F32, FormatTag::Nhwc)
    }

    /// Canonical (hwio) descriptor of the weights and of their gradient.
    pub fn weight_desc(&self) -> TensorDesc {
        TensorDesc::new(self.weight.clone(), DType::F32, FormatTag::Hwio)
    }

    /// Canonical (nhwc) descriptor of the output and of its gradient.
    pub fn output_desc(&self) -> TensorDesc {
        TensorDesc::new(self.output.clone(), DType::F32, FormatTag::Nhwc)
    }

    /// Spatial output size `(NH, NW)`.
    pub fn output_hw(&self) -> (usize, usize) {
        let d = self.output.dims();
        (d[2], d[3])
    }

    /// A primitive request with every operand left to the kernel library.
    pub fn request(&self, kind: PrimitiveKind, algorithm: Algorithm) -> ConvDesc {
        ConvDesc {
            kind,
            algorithm,
            src: TensorDesc::any(self.input.clone()),
            weights: TensorDesc::any(self.weight.clone()),
            dst: TensorDesc::any(self.output.clone()),
            strides: self.strides,
            padding_l: self.padding,
            padding_r: self.padding,
        }
    }
}

/// `floor((x - k + 2p) / s) + 1`, rejecting non-positive results.
pub fn output_size(axis: &'static str, x: usize, k: usize, s: usize, p: usize) -> Result<usize> {
    if s == 0 {
        return Err(Error::InvalidParams(format!("{axis} stride must be positive")));
    }
    if k == 0 {
        return Err(Error::InvalidParams("kernel size must be positive".into()));
    }
    let overflow = || Error::InvalidParams(format!("{axis} size arithmetic overflows"));
    let as_i64 = |v: usize| i64::try_from(v).map_err(|_| overflow());
    let (x_i, k_i, s_i, p_i) = (as_i64(x)?, as_i64(k)?, as_i64(s)?, as_i64(p)?);
    let span = p_i
        .checked_mul(2)
        .and_then(|pad| x_i.checked_add(pad))
        .and_then(|padded| padded.checked_sub(k_i))
        .ok_or_else(overflow)?;
    let size = span.div_euclid(s_i) + 1;
    if size <= 0 {
        return Err(Error::NonPositiveOutput {
            axis,
            input: x,
            kernel: k,
            stride: s,
            padding: p,
            size,
        });
    }
    usize::try_from(size).map_err(|_| overflow())
}

/// Derive the input, weight and output shapes of `params`.
///
/// Every shape's element count is checked to fit in `usize`, so later code
/// may use [`Shape::elem_count`] freely.
pub fn resolve(params: &ConvParams) -> Result<ConvShapes> {
    let ConvParams {
        n,
        h,
        w,
        c_in,
        c_out,
        k,
        s,
        p,
    } = *params;
    let nh = output_size("height", h, k, s, p)?;
    let nw = output_size("width", w, k, s, p)?;
    let shapes = ConvShapes {
        input: Shape::from((n, c_in, h, w)),
        weight: Shape::from((c_out, c_in, k, k)),
        output: Shape::from((n, c_out, nh, nw)),
        strides: [s, s],
        padding: [p, p],
    };
    for (role, shape) in [
        ("input", &shapes.input),
        ("weight", &shapes.weight),
        ("output", &shapes.output),
    ] {
        if shape.checked_elem_count().is_none() {
            return Err(Error::InvalidParams(format!(
                "{role} shape {shape} has too many elements"
            )));
        }
    }
    Ok(shapes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferret_core::error::ErrorKind;
    use ferret_core::primitive::PropKind;

    #[test]
    fn test_same_padding_keeps_size() {
        // H=5, K=3, S=1, P=1 -> 5
        assert_eq!(output_size("height", 5, 3, 1, 1).unwrap(), 5);
    }

    #[test]
    fn test_strided_halves() {
        // H=4, K=2, S=2, P=0 -> 2
        assert_eq!(output_size("height", 4, 2, 2, 0).unwrap(), 2);
    }

    #[test]
    fn test_floor_division() {
        // (7 - 3 + 0) / 2 = 2 -> 3
        assert_eq!(output_size("width", 7, 3, 2, 0).unwrap(), 3);
        // (2 - 5 + 2) = -1, floor(-1 / 2) = -1 -> 0: rejected even though
        // truncating division would report 1.
        let err = output_size("width", 2, 5, 2, 1).unwrap_err();
        assert!(matches!(err, Error::NonPositiveOutput { size: 0, .. }));
    }

    #[test]
    fn test_kernel_larger_than_padded_input() {
        // K > H + 2P
        let err = resolve(&ConvParams::new(1, 3, 3, 1, 1, 6, 1, 1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Shape);
    }

    #[test]
    fn test_zero_stride_and_kernel() {
        let err = output_size("height", 4, 2, 0, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Shape);
        let err = output_size("height", 4, 0, 1, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Shape);
    }

    #[test]
    fn test_huge_padding_is_shape_error() {
        let err = resolve(&ConvParams::new(1, 4, 4, 1, 1, 3, 1, usize::MAX / 2)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Shape);
        let err = output_size("height", usize::MAX, 1, 1, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Shape);
    }

    #[test]
    fn test_element_count_overflow_is_shape_error() {
        let err = resolve(&ConvParams::new(1 << 33, 1 << 16, 1 << 16, 1, 1, 1, 1, 0)).unwrap_err();
        assert!(matches!(err, Error::InvalidParams(_)));
        assert_eq!(err.kind(), ErrorKind::Shape);
    }

    #[test]
    fn test_resolve_shapes() {
        let shapes = resolve(&ConvParams::new(2, 5, 7, 3, 4, 3, 2, 1)).unwrap();
        assert_eq!(shapes.input, Shape::from((2, 3, 5, 7)));
        assert_eq!(shapes.weight, Shape::from((4, 3, 3, 3)));
        // NH = (5 - 3 + 2) / 2 + 1 = 3, NW = (7 - 3 + 2) / 2 + 1 = 4
        assert_eq!(shapes.output, Shape::from((2, 4, 3, 4)));
        assert_eq!(shapes.output_hw(), (3, 4));
        assert_eq!(shapes.output_desc().format(), FormatTag::Nhwc);
        assert_eq!(shapes.weight_desc().format(), FormatTag::Hwio);
    }

    #[test]
    fn test_request_leaves_formats_open() {
        let shapes = resolve(&ConvParams::new(1, 4, 4, 2, 2, 3, 1, 1)).unwrap();
        let req = shapes.request(
            PrimitiveKind::Forward(PropKind::ForwardInference),
            Algorithm::Direct,
        );
        assert!(!req.src.is_resolved());
        assert!(!req.weights.is_resolved());
        assert!(!req.dst.is_resolved());
        assert_eq!(req.dst.shape(), &shapes.output);
        assert_eq!(req.padding_l, [1, 1]);
        assert_eq!(req.padding_r, [1, 1]);
    }
}
