// CPU convolution kernels: im2col + GEMM
//
// Every pass is lowered to matrix products over an unrolled input:
//
//   columns[ci*kH*kW + ki*kW + kj, oh*W_out + ow]
//       = input[ci, oh*sH + ki - pH, ow*sW + kj - pW]   (0 outside the image)
//
//   forward           out[co, :]   = W[co, :] x columns
//   backward weights  dW[co, :]   += dY[co, :] x columns^T   (summed over batch)
//   backward data     columns      = W^T x dY, then col2im scatters back
//
// Operands are read and written through their logical strides, so the same
// kernels serve every plain format; a primitive's preferred format only
// changes how cache friendly those strided accesses are.
//
// The batch is split across rayon workers. Each worker owns its scratch
// buffers; results are scattered into the destination on the caller thread.

use rayon::prelude::*;

use ferret_core::error::{Error, Result};
use ferret_core::primitive::{ArgRole, ConvDesc, ExecArgs, Primitive, PrimitiveKind};
use ferret_core::shape::Shape;

/// Problem size of one convolution, taken from a primitive request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub n: usize,
    pub c_in: usize,
    pub h: usize,
    pub w: usize,
    pub c_out: usize,
    pub kh: usize,
    pub kw: usize,
    pub sh: usize,
    pub sw: usize,
    pub ph: usize,
    pub pw: usize,
    pub h_out: usize,
    pub w_out: usize,
}

impl Geometry {
    /// Validate the three operand shapes of `desc` against each other.
    pub fn from_desc(desc: &ConvDesc) -> Result<Self> {
        let (src, wei, dst) = (desc.src.shape(), desc.weights.shape(), desc.dst.shape());
        for (role, shape) in [("src", src), ("weights", wei), ("dst", dst)] {
            if shape.rank() != 4 {
                return Err(Error::unsupported(format!(
                    "{role} must be rank 4, got {shape}"
                )));
            }
        }
        let [n, c_in, h, w] = dims4(src);
        let [c_out, wc_in, kh, kw] = dims4(wei);
        let [sh, sw] = desc.strides;
        if sh == 0 || sw == 0 {
            return Err(Error::InvalidParams(format!(
                "strides must be positive, got {:?}",
                desc.strides
            )));
        }
        if wc_in != c_in {
            return Err(Error::ShapeMismatch {
                role: "weights",
                expected: Shape::from((c_out, c_in, kh, kw)),
                got: wei.clone(),
            });
        }

        for (role, shape) in [("src", src), ("weights", wei), ("dst", dst)] {
            if shape.checked_elem_count().is_none() {
                return Err(Error::InvalidParams(format!(
                    "{role} shape {shape} has too many elements"
                )));
            }
        }

        let h_out = out_size("height", h, kh, sh, desc.padding_l[0], desc.padding_r[0])?;
        let w_out = out_size("width", w, kw, sw, desc.padding_l[1], desc.padding_r[1])?;
        let expected = Shape::from((n, c_out, h_out, w_out));
        if dst != &expected {
            return Err(Error::ShapeMismatch {
                role: "dst",
                expected,
                got: dst.clone(),
            });
        }

        Ok(Geometry {
            n,
            c_in,
            h,
            w,
            c_out,
            kh,
            kw,
            sh,
            sw,
            ph: desc.padding_l[0],
            pw: desc.padding_l[1],
            h_out,
            w_out,
        })
    }

    fn col_rows(&self) -> usize {
        self.c_in * self.kh * self.kw
    }

    fn col_cols(&self) -> usize {
        self.h_out * self.w_out
    }
}

fn dims4(shape: &Shape) -> [usize; 4] {
    let d = shape.dims();
    [d[0], d[1], d[2], d[3]]
}

fn out_size(axis: &str, x: usize, k: usize, s: usize, pl: usize, pr: usize) -> Result<usize> {
    let padded = x
        .checked_add(pl)
        .and_then(|v| v.checked_add(pr))
        .ok_or_else(|| Error::InvalidParams(format!("padded {axis} overflows")))?;
    if k == 0 || k > padded {
        return Err(Error::InvalidParams(format!(
            "kernel {axis} {k} does not fit padded input {axis} {padded}"
        )));
    }
    Ok((padded - k) / s + 1)
}

/// Executable convolution for one pass and geometry.
pub struct ConvPrimitive {
    kind: PrimitiveKind,
    geom: Geometry,
    parallel: bool,
}

impl ConvPrimitive {
    pub fn new(kind: PrimitiveKind, geom: Geometry, parallel: bool) -> Self {
        ConvPrimitive {
            kind,
            geom,
            parallel,
        }
    }
}

impl Primitive for ConvPrimitive {
    fn name(&self) -> &str {
        match self.kind {
            PrimitiveKind::Forward(_) => "cpu-ref:conv_fwd:direct",
            PrimitiveKind::BackwardData => "cpu-ref:conv_bwd_data:direct",
            PrimitiveKind::BackwardWeights => "cpu-ref:conv_bwd_weights:direct",
        }
    }

    fn execute(&self, args: &ExecArgs) -> Result<()> {
        let [a_role, b_role, out_role] = match self.kind {
            PrimitiveKind::Forward(_) => [ArgRole::Src, ArgRole::Weights, ArgRole::Dst],
            PrimitiveKind::BackwardData => [ArgRole::Weights, ArgRole::DiffDst, ArgRole::DiffSrc],
            PrimitiveKind::BackwardWeights => {
                [ArgRole::Src, ArgRole::DiffDst, ArgRole::DiffWeights]
            }
        };
        let (a, b, out) = (args.get(a_role)?, args.get(b_role)?, args.get(out_role)?);
        if out.shares_buffer(a) || out.shares_buffer(b) {
            ferret_core::bail!("{out_role} aliases an input of {}", self.name());
        }

        let (a_data, b_data) = (a.read()?, b.read()?);
        let mut out_data = out.write()?;
        let a = (a_data.as_slice(), a.layout().strides4());
        let b = (b_data.as_slice(), b.layout().strides4());
        let out = (out_data.as_mut_slice(), out.layout().strides4());
        log::trace!("{}: {:?}", self.name(), self.geom);

        match self.kind {
            PrimitiveKind::Forward(_) => forward(&self.geom, self.parallel, a, b, out),
            PrimitiveKind::BackwardData => backward_data(&self.geom, self.parallel, a, b, out),
            PrimitiveKind::BackwardWeights => {
                backward_weights(&self.geom, self.parallel, a, b, out)
            }
        }
        Ok(())
    }
}

type View<'a> = (&'a [f32], [usize; 4]);
type ViewMut<'a> = (&'a mut [f32], [usize; 4]);

fn per_sample<T, F>(n: usize, parallel: bool, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(usize) -> T + Sync + Send,
{
    if parallel && n > 1 {
        (0..n).into_par_iter().map(f).collect()
    } else {
        (0..n).map(f).collect()
    }
}

/// Weights as a dense `[C_out, C_in*kH*kW]` matrix.
fn gather_weights(g: &Geometry, (wei, st): View<'_>) -> Vec<f32> {
    let mut wmat = Vec::with_capacity(g.c_out * g.col_rows());
    for co in 0..g.c_out {
        for ci in 0..g.c_in {
            for ki in 0..g.kh {
                for kj in 0..g.kw {
                    wmat.push(wei[co * st[0] + ci * st[1] + ki * st[2] + kj * st[3]]);
                }
            }
        }
    }
    wmat
}

/// One sample of an activation tensor as a dense `[C, H, W]` block.
fn gather_sample((data, st): View<'_>, ni: usize, c: usize, h: usize, w: usize) -> Vec<f32> {
    let mut out = Vec::with_capacity(c * h * w);
    for ci in 0..c {
        for y in 0..h {
            let row = ni * st[0] + ci * st[1] + y * st[2];
            out.extend((0..w).map(|x| data[row + x * st[3]]));
        }
    }
    out
}

fn scatter_sample(
    (data, st): &mut ViewMut<'_>,
    ni: usize,
    block: &[f32],
    c: usize,
    h: usize,
    w: usize,
) {
    let mut i = 0;
    for ci in 0..c {
        for y in 0..h {
            let row = ni * st[0] + ci * st[1] + y * st[2];
            for x in 0..w {
                data[row + x * st[3]] = block[i];
                i += 1;
            }
        }
    }
}

fn forward(g: &Geometry, parallel: bool, src: View<'_>, wei: View<'_>, mut dst: ViewMut<'_>) {
    let wmat = gather_weights(g, wei);
    let (rows, cols) = (g.col_rows(), g.col_cols());
    let outputs = per_sample(g.n, parallel, |ni| {
        let mut columns = vec![0.0f32; rows * cols];
        im2col(g, src, ni, &mut columns);
        let mut out = vec![0.0f32; g.c_out * cols];
        gemm(&wmat, &columns, &mut out, g.c_out, cols, rows);
        out
    });
    for (ni, out) in outputs.iter().enumerate() {
        scatter_sample(&mut dst, ni, out, g.c_out, g.h_out, g.w_out);
    }
}

fn backward_weights(
    g: &Geometry,
    parallel: bool,
    src: View<'_>,
    diff_dst: View<'_>,
    mut diff_wei: ViewMut<'_>,
) {
    let (rows, cols) = (g.col_rows(), g.col_cols());
    let partials = per_sample(g.n, parallel, |ni| {
        let mut columns = vec![0.0f32; rows * cols];
        im2col(g, src, ni, &mut columns);
        let go = gather_sample(diff_dst, ni, g.c_out, g.h_out, g.w_out);
        let mut grad = vec![0.0f32; g.c_out * rows];
        gemm_a_bt(&go, &columns, &mut grad, g.c_out, rows, cols);
        grad
    });

    let mut grad_w = vec![0.0f32; g.c_out * rows];
    for partial in &partials {
        for (acc, v) in grad_w.iter_mut().zip(partial) {
            *acc += v;
        }
    }

    let (data, st) = &mut diff_wei;
    let mut i = 0;
    for co in 0..g.c_out {
        for ci in 0..g.c_in {
            for ki in 0..g.kh {
                for kj in 0..g.kw {
                    data[co * st[0] + ci * st[1] + ki * st[2] + kj * st[3]] = grad_w[i];
                    i += 1;
                }
            }
        }
    }
}

fn backward_data(
    g: &Geometry,
    parallel: bool,
    wei: View<'_>,
    diff_dst: View<'_>,
    mut diff_src: ViewMut<'_>,
) {
    let wmat = gather_weights(g, wei);
    let (rows, cols) = (g.col_rows(), g.col_cols());
    let grads = per_sample(g.n, parallel, |ni| {
        let go = gather_sample(diff_dst, ni, g.c_out, g.h_out, g.w_out);
        let mut columns = vec![0.0f32; rows * cols];
        gemm_at_b(&wmat, &go, &mut columns, rows, cols, g.c_out);
        let mut img = vec![0.0f32; g.c_in * g.h * g.w];
        col2im(g, &columns, &mut img);
        img
    });
    for (ni, img) in grads.iter().enumerate() {
        scatter_sample(&mut diff_src, ni, img, g.c_in, g.h, g.w);
    }
}

/// Unroll the receptive fields of sample `ni` into `columns`
/// (`[C_in*kH*kW, H_out*W_out]`), reading the input through its strides.
fn im2col(g: &Geometry, (input, st): View<'_>, ni: usize, columns: &mut [f32]) {
    let cols = g.col_cols();
    let base = ni * st[0];
    for ci in 0..g.c_in {
        for ki in 0..g.kh {
            for kj in 0..g.kw {
                let row_offset = ((ci * g.kh + ki) * g.kw + kj) * cols;
                for oh in 0..g.h_out {
                    let ih = (oh * g.sh + ki) as isize - g.ph as isize;
                    for ow in 0..g.w_out {
                        let iw = (ow * g.sw + kj) as isize - g.pw as isize;
                        let inside =
                            ih >= 0 && (ih as usize) < g.h && iw >= 0 && (iw as usize) < g.w;
                        columns[row_offset + oh * g.w_out + ow] = if inside {
                            input[base + ci * st[1] + ih as usize * st[2] + iw as usize * st[3]]
                        } else {
                            0.0
                        };
                    }
                }
            }
        }
    }
}

/// Accumulate `columns` back into a dense `[C_in, H, W]` image.
fn col2im(g: &Geometry, columns: &[f32], img: &mut [f32]) {
    let cols = g.col_cols();
    for ci in 0..g.c_in {
        for ki in 0..g.kh {
            for kj in 0..g.kw {
                let row_offset = ((ci * g.kh + ki) * g.kw + kj) * cols;
                for oh in 0..g.h_out {
                    let ih = (oh * g.sh + ki) as isize - g.ph as isize;
                    if ih < 0 || ih as usize >= g.h {
                        continue;
                    }
                    for ow in 0..g.w_out {
                        let iw = (ow * g.sw + kj) as isize - g.pw as isize;
                        if iw >= 0 && (iw as usize) < g.w {
                            img[(ci * g.h + ih as usize) * g.w + iw as usize] +=
                                columns[row_offset + oh * g.w_out + ow];
                        }
                    }
                }
            }
        }
    }
}

/// C += A x B with A: [m, k], B: [k, n], C: [m, n], all row-major.
fn gemm(a: &[f32], b: &[f32], c: &mut [f32], m: usize, n: usize, k: usize) {
    for i in 0..m {
        let c_row = &mut c[i * n..(i + 1) * n];
        for p in 0..k {
            let a_val = a[i * k + p];
            for (cv, bv) in c_row.iter_mut().zip(&b[p * n..(p + 1) * n]) {
                *cv += a_val * bv;
            }
        }
    }
}

/// C += A^T x B with A: [k, m], B: [k, n], C: [m, n].
fn gemm_at_b(a: &[f32], b: &[f32], c: &mut [f32], m: usize, n: usize, k: usize) {
    for i in 0..m {
        let c_row = &mut c[i * n..(i + 1) * n];
        for p in 0..k {
            let a_val = a[p * m + i];
            for (cv, bv) in c_row.iter_mut().zip(&b[p * n..(p + 1) * n]) {
                *cv += a_val * bv;
            }
        }
    }
}

/// C += A x B^T with A: [m, k], B: [n, k], C: [m, n].
fn gemm_a_bt(a: &[f32], b: &[f32], c: &mut [f32], m: usize, n: usize, k: usize) {
    for i in 0..m {
        let a_row = &a[i * k..(i + 1) * k];
        for j in 0..n {
            let b_row = &b[j * k..(j + 1) * k];
            c[i * n + j] += a_row.iter().zip(b_row).map(|(x, y)| x * y).sum::<f32>();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferret_core::desc::TensorDesc;
    use ferret_core::error::ErrorKind;
    use ferret_core::primitive::{Algorithm, PropKind};

    type Dims = (usize, usize, usize, usize);

    fn request(src: Dims, wei: Dims, dst: Dims, s: usize, p: usize) -> ConvDesc {
        ConvDesc {
            kind: PrimitiveKind::Forward(PropKind::ForwardInference),
            algorithm: Algorithm::Direct,
            src: TensorDesc::any(src),
            weights: TensorDesc::any(wei),
            dst: TensorDesc::any(dst),
            strides: [s, s],
            padding_l: [p, p],
            padding_r: [p, p],
        }
    }

    #[test]
    fn test_geometry_same_padding() {
        let g = Geometry::from_desc(&request((2, 3, 5, 5), (4, 3, 3, 3), (2, 4, 5, 5), 1, 1))
            .unwrap();
        assert_eq!((g.h_out, g.w_out), (5, 5));
        assert_eq!(g.col_rows(), 27);
    }

    #[test]
    fn test_geometry_rejects_wrong_dst() {
        let err = Geometry::from_desc(&request((1, 1, 4, 4), (1, 1, 2, 2), (1, 1, 3, 3), 2, 0))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Shape);
    }

    #[test]
    fn test_geometry_rejects_channel_mismatch() {
        let err = Geometry::from_desc(&request((1, 2, 4, 4), (1, 3, 2, 2), (1, 1, 3, 3), 1, 0))
            .unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { role: "weights", .. }));
    }

    #[test]
    fn test_geometry_kernel_too_large_is_shape_error() {
        // kH = 6 > H + 2P = 4
        let err = Geometry::from_desc(&request((1, 1, 2, 2), (1, 1, 6, 6), (1, 1, 1, 1), 1, 1))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParams(_)));
        assert_eq!(err.kind(), ErrorKind::Shape);
    }

    #[test]
    fn test_geometry_overflow_is_shape_error() {
        let err = Geometry::from_desc(&request(
            (1, 1, 4, 4),
            (1, 1, 3, 3),
            (1, 1, 4, 4),
            1,
            usize::MAX / 2 + 1,
        ))
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Shape);

        let err = Geometry::from_desc(&request(
            (1 << 33, 1, 1 << 16, 1 << 16),
            (1, 1, 1, 1),
            (1 << 33, 1, 1 << 16, 1 << 16),
            1,
            0,
        ))
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Shape);
    }

    #[test]
    fn test_gemm_variants_agree() {
        // A: [2, 3], B: [3, 2]
        let a = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let b = [7.0, 8.0, 9.0, 10.0, 11.0, 12.0];
        let mut c = [0.0; 4];
        gemm(&a, &b, &mut c, 2, 2, 3);
        assert_eq!(c, [58.0, 64.0, 139.0, 154.0]);

        // A^T stored as [3, 2]
        let at = [1.0, 4.0, 2.0, 5.0, 3.0, 6.0];
        let mut c2 = [0.0; 4];
        gemm_at_b(&at, &b, &mut c2, 2, 2, 3);
        assert_eq!(c2, c);

        // B^T stored as [2, 3]
        let bt = [7.0, 9.0, 11.0, 8.0, 10.0, 12.0];
        let mut c3 = [0.0; 4];
        gemm_a_bt(&a, &bt, &mut c3, 2, 2, 3);
        assert_eq!(c3, c);
    }

    #[test]
    fn test_forward_known_values() {
        // 1x1x3x3 input, 1x1x2x2 all-ones kernel, no padding -> 2x2 window sums
        let g = Geometry::from_desc(&request((1, 1, 3, 3), (1, 1, 2, 2), (1, 1, 2, 2), 1, 0))
            .unwrap();
        let input: Vec<f32> = (1..=9).map(|v| v as f32).collect();
        let weights = vec![1.0f32; 4];
        let mut out = vec![0.0f32; 4];
        forward(
            &g,
            false,
            (input.as_slice(), [9, 9, 3, 1]),
            (weights.as_slice(), [4, 4, 2, 1]),
            (out.as_mut_slice(), [4, 4, 2, 1]),
        );
        assert_eq!(out, vec![12.0, 16.0, 24.0, 28.0]);
    }

    #[test]
    fn test_col2im_inverts_im2col_counts() {
        // With an all-ones image, col2im(im2col(x)) counts how many windows
        // cover each pixel.
        let g = Geometry::from_desc(&request((1, 1, 3, 3), (1, 1, 2, 2), (1, 1, 2, 2), 1, 0))
            .unwrap();
        let ones = vec![1.0f32; 9];
        let mut columns = vec![0.0f32; g.col_rows() * g.col_cols()];
        im2col(&g, (ones.as_slice(), [9, 9, 3, 1]), 0, &mut columns);
        let mut img = vec![0.0f32; 9];
        col2im(&g, &columns, &mut img);
        assert_eq!(img, vec![1.0, 2.0, 1.0, 2.0, 4.0, 2.0, 1.0, 2.0, 1.0]);
    }
}
