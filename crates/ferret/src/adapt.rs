// Layout adaptation
//
// The caller's tensors are always canonical (nhwc / hwio) while a primitive
// wants whatever layout its kernel library chose. These two functions bridge
// that gap: when descriptors already agree the handle itself is used, so a
// library that prefers canonical layouts costs no allocation and no copy.
// Decisions are made per call from the descriptors alone.

use crate::context::ExecutionContext;
use ferret_core::desc::TensorDesc;
use ferret_core::error::Result;
use ferret_core::kernel::KernelLibrary;
use ferret_core::memory::Memory;

/// Produce a handle in `desired` holding the values of `handle`.
///
/// Returns an alias of `handle` when its descriptor already equals `desired`;
/// otherwise allocates a temporary and enqueues a reorder into it. The source
/// is never modified.
pub fn adapt<L: KernelLibrary + ?Sized>(
    handle: &Memory,
    desired: &TensorDesc,
    ctx: &mut ExecutionContext<'_, L>,
) -> Result<Memory> {
    if handle.desc() == desired {
        log::trace!("zero-copy: {} already matches", desired);
        return Ok(handle.clone());
    }
    let library = ctx.library();
    let working = library.allocate(ctx.engine(), desired)?;
    log::debug!("reorder {} -> {}", handle.desc(), desired);
    let task = library.reorder(handle, &working)?;
    ctx.enqueue(task);
    Ok(working)
}

/// Make a primitive's output visible in the caller's canonical handle.
///
/// When `working` is the canonical buffer itself (the output was aliased)
/// nothing is queued; otherwise a reorder into `canonical` is enqueued.
pub fn adapt_back<L: KernelLibrary + ?Sized>(
    working: &Memory,
    canonical: &Memory,
    ctx: &mut ExecutionContext<'_, L>,
) -> Result<Memory> {
    if working.shares_buffer(canonical) {
        log::trace!("zero-copy: result already in {}", canonical.desc());
        return Ok(canonical.clone());
    }
    log::debug!("reorder back {} -> {}", working.desc(), canonical.desc());
    let task = ctx.library().reorder(working, canonical)?;
    ctx.enqueue(task);
    Ok(canonical.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferret_core::dtype::DType;
    use ferret_core::layout::FormatTag;
    use ferret_core::shape::Shape;
    use ferret_cpu::CpuKernelLibrary;

    fn nhwc(shape: (usize, usize, usize, usize)) -> TensorDesc {
        TensorDesc::new(shape, DType::F32, FormatTag::Nhwc)
    }

    fn filled(lib: &CpuKernelLibrary, desc: &TensorDesc) -> Memory {
        let mem = lib.allocate(&lib.engine(0).unwrap(), desc).unwrap();
        let data: Vec<f32> = (0..desc.elem_count()).map(|i| i as f32).collect();
        mem.write_from_host(&data).unwrap();
        mem
    }

    #[test]
    fn test_matching_desc_aliases() {
        let lib = CpuKernelLibrary::new();
        let desc = nhwc((1, 2, 3, 3));
        let handle = filled(&lib, &desc);
        let mut ctx = ExecutionContext::create(&lib, 0).unwrap();

        let once = adapt(&handle, &desc, &mut ctx).unwrap();
        let twice = adapt(&once, &desc, &mut ctx).unwrap();
        assert!(twice.shares_buffer(&handle));
        assert_eq!(twice, handle);
        assert_eq!(ctx.pending(), 0);
        ctx.wait().unwrap();
    }

    #[test]
    fn test_differing_desc_reorders() {
        let lib = CpuKernelLibrary::new();
        let src_desc = nhwc((1, 2, 2, 3));
        let handle = filled(&lib, &src_desc);
        let want = src_desc.with_format(FormatTag::Nchw);

        let mut ctx = ExecutionContext::create(&lib, 0).unwrap();
        let working = adapt(&handle, &want, &mut ctx).unwrap();
        assert!(!working.shares_buffer(&handle));
        assert_eq!(working.desc(), &want);
        assert_eq!(ctx.pending(), 1);
        ctx.wait().unwrap();

        // Logical element (n, c, h, w) must agree between the two layouts.
        let src = handle.read().unwrap();
        let dst = working.read().unwrap();
        let (sl, dl) = (handle.layout(), working.layout());
        for c in 0..2 {
            for h in 0..2 {
                for w in 0..3 {
                    let idx = [0, c, h, w];
                    assert_eq!(src[sl.flat_index(&idx)], dst[dl.flat_index(&idx)]);
                }
            }
        }
        // Source untouched.
        let expect: Vec<f32> = (0..12).map(|i| i as f32).collect();
        assert_eq!(src.as_slice(), expect.as_slice());
    }

    #[test]
    fn test_adapt_back_round_trip() {
        let lib = CpuKernelLibrary::new();
        let canon_desc = nhwc((2, 3, 2, 2));
        let original = filled(&lib, &canon_desc);
        let canonical = lib
            .allocate(&lib.engine(0).unwrap(), &canon_desc)
            .unwrap();

        let mut ctx = ExecutionContext::create(&lib, 0).unwrap();
        let working = adapt(&original, &canon_desc.with_format(FormatTag::Nchw), &mut ctx).unwrap();
        let result = adapt_back(&working, &canonical, &mut ctx).unwrap();
        assert_eq!(ctx.pending(), 2);
        ctx.wait().unwrap();

        assert!(result.shares_buffer(&canonical));
        let mut a = vec![0.0; canon_desc.elem_count()];
        let mut b = vec![0.0; canon_desc.elem_count()];
        original.read_to_host(&mut a).unwrap();
        result.read_to_host(&mut b).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_adapt_back_aliased_output_is_free() {
        let lib = CpuKernelLibrary::new();
        let desc = nhwc((1, 1, 2, 2));
        let canonical = filled(&lib, &desc);
        let mut ctx = ExecutionContext::create(&lib, 0).unwrap();
        let result = adapt_back(&canonical.clone(), &canonical, &mut ctx).unwrap();
        assert!(result.shares_buffer(&canonical));
        assert_eq!(ctx.pending(), 0);
        ctx.wait().unwrap();
        assert_eq!(result.desc().shape(), &Shape::from((1, 1, 2, 2)));
    }
}
