use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::desc::TensorDesc;
use crate::error::{Error, Result};
use crate::memory::Memory;
use crate::stream::Task;

// Primitive descriptors
//
// A ConvDesc is the request handed to a kernel library: which pass, which
// algorithm, one descriptor per operand slot (possibly `any`), and the
// stride/padding geometry. The library answers with a PrimitiveDesc whose
// operand descriptors are all resolved, plus the executable object.
//
// The three operand slots keep their positions across passes, only their
// roles change:
//
//   pass              slot 0     slot 1        slot 2
//   forward           Src        Weights       Dst
//   backward data     DiffSrc    Weights       DiffDst
//   backward weights  Src        DiffWeights   DiffDst

/// Forward propagation flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropKind {
    ForwardInference,
    ForwardTraining,
}

/// Which convolution pass a primitive computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveKind {
    Forward(PropKind),
    BackwardData,
    BackwardWeights,
}

impl PrimitiveKind {
    pub fn is_forward(&self) -> bool {
        matches!(self, PrimitiveKind::Forward(_))
    }

    /// Argument role of each operand slot.
    pub fn roles(&self) -> [ArgRole; 3] {
        match self {
            PrimitiveKind::Forward(_) => [ArgRole::Src, ArgRole::Weights, ArgRole::Dst],
            PrimitiveKind::BackwardData => [ArgRole::DiffSrc, ArgRole::Weights, ArgRole::DiffDst],
            PrimitiveKind::BackwardWeights => {
                [ArgRole::Src, ArgRole::DiffWeights, ArgRole::DiffDst]
            }
        }
    }

    /// The role the primitive writes.
    pub fn output_role(&self) -> ArgRole {
        match self {
            PrimitiveKind::Forward(_) => ArgRole::Dst,
            PrimitiveKind::BackwardData => ArgRole::DiffSrc,
            PrimitiveKind::BackwardWeights => ArgRole::DiffWeights,
        }
    }
}

impl fmt::Display for PrimitiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrimitiveKind::Forward(PropKind::ForwardInference) => write!(f, "forward_inference"),
            PrimitiveKind::Forward(PropKind::ForwardTraining) => write!(f, "forward_training"),
            PrimitiveKind::BackwardData => write!(f, "backward_data"),
            PrimitiveKind::BackwardWeights => write!(f, "backward_weights"),
        }
    }
}

/// Convolution algorithm requested from the kernel library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    Direct,
    Winograd,
}

/// Role of a memory argument passed to a primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgRole {
    Src,
    Weights,
    Dst,
    DiffSrc,
    DiffWeights,
    DiffDst,
}

impl ArgRole {
    pub fn name(&self) -> &'static str {
        match self {
            ArgRole::Src => "src",
            ArgRole::Weights => "weights",
            ArgRole::Dst => "dst",
            ArgRole::DiffSrc => "diff_src",
            ArgRole::DiffWeights => "diff_weights",
            ArgRole::DiffDst => "diff_dst",
        }
    }
}

impl fmt::Display for ArgRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Convolution primitive request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvDesc {
    pub kind: PrimitiveKind,
    pub algorithm: Algorithm,
    /// Slot 0: src or diff_src.
    pub src: TensorDesc,
    /// Slot 1: weights or diff_weights.
    pub weights: TensorDesc,
    /// Slot 2: dst or diff_dst.
    pub dst: TensorDesc,
    pub strides: [usize; 2],
    pub padding_l: [usize; 2],
    pub padding_r: [usize; 2],
}

impl ConvDesc {
    /// Descriptor bound to `role`, if this pass uses that role.
    pub fn desc(&self, role: ArgRole) -> Option<&TensorDesc> {
        let slot = self.kind.roles().iter().position(|r| *r == role)?;
        Some(match slot {
            0 => &self.src,
            1 => &self.weights,
            _ => &self.dst,
        })
    }

    /// Whether two requests describe the same problem, ignoring pass and formats.
    pub fn same_geometry(&self, other: &ConvDesc) -> bool {
        self.src.shape() == other.src.shape()
            && self.weights.shape() == other.weights.shape()
            && self.dst.shape() == other.dst.shape()
            && self.strides == other.strides
            && self.padding_l == other.padding_l
            && self.padding_r == other.padding_r
    }
}

/// Executable object produced by a kernel library.
pub trait Primitive: Send + Sync {
    fn name(&self) -> &str;

    /// Run the computation. Arguments have already been checked against the
    /// primitive's descriptors.
    fn execute(&self, args: &ExecArgs) -> Result<()>;
}

/// Memory arguments of one primitive execution, keyed by role.
#[derive(Debug, Clone, Default)]
pub struct ExecArgs {
    args: HashMap<ArgRole, Memory>,
}

impl ExecArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, role: ArgRole, memory: Memory) -> Self {
        self.args.insert(role, memory);
        self
    }

    pub fn insert(&mut self, role: ArgRole, memory: Memory) {
        self.args.insert(role, memory);
    }

    pub fn get(&self, role: ArgRole) -> Result<&Memory> {
        self.args
            .get(&role)
            .ok_or_else(|| Error::execution(format!("missing {role} argument")))
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }
}

/// A built primitive: resolved operand descriptors plus the executable.
#[derive(Clone)]
pub struct PrimitiveDesc {
    conv: ConvDesc,
    executable: Arc<dyn Primitive>,
}

impl PrimitiveDesc {
    /// Pair a fully resolved request with its executable.
    pub fn new(conv: ConvDesc, executable: Arc<dyn Primitive>) -> Result<Self> {
        for role in conv.kind.roles() {
            if let Some(d) = conv.desc(role) {
                if !d.is_resolved() {
                    return Err(Error::UnresolvedFormat {
                        format: d.format(),
                    });
                }
            }
        }
        Ok(PrimitiveDesc { conv, executable })
    }

    pub fn kind(&self) -> PrimitiveKind {
        self.conv.kind
    }

    pub fn conv(&self) -> &ConvDesc {
        &self.conv
    }

    pub fn name(&self) -> &str {
        self.executable.name()
    }

    /// Preferred descriptor for `role`.
    pub fn desc(&self, role: ArgRole) -> Result<&TensorDesc> {
        self.conv.desc(role).ok_or_else(|| {
            Error::unsupported(format!("{} primitive has no {role} operand", self.conv.kind))
        })
    }

    pub fn src_desc(&self) -> &TensorDesc {
        &self.conv.src
    }

    pub fn weights_desc(&self) -> &TensorDesc {
        &self.conv.weights
    }

    pub fn dst_desc(&self) -> &TensorDesc {
        &self.conv.dst
    }

    /// Check `args` against the resolved descriptors and wrap the execution
    /// into a task for a stream.
    pub fn bind(&self, args: ExecArgs) -> Result<Task> {
        for role in self.conv.kind.roles() {
            let expected = self.desc(role)?;
            let got = args.get(role)?.desc();
            if got != expected {
                return Err(Error::execution(format!(
                    "{role} argument is {got}, primitive expects {expected}"
                )));
            }
        }
        let executable = self.executable.clone();
        Ok(Box::new(move || executable.execute(&args)))
    }
}

impl fmt::Debug for PrimitiveDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrimitiveDesc")
            .field("name", &self.executable.name())
            .field("conv", &self.conv)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;
    use crate::error::ErrorKind;
    use crate::layout::FormatTag;
    use crate::stream::Engine;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingPrimitive(AtomicUsize);

    impl Primitive for CountingPrimitive {
        fn name(&self) -> &str {
            "counting"
        }

        fn execute(&self, _args: &ExecArgs) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn request(kind: PrimitiveKind, format: FormatTag, wformat: FormatTag) -> ConvDesc {
        ConvDesc {
            kind,
            algorithm: Algorithm::Direct,
            src: TensorDesc::new((1, 2, 4, 4), DType::F32, format),
            weights: TensorDesc::new((3, 2, 3, 3), DType::F32, wformat),
            dst: TensorDesc::new((1, 3, 2, 2), DType::F32, format),
            strides: [1, 1],
            padding_l: [0, 0],
            padding_r: [0, 0],
        }
    }

    #[test]
    fn test_roles_per_pass() {
        let bwd = request(PrimitiveKind::BackwardData, FormatTag::Any, FormatTag::Any);
        assert_eq!(bwd.desc(ArgRole::DiffSrc), Some(&bwd.src));
        assert_eq!(bwd.desc(ArgRole::DiffDst), Some(&bwd.dst));
        assert!(bwd.desc(ArgRole::Src).is_none());
        assert_eq!(
            PrimitiveKind::BackwardWeights.output_role(),
            ArgRole::DiffWeights
        );
    }

    #[test]
    fn test_unresolved_descs_rejected() {
        let conv = request(
            PrimitiveKind::Forward(PropKind::ForwardInference),
            FormatTag::Any,
            FormatTag::Oihw,
        );
        let prim = Arc::new(CountingPrimitive(AtomicUsize::new(0)));
        let err = PrimitiveDesc::new(conv, prim).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedLayout);
    }

    #[test]
    fn test_bind_checks_descs_and_runs() {
        let conv = request(
            PrimitiveKind::Forward(PropKind::ForwardInference),
            FormatTag::Nchw,
            FormatTag::Oihw,
        );
        let prim = Arc::new(CountingPrimitive(AtomicUsize::new(0)));
        let pd = PrimitiveDesc::new(conv.clone(), prim.clone()).unwrap();
        let engine = Engine::cpu(0);
        let src = Memory::allocate(&engine, &conv.src).unwrap();
        let wei = Memory::allocate(&engine, &conv.weights).unwrap();
        let dst = Memory::allocate(&engine, &conv.dst).unwrap();

        // dst in the wrong format
        let wrong = Memory::allocate(&engine, &conv.dst.with_format(FormatTag::Nhwc)).unwrap();
        let args = ExecArgs::new()
            .with(ArgRole::Src, src.clone())
            .with(ArgRole::Weights, wei.clone())
            .with(ArgRole::Dst, wrong);
        assert_eq!(pd.bind(args).err().map(|e| e.kind()), Some(ErrorKind::Execution));

        let args = ExecArgs::new()
            .with(ArgRole::Src, src)
            .with(ArgRole::Weights, wei)
            .with(ArgRole::Dst, dst);
        let task = pd.bind(args).unwrap();
        assert_eq!(prim.0.load(Ordering::SeqCst), 0);
        task().unwrap();
        assert_eq!(prim.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_missing_argument() {
        let args = ExecArgs::new();
        assert!(args.get(ArgRole::DiffDst).is_err());
        assert!(args.is_empty());
    }
}
