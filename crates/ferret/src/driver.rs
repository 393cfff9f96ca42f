// Convolution drivers
//
// The three passes share one pipeline and differ only in which caller
// tensors feed which primitive roles:
//
//   pass              reads                         writes
//   forward           Src <- input, Weights <- wt   Dst -> output
//   backward weights  Src <- input, DiffDst <- out  DiffWeights -> wt
//   backward input    Weights <- wt, DiffDst <- out DiffSrc -> input
//
// A pass is described by a `ConvStrategy`; `Driver::run` executes any of
// them:
//
//   resolve shapes -> create context -> upload caller tensors
//     -> (forward hint) -> build primitive -> adapt inputs
//     -> alias or allocate output -> execute -> adapt back -> wait -> download
//
// Caller tensors are always canonical: activations nhwc, weights hwio.

use std::fmt;

use crate::adapt::{adapt, adapt_back};
use crate::context::ExecutionContext;
use crate::resolve::{resolve, ConvParams, ConvShapes};
use ferret_core::desc::TensorDesc;
use ferret_core::error::{Error, Result};
use ferret_core::kernel::KernelLibrary;
use ferret_core::memory::Memory;
use ferret_core::primitive::{
    Algorithm, ArgRole, ExecArgs, PrimitiveDesc, PrimitiveKind, PropKind,
};
use ferret_core::stream::Engine;

// Operations and strategies

/// The three convolution passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Forward,
    BackwardWeights,
    BackwardInput,
}

impl OperationKind {
    pub const ALL: [OperationKind; 3] = [
        OperationKind::Forward,
        OperationKind::BackwardWeights,
        OperationKind::BackwardInput,
    ];

    /// The strategy describing this pass.
    pub fn strategy(&self) -> &'static dyn ConvStrategy {
        match self {
            OperationKind::Forward => &ForwardStrategy,
            OperationKind::BackwardWeights => &BackwardWeightsStrategy,
            OperationKind::BackwardInput => &BackwardInputStrategy,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Forward => write!(f, "forward"),
            OperationKind::BackwardWeights => write!(f, "backward_weights"),
            OperationKind::BackwardInput => write!(f, "backward_input"),
        }
    }
}

/// One of the three caller-side tensors of a convolution problem.
///
/// A value tensor and its gradient share an operand: the output slot carries
/// the output in forward and the output gradient in both backward passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operand {
    Input,
    Weight,
    Output,
}

impl Operand {
    /// Canonical descriptor of this operand.
    pub fn canonical(&self, shapes: &ConvShapes) -> TensorDesc {
        match self {
            Operand::Input => shapes.input_desc(),
            Operand::Weight => shapes.weight_desc(),
            Operand::Output => shapes.output_desc(),
        }
    }
}

/// Ties a primitive argument role to a caller operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub role: ArgRole,
    pub operand: Operand,
}

impl Binding {
    pub const fn new(role: ArgRole, operand: Operand) -> Self {
        Binding { role, operand }
    }
}

/// What distinguishes one convolution pass from another.
pub trait ConvStrategy: Send + Sync {
    fn operation(&self) -> OperationKind;

    /// The primitive this pass builds.
    fn primitive_kind(&self) -> PrimitiveKind;

    /// The two caller tensors read by the pass, in argument order.
    fn inputs(&self) -> [Binding; 2];

    /// The caller tensor written by the pass.
    fn output(&self) -> Binding;

    /// Backward primitives are built against a forward hint.
    fn needs_hint(&self) -> bool {
        !self.primitive_kind().is_forward()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ForwardStrategy;

impl ConvStrategy for ForwardStrategy {
    fn operation(&self) -> OperationKind {
        OperationKind::Forward
    }

    fn primitive_kind(&self) -> PrimitiveKind {
        PrimitiveKind::Forward(PropKind::ForwardInference)
    }

    fn inputs(&self) -> [Binding; 2] {
        [
            Binding::new(ArgRole::Src, Operand::Input),
            Binding::new(ArgRole::Weights, Operand::Weight),
        ]
    }

    fn output(&self) -> Binding {
        Binding::new(ArgRole::Dst, Operand::Output)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BackwardWeightsStrategy;

impl ConvStrategy for BackwardWeightsStrategy {
    fn operation(&self) -> OperationKind {
        OperationKind::BackwardWeights
    }

    fn primitive_kind(&self) -> PrimitiveKind {
        PrimitiveKind::BackwardWeights
    }

    fn inputs(&self) -> [Binding; 2] {
        [
            Binding::new(ArgRole::Src, Operand::Input),
            Binding::new(ArgRole::DiffDst, Operand::Output),
        ]
    }

    fn output(&self) -> Binding {
        Binding::new(ArgRole::DiffWeights, Operand::Weight)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BackwardInputStrategy;

impl ConvStrategy for BackwardInputStrategy {
    fn operation(&self) -> OperationKind {
        OperationKind::BackwardInput
    }

    fn primitive_kind(&self) -> PrimitiveKind {
        PrimitiveKind::BackwardData
    }

    fn inputs(&self) -> [Binding; 2] {
        [
            Binding::new(ArgRole::Weights, Operand::Weight),
            Binding::new(ArgRole::DiffDst, Operand::Output),
        ]
    }

    fn output(&self) -> Binding {
        Binding::new(ArgRole::DiffSrc, Operand::Input)
    }
}

// Configuration

/// Settings applied to every call made through a [`Driver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverConfig {
    /// Engine acquired for each call.
    pub engine_index: usize,
    /// Algorithm requested for every primitive.
    pub algorithm: Algorithm,
    /// Prop kind of the forward primitive that hints backward construction.
    pub hint_prop_kind: PropKind,
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig {
            engine_index: 0,
            algorithm: Algorithm::Direct,
            hint_prop_kind: PropKind::ForwardInference,
        }
    }
}

impl DriverConfig {
    pub fn with_engine_index(mut self, engine_index: usize) -> Self {
        self.engine_index = engine_index;
        self
    }

    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn with_hint_prop_kind(mut self, prop_kind: PropKind) -> Self {
        self.hint_prop_kind = prop_kind;
        self
    }
}

// Driver

/// Runs convolution passes on a kernel library.
///
/// A driver holds no per-call state; one instance may serve calls from many
/// threads at once, each call owning its own context and temporaries.
pub struct Driver<'l, L: KernelLibrary + ?Sized> {
    library: &'l L,
    config: DriverConfig,
}

impl<'l, L: KernelLibrary + ?Sized> Driver<'l, L> {
    pub fn new(library: &'l L) -> Self {
        Self::with_config(library, DriverConfig::default())
    }

    pub fn with_config(library: &'l L, config: DriverConfig) -> Self {
        Driver { library, config }
    }

    /// Compute `output = conv(input, weight)`.
    ///
    /// `input` is nhwc `[N, C_in, H, W]`, `weight` is hwio `[C_out, C_in, K, K]`,
    /// `output` is nhwc `[N, C_out, NH, NW]`.
    pub fn forward(
        &self,
        params: &ConvParams,
        input: &[f32],
        weight: &[f32],
        output: &mut [f32],
    ) -> Result<()> {
        self.run(OperationKind::Forward, params, [input, weight], output)
    }

    /// Compute the weight gradient from `input` and the output gradient.
    pub fn backward_weights(
        &self,
        params: &ConvParams,
        input: &[f32],
        output_diff: &[f32],
        weight_diff: &mut [f32],
    ) -> Result<()> {
        self.run(
            OperationKind::BackwardWeights,
            params,
            [input, output_diff],
            weight_diff,
        )
    }

    /// Compute the input gradient from `weight` and the output gradient.
    pub fn backward_input(
        &self,
        params: &ConvParams,
        weight: &[f32],
        output_diff: &[f32],
        input_diff: &mut [f32],
    ) -> Result<()> {
        self.run(
            OperationKind::BackwardInput,
            params,
            [weight, output_diff],
            input_diff,
        )
    }

    /// Run pass `kind`. `inputs` follow the order of the strategy's input
    /// bindings; every slice is in its operand's canonical layout.
    pub fn run(
        &self,
        kind: OperationKind,
        params: &ConvParams,
        inputs: [&[f32]; 2],
        output: &mut [f32],
    ) -> Result<()> {
        let strategy = kind.strategy();
        let shapes = resolve(params)?;

        let in_bindings = strategy.inputs();
        let out_binding = strategy.output();
        for (binding, host) in in_bindings.iter().zip(inputs.iter()) {
            check_host_len(&binding.operand.canonical(&shapes), host.len())?;
        }
        let out_desc = out_binding.operand.canonical(&shapes);
        check_host_len(&out_desc, output.len())?;

        let lib = self.library;
        let mut ctx = ExecutionContext::create(lib, self.config.engine_index)?;
        let engine = ctx.engine().clone();

        let mut user = Vec::with_capacity(2);
        for (binding, host) in in_bindings.iter().zip(inputs.iter()) {
            let mem = lib.allocate(&engine, &binding.operand.canonical(&shapes))?;
            lib.write_host_to_device(host, &mem)?;
            user.push(mem);
        }
        let user_out = lib.allocate(&engine, &out_desc)?;

        let pd = self.build(strategy, &shapes, &engine)?;
        log::debug!("{} via {} on {}", kind, pd.name(), engine);

        let mut args = ExecArgs::new();
        for (binding, mem) in in_bindings.iter().zip(user.iter()) {
            let desired = pd.desc(binding.role)?;
            args.insert(binding.role, adapt(mem, desired, &mut ctx)?);
        }
        let working = output_memory(lib, &engine, pd.desc(out_binding.role)?, &user_out)?;
        args.insert(out_binding.role, working.clone());

        let task = lib.execute(&pd, args)?;
        ctx.enqueue(task);
        let result = adapt_back(&working, &user_out, &mut ctx)?;
        ctx.wait()?;

        lib.read_device_to_host(&result, output)
    }

    fn build(
        &self,
        strategy: &dyn ConvStrategy,
        shapes: &ConvShapes,
        engine: &Engine,
    ) -> Result<PrimitiveDesc> {
        let algorithm = self.config.algorithm;
        let hint = if strategy.needs_hint() {
            let forward = PrimitiveKind::Forward(self.config.hint_prop_kind);
            let request = shapes.request(forward, algorithm);
            Some(self.library.build_primitive(engine, &request, None)?)
        } else {
            None
        };
        let request = shapes.request(strategy.primitive_kind(), algorithm);
        self.library.build_primitive(engine, &request, hint.as_ref())
    }
}

impl<L: KernelLibrary + ?Sized> Clone for Driver<'_, L> {
    fn clone(&self) -> Self {
        Driver {
            library: self.library,
            config: self.config,
        }
    }
}

impl<L: KernelLibrary + ?Sized> fmt::Debug for Driver<'_, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Driver")
            .field("library", &self.library.name())
            .field("config", &self.config)
            .finish()
    }
}

fn check_host_len(desc: &TensorDesc, got: usize) -> Result<()> {
    let expected = desc.elem_count();
    if got != expected {
        return Err(Error::ElementCountMismatch {
            shape: desc.shape().clone(),
            expected,
            got,
        });
    }
    Ok(())
}

/// The caller's handle when the primitive writes canonical layout, else a temporary.
fn output_memory<L: KernelLibrary + ?Sized>(
    lib: &L,
    engine: &Engine,
    desired: &TensorDesc,
    user_out: &Memory,
) -> Result<Memory> {
    if desired == user_out.desc() {
        log::trace!("zero-copy: output written in place as {}", desired);
        Ok(user_out.clone())
    } else {
        lib.allocate(engine, desired)
    }
}
