// CPU kernel library: reference implementation of KernelLibrary
//
// Builds direct convolution primitives that run on the host with rayon
// parallelism across the batch.
//
// LAYOUT CHOICE:
// Unconstrained (`any`) operands resolve to the formats in CpuKernelConfig,
// nchw/oihw by default. Those differ from the framework's nhwc/hwio, so the
// default configuration exercises the reorder path on every call;
// `CpuKernelConfig::canonical()` prefers the framework formats and makes
// every reorder unnecessary.
//
// Backward primitives take their `any` formats from the forward hint so
// forward and backward agree on where every tensor lives.
//
// USAGE:
//   let lib = CpuKernelLibrary::new();
//   let engine = lib.engine(0)?;
//   let pd = lib.build_primitive(&engine, &conv_desc, None)?;

pub mod kernels;

use std::sync::Arc;

use ferret_core::dtype::DType;
use ferret_core::error::{Error, Result};
use ferret_core::kernel::KernelLibrary;
use ferret_core::layout::FormatTag;
use ferret_core::primitive::{Algorithm, ConvDesc, PrimitiveDesc, PrimitiveKind};
use ferret_core::stream::{Engine, EngineKind};

use kernels::{ConvPrimitive, Geometry};

/// Configuration of the CPU kernel library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuKernelConfig {
    /// Format chosen for unconstrained activation operands (default: nchw).
    pub activation_format: FormatTag,
    /// Format chosen for unconstrained weight operands (default: oihw).
    pub weights_format: FormatTag,
    /// Split the batch across rayon workers (default: true).
    pub parallel: bool,
    /// Number of CPU engines the library exposes (default: 1).
    pub engines: usize,
}

impl Default for CpuKernelConfig {
    fn default() -> Self {
        Self {
            activation_format: FormatTag::Nchw,
            weights_format: FormatTag::Oihw,
            parallel: true,
            engines: 1,
        }
    }
}

impl CpuKernelConfig {
    /// Prefer the framework's own formats (nhwc / hwio).
    pub fn canonical() -> Self {
        Self::default()
            .with_activation_format(FormatTag::Nhwc)
            .with_weights_format(FormatTag::Hwio)
    }

    pub fn with_activation_format(mut self, format: FormatTag) -> Self {
        self.activation_format = format;
        self
    }

    pub fn with_weights_format(mut self, format: FormatTag) -> Self {
        self.weights_format = format;
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_engines(mut self, engines: usize) -> Self {
        self.engines = engines;
        self
    }
}

/// Host-side reference kernel library.
#[derive(Debug, Clone, Default)]
pub struct CpuKernelLibrary {
    config: CpuKernelConfig,
}

impl CpuKernelLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: CpuKernelConfig) -> Self {
        Self { config }
    }

    fn check_engine(&self, engine: &Engine) -> Result<()> {
        if engine.kind() != EngineKind::Cpu || engine.index() >= self.config.engines {
            return Err(Error::resource(format!(
                "engine {engine} is not provided by {}",
                self.name()
            )));
        }
        Ok(())
    }

    /// Pick the physical format for one operand slot.
    fn resolve(
        &self,
        slot: &'static str,
        requested: FormatTag,
        hinted: Option<FormatTag>,
        weights: bool,
    ) -> Result<FormatTag> {
        let preferred = if weights {
            self.config.weights_format
        } else {
            self.config.activation_format
        };
        let format = match requested {
            FormatTag::Any => hinted.unwrap_or(preferred),
            concrete => concrete,
        };
        let fits = if weights {
            format.is_weights()
        } else {
            format.is_activation()
        };
        if !fits {
            return Err(Error::unsupported(format!(
                "{} has no primitive taking {slot} in {format}",
                self.name()
            )));
        }
        Ok(format)
    }
}

impl KernelLibrary for CpuKernelLibrary {
    fn name(&self) -> &str {
        "cpu-ref"
    }

    fn engine(&self, index: usize) -> Result<Engine> {
        let engine = Engine::cpu(index);
        self.check_engine(&engine)?;
        Ok(engine)
    }

    fn build_primitive(
        &self,
        engine: &Engine,
        desc: &ConvDesc,
        hint: Option<&PrimitiveDesc>,
    ) -> Result<PrimitiveDesc> {
        self.check_engine(engine)?;
        if desc.algorithm != Algorithm::Direct {
            return Err(Error::unsupported(format!(
                "{} implements only direct convolution, not {:?}",
                self.name(),
                desc.algorithm
            )));
        }
        for d in [&desc.src, &desc.weights, &desc.dst] {
            if d.dtype() != DType::F32 {
                return Err(Error::unsupported(format!(
                    "{} has no {} convolution ({d})",
                    self.name(),
                    d.dtype()
                )));
            }
        }
        let geom = Geometry::from_desc(desc)?;

        let hint = match (desc.kind, hint) {
            (PrimitiveKind::Forward(_), _) => None,
            (kind, None) => {
                return Err(Error::unsupported(format!(
                    "{kind} primitive needs a forward hint"
                )))
            }
            (kind, Some(h)) => {
                if !h.kind().is_forward() || !h.conv().same_geometry(desc) {
                    return Err(Error::unsupported(format!(
                        "{} hint is incompatible with {kind} request",
                        h.kind()
                    )));
                }
                Some(h.conv())
            }
        };

        let [src_role, wei_role, dst_role] = desc.kind.roles();
        let src_fmt = self.resolve(
            src_role.name(),
            desc.src.format(),
            hint.map(|h| h.src.format()),
            false,
        )?;
        let wei_fmt = self.resolve(
            wei_role.name(),
            desc.weights.format(),
            hint.map(|h| h.weights.format()),
            true,
        )?;
        let dst_fmt = self.resolve(
            dst_role.name(),
            desc.dst.format(),
            hint.map(|h| h.dst.format()),
            false,
        )?;

        let resolved = ConvDesc {
            src: desc.src.with_format(src_fmt),
            weights: desc.weights.with_format(wei_fmt),
            dst: desc.dst.with_format(dst_fmt),
            ..desc.clone()
        };
        log::debug!(
            "{}: built {} primitive on {engine}: {src_role}={src_fmt} {wei_role}={wei_fmt} {dst_role}={dst_fmt}",
            self.name(),
            desc.kind
        );
        let primitive = ConvPrimitive::new(desc.kind, geom, self.config.parallel);
        PrimitiveDesc::new(resolved, Arc::new(primitive))
    }
}
