use crate::layout::FormatTag;
use crate::shape::Shape;

/// All errors that can occur while dispatching a convolution.
///
/// Every variant belongs to one of four classes (see [`ErrorKind`]). None of
/// them is recoverable inside a driver call: the call aborts and the caller
/// receives the error. Output buffers are not guaranteed valid afterwards.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Output spatial size from `floor((X - K + 2P) / S) + 1` is not positive.
    #[error("invalid output {axis}: floor(({input} - {kernel} + 2*{padding}) / {stride}) + 1 = {size}")]
    NonPositiveOutput {
        axis: &'static str,
        input: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
        size: i64,
    },

    /// Convolution parameters for which the output formula is undefined.
    #[error("invalid convolution parameters: {0}")]
    InvalidParams(String),

    /// A tensor's declared shape disagrees with the resolved shape for the same params.
    #[error("shape mismatch for {role}: expected {expected}, got {got}")]
    ShapeMismatch {
        role: &'static str,
        expected: Shape,
        got: Shape,
    },

    /// Host buffer length does not match the element count of its descriptor.
    #[error("element count mismatch: shape {shape} requires {expected} elements, got {got}")]
    ElementCountMismatch {
        shape: Shape,
        expected: usize,
        got: usize,
    },

    /// The kernel library has no primitive for the requested combination.
    #[error("unsupported layout: {0}")]
    UnsupportedLayout(String),

    /// A descriptor still carries the unconstrained tag where a concrete one is needed.
    #[error("format {format} is not resolved to a physical layout")]
    UnresolvedFormat { format: FormatTag },

    /// Engine, stream or buffer could not be acquired.
    #[error("resource error: {0}")]
    Resource(String),

    /// A primitive or reorder faulted while executing.
    #[error("execution error: {0}")]
    Execution(String),
}

/// Coarse classification of [`Error`], one per failure class of the dispatch layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Shape,
    UnsupportedLayout,
    Resource,
    Execution,
}

impl Error {
    pub fn unsupported(s: impl Into<String>) -> Self {
        Error::UnsupportedLayout(s.into())
    }

    pub fn resource(s: impl Into<String>) -> Self {
        Error::Resource(s.into())
    }

    pub fn execution(s: impl Into<String>) -> Self {
        Error::Execution(s.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NonPositiveOutput { .. }
            | Error::InvalidParams(_)
            | Error::ShapeMismatch { .. }
            | Error::ElementCountMismatch { .. } => ErrorKind::Shape,
            Error::UnsupportedLayout(_) | Error::UnresolvedFormat { .. } => {
                ErrorKind::UnsupportedLayout
            }
            Error::Resource(_) => ErrorKind::Resource,
            Error::Execution(_) => ErrorKind::Execution,
        }
    }
}

/// Convenience Result type used throughout ferret.
pub type Result<T> = std::result::Result<T, Error>;

/// Early return with a formatted execution error.
/// Usage: `bail!("reorder shape mismatch: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Execution(format!($($arg)*)))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        let e = Error::NonPositiveOutput {
            axis: "height",
            input: 2,
            kernel: 5,
            stride: 1,
            padding: 0,
            size: -2,
        };
        assert_eq!(e.kind(), ErrorKind::Shape);
        assert_eq!(Error::unsupported("x").kind(), ErrorKind::UnsupportedLayout);
        assert_eq!(
            Error::UnresolvedFormat {
                format: FormatTag::Any
            }
            .kind(),
            ErrorKind::UnsupportedLayout
        );
        assert_eq!(Error::resource("x").kind(), ErrorKind::Resource);
        assert_eq!(Error::execution("x").kind(), ErrorKind::Execution);
    }

    #[test]
    fn test_display_mentions_formula_terms() {
        let e = Error::NonPositiveOutput {
            axis: "width",
            input: 4,
            kernel: 7,
            stride: 2,
            padding: 1,
            size: 0,
        };
        let msg = e.to_string();
        assert!(msg.contains("width"));
        assert!(msg.contains("= 0"));
    }

    fn failing() -> Result<()> {
        crate::bail!("task {} failed", 3);
    }

    #[test]
    fn test_bail_is_execution() {
        let err = failing().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Execution);
        assert_eq!(err.to_string(), "execution error: task 3 failed");
    }
}
