use crate::shape::Shape;

/// All errors that can occur within mdrnn.
///
/// Configuration problems (sizes that cannot be tiled, kernels with the wrong
/// shape) are reported when a component is built. Shape problems are reported
/// when a tensor reaches an operation it does not fit.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Shape mismatch between two tensors (e.g., trying to add [2,3] + [4,5]).
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    /// Operation requires a specific rank (number of dimensions).
    #[error("rank mismatch: expected rank {expected}, got {got}")]
    RankMismatch { expected: usize, got: usize },

    /// DType mismatch between tensors in a binary operation.
    #[error("dtype mismatch: expected {expected:?}, got {got:?}")]
    DTypeMismatch {
        expected: crate::DType,
        got: crate::DType,
    },

    /// Dimension index out of range for the tensor's rank.
    #[error("dimension out of range: dim {dim} for tensor with {rank} dimensions")]
    DimOutOfRange { dim: usize, rank: usize },

    /// Narrow/slice operation out of bounds.
    #[error("narrow out of bounds: dim {dim}, start {start}, len {len}, dim_size {dim_size}")]
    NarrowOutOfBounds {
        dim: usize,
        start: usize,
        len: usize,
        dim_size: usize,
    },

    /// Tried to access a scalar from a non-scalar tensor.
    #[error("not a scalar: tensor has shape {shape}")]
    NotAScalar { shape: Shape },

    /// Element count mismatch when creating from a vec.
    #[error("element count mismatch: shape {shape} requires {expected} elements, got {got}")]
    ElementCountMismatch {
        shape: Shape,
        expected: usize,
        got: usize,
    },

    /// Matrix multiplication dimension mismatch.
    #[error("matmul shape mismatch: [{m}x{k1}] @ [{k2}x{n}], inner dims must match")]
    MatmulShapeMismatch {
        m: usize,
        k1: usize,
        k2: usize,
        n: usize,
    },

    /// Cannot reshape because element counts differ.
    #[error(
        "cannot reshape: source has {src} elements, target shape {dst_shape} has {dst} elements"
    )]
    ReshapeElementMismatch {
        src: usize,
        dst: usize,
        dst_shape: Shape,
    },

    /// A two-dimensional size with a zero axis.
    #[error("invalid size {height}x{width}: both dimensions must be positive")]
    InvalidSize { height: usize, width: usize },

    /// The original map cannot be tiled by the block size along one axis.
    #[error("{axis} {original} is not a multiple of block {axis} {block}")]
    BlockSizeMismatch {
        axis: &'static str,
        original: usize,
        block: usize,
    },

    /// The leading axis of a chunked tensor does not hold a whole number of
    /// examples' worth of blocks.
    #[error("chunked tensor holds {got} blocks, expected a multiple of {blocks_per_example}")]
    BlockCountMismatch {
        got: usize,
        blocks_per_example: usize,
    },

    /// Number of examples handed to a list chunker differs from its table.
    #[error("expected {expected} examples, got {got}")]
    ExampleCountMismatch { expected: usize, got: usize },

    /// A gate kernel does not have the shape its role requires.
    #[error("kernel `{name}` has shape {got}, expected {expected}")]
    KernelShapeMismatch {
        name: String,
        expected: Shape,
        got: Shape,
    },

    /// Input channel count differs from what a layer was built for.
    #[error("channel mismatch: layer expects {expected} channels, input has {got}")]
    ChannelMismatch { expected: usize, got: usize },

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }
}

/// Convenience Result type used throughout mdrnn.
pub type Result<T> = std::result::Result<T, Error>;

/// Early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
