use std::fmt;

// DType — element types a tensor can hold
//
//   F32  — default for parameters and activations
//   F64  — reference precision, used by the tests
//   U8   — comparison results and dropout keep-masks
//   I64  — index tensors (flip, index_select)

/// Enum of all supported element data types.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum DType {
    #[default]
    F32,
    F64,
    U8,
    I64,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F64 => 8,
            DType::U8 => 1,
            DType::I64 => 8,
        }
    }

    /// Whether this dtype is a floating-point type (needed for gradient tracking).
    pub fn is_float(&self) -> bool {
        matches!(self, DType::F32 | DType::F64)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::U8 => "u8",
            DType::I64 => "i64",
        };
        write!(f, "{}", s)
    }
}

// WithDType — bridge between Rust element types and DType
//
// Backends are written once, generically over `T: WithDType`, and the
// runtime DType picks the instantiation.

/// Trait implemented by Rust types that can be stored in a tensor.
pub trait WithDType:
    Copy + Send + Sync + 'static + num_traits::NumCast + PartialOrd + std::fmt::Debug
{
    /// The corresponding DType enum variant.
    const DTYPE: DType;

    /// Convert this value to f64 (for generic numeric code).
    fn to_f64(self) -> f64;

    /// Create a value of this type from f64.
    fn from_f64(v: f64) -> Self;

    fn zero() -> Self {
        Self::from_f64(0.0)
    }

    fn one() -> Self {
        Self::from_f64(1.0)
    }
}

impl WithDType for f32 {
    const DTYPE: DType = DType::F32;
    fn to_f64(self) -> f64 {
        self as f64
    }
    fn from_f64(v: f64) -> Self {
        v as f32
    }
}

impl WithDType for f64 {
    const DTYPE: DType = DType::F64;
    fn to_f64(self) -> f64 {
        self
    }
    fn from_f64(v: f64) -> Self {
        v
    }
}

impl WithDType for u8 {
    const DTYPE: DType = DType::U8;
    fn to_f64(self) -> f64 {
        self as f64
    }
    fn from_f64(v: f64) -> Self {
        v as u8
    }
}

impl WithDType for i64 {
    const DTYPE: DType = DType::I64;
    fn to_f64(self) -> f64 {
        self as f64
    }
    fn from_f64(v: f64) -> Self {
        v as i64
    }
}
