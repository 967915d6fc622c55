//! Benchmark data type names.

use std::fmt;
use std::str::FromStr;

use candle_core::DType;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unrecognized data type specified: {0:?} (expected float32, float16 or bfloat16)")]
pub struct UnrecognizedDType(pub String);

/// Floating point type used for parameters and activations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataType {
    #[default]
    Float32,
    Float16,
    Bfloat16,
}

impl DataType {
    pub fn dtype(self) -> DType {
        match self {
            DataType::Float32 => DType::F32,
            DataType::Float16 => DType::F16,
            DataType::Bfloat16 => DType::BF16,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DataType::Float32 => "float32",
            DataType::Float16 => "float16",
            DataType::Bfloat16 => "bfloat16",
        }
    }
}

impl FromStr for DataType {
    type Err = UnrecognizedDType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "float32" => Ok(DataType::Float32),
            "float16" => Ok(DataType::Float16),
            "bfloat16" => Ok(DataType::Bfloat16),
            other => Err(UnrecognizedDType(other.to_string())),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
