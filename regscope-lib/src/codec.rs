//! Conversion between raw 16-bit register words and typed values.
//!
//! Multi-word values are composed with the first word on the wire being the
//! most significant one ([`ByteOrder::BigEndian`]) or the least significant
//! one ([`ByteOrder::LittleEndian`]). Bytes inside a word always stay in
//! network order.

use serde::{Deserialize, Serialize};
use std::{fmt::Display, str::FromStr};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    UInt16,
    Int16,
    UInt32,
    Int32,
    Float32,
}

impl DataType {
    /// Number of 16-bit words occupied on the device.
    pub fn words(&self) -> usize {
        match self {
            DataType::UInt16 | DataType::Int16 => 1,
            DataType::UInt32 | DataType::Int32 | DataType::Float32 => 2,
        }
    }

    pub fn is_integer(&self) -> bool {
        !matches!(self, DataType::Float32)
    }

    /// Inclusive range of values accepted by [`encode`].
    pub fn range(&self) -> (f64, f64) {
        match self {
            DataType::UInt16 => (0.0, u16::MAX as f64),
            DataType::Int16 => (i16::MIN as f64, i16::MAX as f64),
            DataType::UInt32 => (0.0, u32::MAX as f64),
            DataType::Int32 => (i32::MIN as f64, i32::MAX as f64),
            DataType::Float32 => (-(f32::MAX as f64), f32::MAX as f64),
        }
    }
}

impl Default for DataType {
    fn default() -> Self {
        DataType::UInt16
    }
}

impl Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataType::UInt16 => "uint16".fmt(f),
            DataType::Int16 => "int16".fmt(f),
            DataType::UInt32 => "uint32".fmt(f),
            DataType::Int32 => "int32".fmt(f),
            DataType::Float32 => "float32".fmt(f),
        }
    }
}

#[derive(Error, Debug)]
pub enum ParseTypeError {
    #[error("invalid data type '{0}'")]
    BadDataType(String),
    #[error("invalid byte order '{0}'")]
    BadByteOrder(String),
}

impl FromStr for DataType {
    type Err = ParseTypeError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.to_ascii_lowercase().as_str() {
            "uint16" | "u16" => Ok(DataType::UInt16),
            "int16" | "i16" => Ok(DataType::Int16),
            "uint32" | "u32" => Ok(DataType::UInt32),
            "int32" | "i32" => Ok(DataType::Int32),
            "float32" | "f32" | "float" => Ok(DataType::Float32),
            _ => Err(ParseTypeError::BadDataType(input.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ByteOrder {
    #[serde(rename = "big")]
    BigEndian,
    #[serde(rename = "little")]
    LittleEndian,
}

impl Default for ByteOrder {
    fn default() -> Self {
        ByteOrder::BigEndian
    }
}

impl Display for ByteOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ByteOrder::BigEndian => "big".fmt(f),
            ByteOrder::LittleEndian => "little".fmt(f),
        }
    }
}

impl FromStr for ByteOrder {
    type Err = ParseTypeError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.to_ascii_lowercase().as_str() {
            "big" | "be" => Ok(ByteOrder::BigEndian),
            "little" | "le" => Ok(ByteOrder::LittleEndian),
            _ => Err(ParseTypeError::BadByteOrder(input.to_string())),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    #[error("{data_type} needs {expected} word(s), got {actual}")]
    Decode {
        data_type: DataType,
        expected: usize,
        actual: usize,
    },
    #[error("{value} is outside the range of {data_type}")]
    EncodeRange { value: f64, data_type: DataType },
    #[error("{value} is not a valid {data_type}: {reason}")]
    InvalidValue {
        value: f64,
        data_type: DataType,
        reason: &'static str,
    },
}

fn compose(words: &[u16], order: ByteOrder) -> u32 {
    let (high, low) = match order {
        ByteOrder::BigEndian => (words[0], words[1]),
        ByteOrder::LittleEndian => (words[1], words[0]),
    };
    (high as u32) << 16 | low as u32
}

fn split(bits: u32, order: ByteOrder) -> Vec<u16> {
    let (high, low) = ((bits >> 16) as u16, bits as u16);
    match order {
        ByteOrder::BigEndian => vec![high, low],
        ByteOrder::LittleEndian => vec![low, high],
    }
}

pub fn decode(words: &[u16], data_type: DataType, order: ByteOrder) -> Result<f64, CodecError> {
    if words.len() != data_type.words() {
        return Err(CodecError::Decode {
            data_type,
            expected: data_type.words(),
            actual: words.len(),
        });
    }

    Ok(match data_type {
        DataType::UInt16 => words[0] as f64,
        DataType::Int16 => words[0] as i16 as f64,
        DataType::UInt32 => compose(words, order) as f64,
        DataType::Int32 => compose(words, order) as i32 as f64,
        DataType::Float32 => f32::from_bits(compose(words, order)) as f64,
    })
}

/// Checks that `value` is representable by `data_type` without truncation.
pub fn validate(value: f64, data_type: DataType) -> Result<(), CodecError> {
    if !value.is_finite() {
        return Err(CodecError::InvalidValue {
            value,
            data_type,
            reason: "not a finite number",
        });
    }

    if data_type.is_integer() && value.fract() != 0.0 {
        return Err(CodecError::InvalidValue {
            value,
            data_type,
            reason: "not an integer",
        });
    }

    let (min, max) = data_type.range();
    if value < min || value > max {
        return Err(CodecError::EncodeRange { value, data_type });
    }

    Ok(())
}

pub fn encode(value: f64, data_type: DataType, order: ByteOrder) -> Result<Vec<u16>, CodecError> {
    validate(value, data_type)?;

    Ok(match data_type {
        DataType::UInt16 => vec![value as u16],
        DataType::Int16 => vec![value as i16 as u16],
        DataType::UInt32 => split(value as u32, order),
        DataType::Int32 => split(value as i32 as u32, order),
        DataType::Float32 => split((value as f32).to_bits(), order),
    })
}
