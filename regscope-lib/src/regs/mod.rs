use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{fmt::Display, str::FromStr};
use thiserror::Error;

use crate::codec::{self, ByteOrder, CodecError, DataType};
use crate::expr::{self, Expression, ExpressionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Access {
    #[serde(rename = "read")]
    R,
    #[serde(rename = "write")]
    W,
    #[serde(rename = "read_write")]
    RW,
}

impl Access {
    pub fn is_readable(&self) -> bool {
        !matches!(self, Access::W)
    }

    pub fn is_writable(&self) -> bool {
        !matches!(self, Access::R)
    }
}

impl Default for Access {
    fn default() -> Self {
        Access::RW
    }
}

impl Display for Access {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Access::R => "R".fmt(f),
            Access::W => "W".fmt(f),
            Access::RW => "RW".fmt(f),
        }
    }
}

impl FromStr for Access {
    type Err = RegisterError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.to_ascii_lowercase().as_str() {
            "r" | "read" => Ok(Access::R),
            "w" | "write" => Ok(Access::W),
            "rw" | "read_write" => Ok(Access::RW),
            _ => Err(RegisterError::BadAccess(input.to_string())),
        }
    }
}

/// Number of 16-bit words a register occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum RegSize {
    Single = 1,
    Double = 2,
    Quad = 4,
}

impl RegSize {
    pub fn words(&self) -> u16 {
        *self as u16
    }
}

impl Default for RegSize {
    fn default() -> Self {
        RegSize::Single
    }
}

impl TryFrom<u8> for RegSize {
    type Error = RegisterError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(RegSize::Single),
            2 => Ok(RegSize::Double),
            4 => Ok(RegSize::Quad),
            _ => Err(RegisterError::BadSize(value)),
        }
    }
}

impl From<RegSize> for u8 {
    fn from(size: RegSize) -> Self {
        size as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Decimal,
    Hex,
    Binary,
}

impl Default for Format {
    fn default() -> Self {
        Format::Decimal
    }
}

impl FromStr for Format {
    type Err = RegisterError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.to_ascii_lowercase().as_str() {
            "decimal" | "dec" => Ok(Format::Decimal),
            "hex" => Ok(Format::Hex),
            "binary" | "bin" => Ok(Format::Binary),
            _ => Err(RegisterError::BadFormat(input.to_string())),
        }
    }
}

impl Format {
    /// Renders `value` for display. Hex and binary show the two's
    /// complement bit pattern at the register width.
    pub fn render(&self, value: f64, size: RegSize) -> String {
        if !value.is_finite() {
            return value.to_string();
        }

        let bits = value.round() as i64;
        match (self, size) {
            (Format::Hex, RegSize::Single) => format!("0x{:04X}", bits as u16),
            (Format::Hex, _) => format!("0x{:08X}", bits as u32),
            (Format::Binary, RegSize::Single) => format!("{:016b}", bits as u16),
            (Format::Binary, _) => format!("{:032b}", bits as u32),
            (Format::Decimal, _) if value.fract() == 0.0 && value.abs() < 1e15 => {
                format!("{}", value as i64)
            }
            (Format::Decimal, _) => {
                let text = format!("{:.4}", value);
                text.trim_end_matches('0').trim_end_matches('.').to_string()
            }
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegisterError {
    #[error("register {address}: {data_type} does not fit {size} word(s)")]
    SizeMismatch {
        address: u16,
        data_type: DataType,
        size: u16,
    },
    #[error("register {address}: {size} word(s) run past the end of the address space")]
    OutOfRange { address: u16, size: u16 },
    #[error("register {first} overlaps register {second}")]
    Overlap { first: String, second: String },
    #[error("register {address}: {source}")]
    Expression {
        address: u16,
        source: ExpressionError,
    },
    #[error("invalid register size {0}")]
    BadSize(u8),
    #[error("invalid access mode '{0}'")]
    BadAccess(String),
    #[error("invalid display format '{0}'")]
    BadFormat(String),
    #[error("no register at index {0}")]
    UnknownIndex(usize),
    #[error("register {address}: unit id {unit} outside 1..=247")]
    BadUnit { address: u16, unit: u8 },
}

fn default_expression() -> String {
    "value".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterDefinition {
    pub address: u16,
    #[serde(default)]
    pub size: RegSize,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub data_type: DataType,
    #[serde(default)]
    pub byte_order: ByteOrder,
    #[serde(default = "default_expression")]
    pub expression: String,
    #[serde(default)]
    pub format: Format,
    #[serde(default)]
    pub access: Access,
    /// Unit id to address instead of the session one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<u8>,
    /// Read on every cycle even when slow registers are held back.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub fast_poll: bool,
}

impl RegisterDefinition {
    /// A definition sized for `data_type`, with identity scaling.
    pub fn new(address: u16, data_type: DataType) -> Self {
        let size = match data_type.words() {
            1 => RegSize::Single,
            _ => RegSize::Double,
        };

        RegisterDefinition {
            address,
            size,
            label: String::new(),
            data_type,
            byte_order: ByteOrder::default(),
            expression: default_expression(),
            format: Format::default(),
            access: Access::default(),
            unit: None,
            fast_poll: false,
        }
    }

    pub fn label(mut self, label: &str) -> Self {
        self.label = label.to_string();
        self
    }

    pub fn expression(mut self, expression: &str) -> Self {
        self.expression = expression.to_string();
        self
    }

    pub fn byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = byte_order;
        self
    }

    pub fn format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    pub fn access(mut self, access: Access) -> Self {
        self.access = access;
        self
    }

    pub fn size(mut self, size: RegSize) -> Self {
        self.size = size;
        self
    }

    pub fn unit(mut self, unit: u8) -> Self {
        self.unit = Some(unit);
        self
    }

    pub fn fast_poll(mut self, fast_poll: bool) -> Self {
        self.fast_poll = fast_poll;
        self
    }

    /// Unit id to address, falling back to `default`.
    pub fn unit_or(&self, default: u8) -> u8 {
        self.unit.unwrap_or(default)
    }

    /// Last address covered, inclusive.
    pub fn end(&self) -> u32 {
        self.address as u32 + self.size.words() as u32 - 1
    }

    /// Address, followed by the label when there is one.
    pub fn name(&self) -> String {
        if self.label.is_empty() {
            self.address.to_string()
        } else {
            format!("{} ({})", self.address, self.label)
        }
    }

    pub fn validate(&self) -> Result<(), RegisterError> {
        if self.size.words() as usize != self.data_type.words() {
            return Err(RegisterError::SizeMismatch {
                address: self.address,
                data_type: self.data_type,
                size: self.size.words(),
            });
        }

        if self.end() > u16::MAX as u32 {
            return Err(RegisterError::OutOfRange {
                address: self.address,
                size: self.size.words(),
            });
        }

        if let Some(unit) = self.unit.filter(|unit| !(1..=247).contains(unit)) {
            return Err(RegisterError::BadUnit {
                address: self.address,
                unit,
            });
        }

        expr::validate(&self.expression).map_err(|source| RegisterError::Expression {
            address: self.address,
            source,
        })
    }
}

impl Display for RegisterDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:5} {:1} {:<2} {:<7} {:<6} {}",
            self.address,
            self.size.words(),
            self.access,
            self.data_type,
            self.byte_order,
            self.label
        )
    }
}

/// Why a register produced no value.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegisterFault {
    #[error("decode failed: {0}")]
    Decode(#[from] CodecError),
    #[error("expression failed: {0}")]
    Expression(#[from] ExpressionError),
}

/// A validated definition with its compiled expression.
#[derive(Debug, Clone)]
pub struct Register {
    definition: RegisterDefinition,
    expression: Expression,
}

impl Register {
    pub fn new(definition: RegisterDefinition) -> Result<Self, RegisterError> {
        definition.validate()?;
        let expression =
            Expression::parse(&definition.expression).map_err(|source| RegisterError::Expression {
                address: definition.address,
                source,
            })?;

        Ok(Register {
            definition,
            expression,
        })
    }

    pub fn definition(&self) -> &RegisterDefinition {
        &self.definition
    }

    pub fn expression(&self) -> &Expression {
        &self.expression
    }

    pub fn address(&self) -> u16 {
        self.definition.address
    }

    pub fn count(&self) -> u16 {
        self.definition.size.words()
    }

    pub fn unit_or(&self, default: u8) -> u8 {
        self.definition.unit_or(default)
    }

    /// Decoded value before scaling.
    pub fn raw_value(&self, words: &[u16]) -> Result<f64, RegisterFault> {
        Ok(codec::decode(
            words,
            self.definition.data_type,
            self.definition.byte_order,
        )?)
    }

    /// Decoded and scaled engineering value.
    pub fn scale(&self, words: &[u16]) -> Result<f64, RegisterFault> {
        let raw = self.raw_value(words)?;
        Ok(self.expression.eval(raw)?)
    }

    pub fn render(&self, value: f64) -> String {
        self.definition.format.render(value, self.definition.size)
    }
}

/// Registers in insertion order, which is also the polling order.
#[derive(Debug, Clone, Default)]
pub struct RegisterMap {
    registers: Vec<Register>,
}

fn check_overlap(a: &RegisterDefinition, b: &RegisterDefinition) -> Result<(), RegisterError> {
    if a.unit == b.unit && a.address as u32 <= b.end() && b.address as u32 <= a.end() {
        return Err(RegisterError::Overlap {
            first: a.name(),
            second: b.name(),
        });
    }
    Ok(())
}

impl RegisterMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_definitions(definitions: Vec<RegisterDefinition>) -> Result<Self, RegisterError> {
        let registers = definitions
            .into_iter()
            .map(Register::new)
            .collect::<Result<Vec<_>, _>>()?;

        // Sorted by unit then start address, any overlap shows up between
        // neighbours.
        registers
            .iter()
            .map(Register::definition)
            .sorted_by_key(|d| (d.unit, d.address))
            .tuple_windows()
            .try_for_each(|(a, b)| check_overlap(a, b))?;

        Ok(RegisterMap { registers })
    }

    /// Appends `definition` and returns its index.
    pub fn push(&mut self, definition: RegisterDefinition) -> Result<usize, RegisterError> {
        let register = Register::new(definition)?;
        self.registers
            .iter()
            .try_for_each(|r| check_overlap(r.definition(), register.definition()))?;
        self.registers.push(register);
        Ok(self.registers.len() - 1)
    }

    pub fn replace(
        &mut self,
        index: usize,
        definition: RegisterDefinition,
    ) -> Result<RegisterDefinition, RegisterError> {
        if index >= self.registers.len() {
            return Err(RegisterError::UnknownIndex(index));
        }

        let register = Register::new(definition)?;
        self.registers
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != index)
            .try_for_each(|(_, r)| check_overlap(r.definition(), register.definition()))?;

        let old = std::mem::replace(&mut self.registers[index], register);
        Ok(old.definition)
    }

    pub fn remove(&mut self, index: usize) -> Option<RegisterDefinition> {
        (index < self.registers.len()).then(|| self.registers.remove(index).definition)
    }

    pub fn get(&self, index: usize) -> Option<&Register> {
        self.registers.get(index)
    }

    /// The register whose words cover `address` on `unit`, if any.
    pub fn find_covering(&self, unit: Option<u8>, address: u16) -> Option<(usize, &Register)> {
        self.registers.iter().enumerate().find(|(_, r)| {
            let d = r.definition();
            d.unit == unit && d.address <= address && address as u32 <= d.end()
        })
    }

    pub fn find_by_address(&self, address: u16) -> Option<(usize, &Register)> {
        self.registers
            .iter()
            .enumerate()
            .find(|(_, r)| r.address() == address)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Register> {
        self.registers.iter()
    }

    pub fn len(&self) -> usize {
        self.registers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }

    pub fn definitions(&self) -> Vec<RegisterDefinition> {
        self.registers
            .iter()
            .map(|r| r.definition.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_must_match_type() {
        let def = RegisterDefinition::new(0, DataType::Float32).size(RegSize::Single);
        assert!(matches!(
            def.validate(),
            Err(RegisterError::SizeMismatch { size: 1, .. })
        ));

        let def = RegisterDefinition::new(0, DataType::UInt32).size(RegSize::Quad);
        assert!(matches!(
            def.validate(),
            Err(RegisterError::SizeMismatch { size: 4, .. })
        ));

        assert!(RegisterDefinition::new(0, DataType::Int32).validate().is_ok());
    }

    #[test]
    fn end_of_address_space() {
        assert!(RegisterDefinition::new(0xFFFF, DataType::UInt16)
            .validate()
            .is_ok());
        assert!(matches!(
            RegisterDefinition::new(0xFFFF, DataType::Float32).validate(),
            Err(RegisterError::OutOfRange { .. })
        ));
    }

    #[test]
    fn bad_expression_is_rejected() {
        let def = RegisterDefinition::new(3, DataType::UInt16).expression("value +");
        assert!(matches!(
            def.validate(),
            Err(RegisterError::Expression { address: 3, .. })
        ));
        let def = RegisterDefinition::new(3, DataType::UInt16).expression("100 / value");
        assert!(def.validate().is_ok());
    }

    #[test]
    fn overlaps_are_rejected() {
        let err = RegisterMap::from_definitions(vec![
            RegisterDefinition::new(10, DataType::UInt16),
            RegisterDefinition::new(0, DataType::Float32).label("temp"),
            RegisterDefinition::new(1, DataType::UInt16).label("flags"),
        ])
        .unwrap_err();
        assert_eq!(
            err,
            RegisterError::Overlap {
                first: "0 (temp)".into(),
                second: "1 (flags)".into()
            }
        );

        let mut map = RegisterMap::new();
        map.push(RegisterDefinition::new(100, DataType::UInt32)).unwrap();
        assert!(map.push(RegisterDefinition::new(101, DataType::UInt16)).is_err());
        assert!(map.push(RegisterDefinition::new(99, DataType::UInt32)).is_err());
        assert_eq!(map.push(RegisterDefinition::new(102, DataType::UInt16)), Ok(1));
    }

    #[test]
    fn overlap_is_per_unit() {
        let map = RegisterMap::from_definitions(vec![
            RegisterDefinition::new(100, DataType::Float32),
            RegisterDefinition::new(100, DataType::Float32).unit(2),
            RegisterDefinition::new(101, DataType::UInt16).unit(3),
        ])
        .unwrap();
        assert_eq!(map.len(), 3);
        assert_eq!(map.find_covering(None, 101).map(|(i, _)| i), Some(0));
        assert_eq!(map.find_covering(Some(3), 101).map(|(i, _)| i), Some(2));
        assert!(map.find_covering(Some(2), 102).is_none());

        assert!(RegisterMap::from_definitions(vec![
            RegisterDefinition::new(100, DataType::Float32).unit(2),
            RegisterDefinition::new(101, DataType::UInt16).unit(2),
        ])
        .is_err());
    }

    #[test]
    fn unit_and_fast_poll_fields() {
        assert!(matches!(
            RegisterDefinition::new(1, DataType::UInt16).unit(0).validate(),
            Err(RegisterError::BadUnit { address: 1, unit: 0 })
        ));
        assert!(RegisterDefinition::new(1, DataType::UInt16).unit(248).validate().is_err());

        let def = RegisterDefinition::new(1, DataType::UInt16);
        assert_eq!(def.unit_or(9), 9);
        let json = serde_json::to_value(&def).unwrap();
        assert!(json.get("unit").is_none());
        assert!(json.get("fast_poll").is_none());

        let def: RegisterDefinition =
            serde_json::from_str(r#"{"address": 1, "unit": 5, "fast_poll": true}"#).unwrap();
        assert_eq!(def.unit_or(9), 5);
        assert!(def.fast_poll);
    }

    #[test]
    fn map_keeps_insertion_order() {
        let mut map = RegisterMap::from_definitions(vec![
            RegisterDefinition::new(30, DataType::UInt16),
            RegisterDefinition::new(10, DataType::UInt16),
            RegisterDefinition::new(20, DataType::UInt16),
        ])
        .unwrap();
        let order: Vec<u16> = map.iter().map(Register::address).collect();
        assert_eq!(order, vec![30, 10, 20]);

        assert_eq!(map.find_by_address(20).map(|(i, _)| i), Some(2));
        map.replace(0, RegisterDefinition::new(31, DataType::Int16))
            .unwrap();
        assert!(map
            .replace(1, RegisterDefinition::new(20, DataType::UInt16))
            .is_err());
        assert_eq!(map.remove(1).map(|d| d.address), Some(10));
        assert_eq!(map.remove(5), None);
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn scale_decodes_then_evaluates() {
        let reg = Register::new(
            RegisterDefinition::new(40001, DataType::Float32).expression("value * 2"),
        )
        .unwrap();
        assert_eq!(reg.scale(&[0x4248, 0x0000]), Ok(100.0));
        assert!(matches!(
            reg.scale(&[0x4248]),
            Err(RegisterFault::Decode(_))
        ));

        let reg = Register::new(RegisterDefinition::new(0, DataType::UInt16).expression("10 / value"))
            .unwrap();
        assert!(matches!(
            reg.scale(&[0]),
            Err(RegisterFault::Expression(
                ExpressionError::NotFinite | ExpressionError::DivisionByZero
            ))
        ));
    }

    #[test]
    fn render_formats() {
        assert_eq!(Format::Hex.render(255.0, RegSize::Single), "0x00FF");
        assert_eq!(Format::Hex.render(-1.0, RegSize::Single), "0xFFFF");
        assert_eq!(Format::Hex.render(65536.0, RegSize::Double), "0x00010000");
        assert_eq!(Format::Binary.render(5.0, RegSize::Single), "0000000000000101");
        assert_eq!(Format::Decimal.render(42.0, RegSize::Single), "42");
        assert_eq!(Format::Decimal.render(-2.5, RegSize::Single), "-2.5");
        assert_eq!(Format::Decimal.render(1.0 / 3.0, RegSize::Double), "0.3333");
    }

    #[test]
    fn definition_defaults_from_json() {
        let def: RegisterDefinition = serde_json::from_str(r#"{"address": 7}"#).unwrap();
        assert_eq!(def, RegisterDefinition::new(7, DataType::UInt16));
        assert!(serde_json::from_str::<RegisterDefinition>(r#"{"address": 7, "size": 3}"#).is_err());

        let json = serde_json::to_value(
            RegisterDefinition::new(1, DataType::Float32).access(Access::R),
        )
        .unwrap();
        assert_eq!(json["size"], 2);
        assert_eq!(json["access"], "read");
        assert_eq!(json["data_type"], "float32");
    }
}
