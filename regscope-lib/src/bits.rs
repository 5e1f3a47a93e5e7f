//! Named single bits of 16-bit register words, e.g. status flags.

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use thiserror::Error;

use crate::sample::Sample;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BitError {
    #[error("bit name must not be empty")]
    EmptyName,
    #[error("bit {name}: index {index} outside 0..=15")]
    BadIndex { name: String, index: u8 },
    #[error("bit {name}: unit id {unit} outside 1..=247")]
    BadUnit { name: String, unit: u8 },
    #[error("bit {0} is defined twice")]
    Duplicate(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitDefinition {
    pub name: String,
    pub register_address: u16,
    pub bit_index: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<u8>,
    #[serde(default)]
    pub label: String,
}

impl BitDefinition {
    pub fn new(name: &str, register_address: u16, bit_index: u8) -> Self {
        BitDefinition {
            name: name.to_string(),
            register_address,
            bit_index,
            unit: None,
            label: String::new(),
        }
    }

    pub fn label(mut self, label: &str) -> Self {
        self.label = label.to_string();
        self
    }

    pub fn unit(mut self, unit: u8) -> Self {
        self.unit = Some(unit);
        self
    }

    pub fn validate(&self) -> Result<(), BitError> {
        if self.name.trim().is_empty() {
            return Err(BitError::EmptyName);
        }
        if self.bit_index > 15 {
            return Err(BitError::BadIndex {
                name: self.name.clone(),
                index: self.bit_index,
            });
        }
        match self.unit {
            Some(unit) if !(1..=247).contains(&unit) => Err(BitError::BadUnit {
                name: self.name.clone(),
                unit,
            }),
            _ => Ok(()),
        }
    }

    pub fn mask(&self) -> u16 {
        1 << (self.bit_index & 0x0F)
    }

    pub fn extract(&self, word: u16) -> bool {
        word & self.mask() != 0
    }

    /// `word` with this bit set or cleared.
    pub fn apply(&self, word: u16, on: bool) -> u16 {
        if on {
            word | self.mask()
        } else {
            word & !self.mask()
        }
    }

    /// Short address of the bit, `D<unit>.R<address>.B<index>`.
    pub fn designator(&self, default_unit: u8) -> String {
        format!(
            "D{}.R{}.B{}",
            self.unit.unwrap_or(default_unit),
            self.register_address,
            self.bit_index
        )
    }

    /// The bit's state in the first of `samples` covering its word.
    pub fn read(&self, samples: &[Sample], default_unit: u8) -> Option<bool> {
        let unit = self.unit.unwrap_or(default_unit);
        samples
            .iter()
            .filter(|s| s.unit == unit)
            .find_map(|s| s.bit(self.register_address, self.bit_index))
    }
}

impl Display for BitDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:<16} R{}.B{:<2} {}",
            self.name, self.register_address, self.bit_index, self.label
        )
    }
}

/// Validates every bit and checks that names are unique.
pub fn validate_all(bits: &[BitDefinition]) -> Result<(), BitError> {
    let mut names = std::collections::HashSet::new();
    for bit in bits {
        bit.validate()?;
        if !names.insert(bit.name.as_str()) {
            return Err(BitError::Duplicate(bit.name.clone()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DataType;
    use crate::regs::{Register, RegisterDefinition};

    #[test]
    fn extract_and_apply() {
        let alarm = BitDefinition::new("alarm", 100, 3);
        assert!(alarm.extract(0b1000));
        assert!(!alarm.extract(0b0111));
        assert_eq!(alarm.apply(0x0001, true), 0x0009);
        assert_eq!(alarm.apply(0xFFFF, false), 0xFFF7);
        assert_eq!(alarm.apply(0x0008, true), 0x0008);

        let top = BitDefinition::new("top", 100, 15);
        assert!(top.extract(0x8000));
        assert_eq!(top.apply(0, true), 0x8000);
    }

    #[test]
    fn designator_uses_the_default_unit() {
        let bit = BitDefinition::new("run", 40001, 0);
        assert_eq!(bit.designator(1), "D1.R40001.B0");
        assert_eq!(bit.unit(5).designator(1), "D5.R40001.B0");
    }

    #[test]
    fn validation() {
        assert!(BitDefinition::new("ok", 0, 15).validate().is_ok());
        assert_eq!(
            BitDefinition::new("bad", 0, 16).validate(),
            Err(BitError::BadIndex {
                name: "bad".into(),
                index: 16
            })
        );
        assert_eq!(BitDefinition::new(" ", 0, 0).validate(), Err(BitError::EmptyName));
        assert!(BitDefinition::new("x", 0, 0).unit(0).validate().is_err());

        let bits = vec![BitDefinition::new("a", 0, 0), BitDefinition::new("a", 1, 0)];
        assert_eq!(validate_all(&bits), Err(BitError::Duplicate("a".into())));
    }

    #[test]
    fn read_from_samples() {
        let status = Register::new(RegisterDefinition::new(7, DataType::UInt16)).unwrap();
        let samples = vec![
            Sample::ok(1, 0, 2, &status, vec![0x0000], 0.0),
            Sample::ok(1, 1, 1, &status, vec![0x0004], 4.0),
        ];

        let bit = BitDefinition::new("ready", 7, 2);
        assert_eq!(bit.read(&samples, 1), Some(true));
        assert_eq!(bit.clone().unit(2).read(&samples, 1), Some(false));
        assert_eq!(bit.unit(3).read(&samples, 1), None);
        assert_eq!(BitDefinition::new("other", 8, 0).read(&samples, 1), None);
    }

    #[test]
    fn json_shape() {
        let bit: BitDefinition =
            serde_json::from_str(r#"{"name": "pump", "register_address": 3, "bit_index": 1}"#)
                .unwrap();
        assert_eq!(bit, BitDefinition::new("pump", 3, 1));
        assert!(serde_json::to_value(&bit).unwrap().get("unit").is_none());
    }
}
