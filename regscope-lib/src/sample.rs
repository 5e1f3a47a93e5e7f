//! Values published by the poll scheduler, one per register and cycle.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Display;

use crate::protocol::ProtocolError;
use crate::regs::{Register, RegisterFault};

/// Classification of everything that can keep a register from producing a
/// value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connection,
    Timeout,
    Framing,
    Crc,
    IllegalFunction,
    IllegalAddress,
    IllegalValue,
    SlaveDeviceFailure,
    Exception(u8),
    InvalidRequest,
    Expression,
    Decode,
}

impl ErrorKind {
    /// Worth retrying as is on the next cycle.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorKind::Connection | ErrorKind::Timeout | ErrorKind::Framing | ErrorKind::Crc
        )
    }

    pub fn is_device_exception(&self) -> bool {
        matches!(
            self,
            ErrorKind::IllegalFunction
                | ErrorKind::IllegalAddress
                | ErrorKind::IllegalValue
                | ErrorKind::SlaveDeviceFailure
                | ErrorKind::Exception(_)
        )
    }

    /// Caused by the register definition rather than by the device or line.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            ErrorKind::InvalidRequest | ErrorKind::Expression | ErrorKind::Decode
        )
    }
}

impl From<&ProtocolError> for ErrorKind {
    fn from(e: &ProtocolError) -> Self {
        match e {
            ProtocolError::IllegalFunction => ErrorKind::IllegalFunction,
            ProtocolError::IllegalAddress => ErrorKind::IllegalAddress,
            ProtocolError::IllegalValue => ErrorKind::IllegalValue,
            ProtocolError::SlaveDeviceFailure => ErrorKind::SlaveDeviceFailure,
            ProtocolError::Exception(code) => ErrorKind::Exception(*code),
            ProtocolError::Timeout(_) => ErrorKind::Timeout,
            ProtocolError::Crc { .. } => ErrorKind::Crc,
            ProtocolError::Framing(_) => ErrorKind::Framing,
            ProtocolError::Connection(_) => ErrorKind::Connection,
            ProtocolError::InvalidRequest(_) => ErrorKind::InvalidRequest,
        }
    }
}

impl From<&RegisterFault> for ErrorKind {
    fn from(e: &RegisterFault) -> Self {
        match e {
            RegisterFault::Decode(_) => ErrorKind::Decode,
            RegisterFault::Expression(_) => ErrorKind::Expression,
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Connection => "connection".fmt(f),
            ErrorKind::Timeout => "timeout".fmt(f),
            ErrorKind::Framing => "framing".fmt(f),
            ErrorKind::Crc => "crc".fmt(f),
            ErrorKind::IllegalFunction => "illegal function".fmt(f),
            ErrorKind::IllegalAddress => "illegal address".fmt(f),
            ErrorKind::IllegalValue => "illegal value".fmt(f),
            ErrorKind::SlaveDeviceFailure => "device failure".fmt(f),
            ErrorKind::Exception(code) => write!(f, "exception {:#04x}", code),
            ErrorKind::InvalidRequest => "invalid request".fmt(f),
            ErrorKind::Expression => "expression".fmt(f),
            ErrorKind::Decode => "decode".fmt(f),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleStatus {
    Ok,
    Error(ErrorKind),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    pub cycle: u64,
    /// Position of the register in the map.
    pub index: usize,
    pub unit: u8,
    pub address: u16,
    pub label: String,
    pub raw: Vec<u16>,
    pub value: Option<f64>,
    pub timestamp: DateTime<Utc>,
    pub status: SampleStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Sample {
    pub fn ok(
        cycle: u64,
        index: usize,
        unit: u8,
        register: &Register,
        raw: Vec<u16>,
        value: f64,
    ) -> Self {
        Sample {
            cycle,
            index,
            unit,
            address: register.address(),
            label: register.definition().label.clone(),
            raw,
            value: Some(value),
            timestamp: Utc::now(),
            status: SampleStatus::Ok,
            message: None,
        }
    }

    pub fn error(
        cycle: u64,
        index: usize,
        unit: u8,
        register: &Register,
        raw: Vec<u16>,
        kind: ErrorKind,
        message: String,
    ) -> Self {
        Sample {
            cycle,
            index,
            unit,
            address: register.address(),
            label: register.definition().label.clone(),
            raw,
            value: None,
            timestamp: Utc::now(),
            status: SampleStatus::Error(kind),
            message: Some(message),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == SampleStatus::Ok
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self.status {
            SampleStatus::Ok => None,
            SampleStatus::Error(kind) => Some(kind),
        }
    }

    /// The raw word read at `address`, when this sample covers it.
    pub fn word_at(&self, address: u16) -> Option<u16> {
        let offset = address.checked_sub(self.address)?;
        self.raw.get(offset as usize).copied()
    }

    /// Bit `bit` (0 = least significant) of the word at `address`.
    pub fn bit(&self, address: u16, bit: u8) -> Option<bool> {
        if bit > 15 {
            return None;
        }
        self.word_at(address).map(|word| (word >> bit) & 1 == 1)
    }
}

impl Display for Sample {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:5} {:<16} ", self.address, self.label)?;
        match (&self.status, self.value) {
            (SampleStatus::Ok, Some(value)) => write!(f, "{}", value),
            (SampleStatus::Error(kind), _) => match &self.message {
                Some(message) => write!(f, "<{}: {}>", kind, message),
                None => write!(f, "<{}>", kind),
            },
            (SampleStatus::Ok, None) => "-".fmt(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DataType;
    use crate::expr::ExpressionError;
    use crate::regs::RegisterDefinition;
    use std::time::Duration;

    #[test]
    fn classification() {
        let timeout = ErrorKind::from(&ProtocolError::Timeout(Duration::from_millis(1)));
        assert!(timeout.is_transient());
        assert!(!timeout.is_configuration());

        let exception = ErrorKind::from(&ProtocolError::Exception(0x0B));
        assert_eq!(exception, ErrorKind::Exception(0x0B));
        assert!(exception.is_device_exception());
        assert!(!exception.is_transient());

        let fault = ErrorKind::from(&RegisterFault::Expression(ExpressionError::NotFinite));
        assert!(fault.is_configuration());
    }

    #[test]
    fn serialize_sample() {
        let register =
            Register::new(RegisterDefinition::new(7, DataType::Int16).label("temp")).unwrap();
        let sample = Sample::error(
            3,
            0,
            1,
            &register,
            vec![],
            ErrorKind::IllegalAddress,
            "illegal data address".into(),
        );
        let json = serde_json::to_value(&sample).unwrap();
        assert_eq!(json["status"]["error"], "illegal_address");
        assert_eq!(json["value"], serde_json::Value::Null);
        assert_eq!(json["label"], "temp");

        let sample = Sample::ok(3, 0, 1, &register, vec![0xFFFF], -1.0);
        let json = serde_json::to_value(&sample).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["unit"], 1);
        assert!(json.get("message").is_none());
        assert_eq!(sample.to_string(), "    7 temp             -1");
    }

    #[test]
    fn bits_from_raw_words() {
        let register =
            Register::new(RegisterDefinition::new(10, DataType::UInt32)).unwrap();
        let sample = Sample::ok(0, 0, 1, &register, vec![0x8001, 0x0004], 0.0);
        assert_eq!(sample.word_at(11), Some(0x0004));
        assert_eq!(sample.word_at(12), None);
        assert_eq!(sample.word_at(9), None);
        assert_eq!(sample.bit(10, 0), Some(true));
        assert_eq!(sample.bit(10, 15), Some(true));
        assert_eq!(sample.bit(10, 1), Some(false));
        assert_eq!(sample.bit(11, 2), Some(true));
        assert_eq!(sample.bit(10, 16), None);
    }
}
