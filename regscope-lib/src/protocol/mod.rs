pub mod master;
pub mod rtu;
pub mod slave;

use std::time::Duration;

use async_trait::async_trait;
use num_traits::FromPrimitive;
use thiserror::Error;

use crate::transport::{Transport, TransportError};
use rtu::ExceptionCode;

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("illegal function")]
    IllegalFunction,
    #[error("illegal data address")]
    IllegalAddress,
    #[error("illegal data value")]
    IllegalValue,
    #[error("slave device failure")]
    SlaveDeviceFailure,
    #[error("device exception {0:#04x}")]
    Exception(u8),
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("crc mismatch: expected {expected:#06x}, received {received:#06x}")]
    Crc { expected: u16, received: u16 },
    #[error("corrupted response: {0}")]
    Framing(String),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ProtocolError {
    pub fn from_exception(code: u8) -> Self {
        match ExceptionCode::from_u8(code) {
            Some(ExceptionCode::IllegalFunction) => ProtocolError::IllegalFunction,
            Some(ExceptionCode::IllegalDataAddress) => ProtocolError::IllegalAddress,
            Some(ExceptionCode::IllegalDataValue) => ProtocolError::IllegalValue,
            Some(ExceptionCode::SlaveDeviceFailure) => ProtocolError::SlaveDeviceFailure,
            _ => ProtocolError::Exception(code),
        }
    }

    /// The device answered, only with an exception.
    pub fn is_device_exception(&self) -> bool {
        matches!(
            self,
            ProtocolError::IllegalFunction
                | ProtocolError::IllegalAddress
                | ProtocolError::IllegalValue
                | ProtocolError::SlaveDeviceFailure
                | ProtocolError::Exception(_)
        )
    }

    /// The line itself is gone; further exchanges are pointless.
    pub fn is_connection(&self) -> bool {
        matches!(self, ProtocolError::Connection(_))
    }
}

impl From<TransportError> for ProtocolError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Timeout(limit) => ProtocolError::Timeout(limit),
            TransportError::Framing(reason) => ProtocolError::Framing(reason),
            TransportError::Closed => ProtocolError::Connection("transport is closed".into()),
            TransportError::Io(e) => ProtocolError::Connection(e.to_string()),
        }
    }
}

#[async_trait]
pub trait Protocol: Send {
    /// Reads `count` holding registers (function 0x03).
    async fn read_registers(&mut self, unit: u8, address: u16, count: u16) -> Result<Vec<u16>>;

    /// Reads `count` input registers (function 0x04).
    async fn read_input_registers(
        &mut self,
        unit: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>>;

    /// Writes `words` starting at `address`, with function 0x06 for a single
    /// word and 0x10 otherwise.
    async fn write_registers(&mut self, unit: u8, address: u16, words: &[u16]) -> Result<()>;

    /// Scans `units` by reading one register at `address` and returns the
    /// ids that answered, with data or with an exception.
    async fn scan(&mut self, units: &[u8], address: u16, limit: Duration) -> Result<Vec<u8>>;

    async fn close(&mut self);

    fn is_open(&self) -> bool;

    fn timeout(&self) -> Duration;
}

pub fn make_protocol(transport: Box<dyn Transport>, timeout: Duration) -> Box<dyn Protocol> {
    Box::new(master::RtuMaster::new(transport, timeout))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exception_codes() {
        assert_eq!(ProtocolError::from_exception(0x01), ProtocolError::IllegalFunction);
        assert_eq!(ProtocolError::from_exception(0x02), ProtocolError::IllegalAddress);
        assert_eq!(ProtocolError::from_exception(0x03), ProtocolError::IllegalValue);
        assert_eq!(ProtocolError::from_exception(0x04), ProtocolError::SlaveDeviceFailure);
        assert_eq!(ProtocolError::from_exception(0x06), ProtocolError::Exception(0x06));
        assert_eq!(ProtocolError::from_exception(0x42), ProtocolError::Exception(0x42));
        assert!(ProtocolError::Exception(0x42).is_device_exception());
        assert!(!ProtocolError::Timeout(Duration::ZERO).is_device_exception());
    }

    #[test]
    fn transport_errors() {
        let e: ProtocolError = TransportError::Closed.into();
        assert!(e.is_connection());
        let e: ProtocolError = TransportError::Timeout(Duration::from_millis(5)).into();
        assert_eq!(e, ProtocolError::Timeout(Duration::from_millis(5)));
    }
}
