use std::time::Duration;

use async_trait::async_trait;
use log::debug;

use super::rtu::{self, FunctionCode};
use super::{Protocol, ProtocolError, Result};
use crate::transport::Transport;

pub struct RtuMaster {
    transport: Box<dyn Transport>,
    timeout: Duration,
}

impl RtuMaster {
    pub fn new(transport: Box<dyn Transport>, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    async fn read(
        &mut self,
        function: FunctionCode,
        unit: u8,
        address: u16,
        count: u16,
        limit: Duration,
    ) -> Result<Vec<u16>> {
        check_unit(unit)?;
        check_span(address, count, rtu::MAX_READ_WORDS)?;

        debug!("read {} {:?} {} {}", unit, function, address, count);
        let request = rtu::read_request(unit, function, address, count);
        let frame = self.transport.exchange(&request, limit).await?;
        let payload = rtu::decode_response(&frame, unit, function)?;

        let byte_count = 2 * count as usize;
        if payload.len() != 1 + byte_count || payload[0] as usize != byte_count {
            return Err(ProtocolError::Framing(format!(
                "expected {} data bytes, received {}",
                byte_count, payload[0]
            )));
        }

        Ok(payload[1..]
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect())
    }
}

fn check_unit(unit: u8) -> Result<()> {
    match unit {
        1..=247 => Ok(()),
        _ => Err(ProtocolError::InvalidRequest(format!(
            "unit id {} is outside 1..=247",
            unit
        ))),
    }
}

fn check_span(address: u16, count: u16, max: u16) -> Result<()> {
    if count == 0 || count > max {
        return Err(ProtocolError::InvalidRequest(format!(
            "register count {} is outside 1..={}",
            count, max
        )));
    }

    if address as u32 + count as u32 - 1 > u16::MAX as u32 {
        return Err(ProtocolError::InvalidRequest(format!(
            "{} registers at {} run past the end of the address space",
            count, address
        )));
    }

    Ok(())
}

#[async_trait]
impl Protocol for RtuMaster {
    async fn read_registers(&mut self, unit: u8, address: u16, count: u16) -> Result<Vec<u16>> {
        self.read(FunctionCode::ReadHoldingRegisters, unit, address, count, self.timeout)
            .await
    }

    async fn read_input_registers(
        &mut self,
        unit: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>> {
        self.read(FunctionCode::ReadInputRegisters, unit, address, count, self.timeout)
            .await
    }

    async fn write_registers(&mut self, unit: u8, address: u16, words: &[u16]) -> Result<()> {
        check_unit(unit)?;
        if words.len() > rtu::MAX_WRITE_WORDS as usize {
            return Err(ProtocolError::InvalidRequest(format!(
                "{} words exceed a single write",
                words.len()
            )));
        }
        check_span(address, words.len() as u16, rtu::MAX_WRITE_WORDS)?;

        debug!("write {} {} {:04X?}", unit, address, words);
        let (function, request, echo) = match words {
            [word] => (
                FunctionCode::WriteSingleRegister,
                rtu::write_single_request(unit, address, *word),
                (address, *word),
            ),
            _ => (
                FunctionCode::WriteMultipleRegisters,
                rtu::write_multiple_request(unit, address, words),
                (address, words.len() as u16),
            ),
        };

        let frame = self.transport.exchange(&request, self.timeout).await?;
        let payload = rtu::decode_response(&frame, unit, function)?;

        if payload.len() != 4 {
            return Err(ProtocolError::Framing(format!(
                "write echo has {} bytes",
                payload.len()
            )));
        }
        let received = (
            u16::from_be_bytes([payload[0], payload[1]]),
            u16::from_be_bytes([payload[2], payload[3]]),
        );
        if received != echo {
            return Err(ProtocolError::Framing(format!(
                "write echo mismatch: expected {:04X?}, received {:04X?}",
                echo, received
            )));
        }

        Ok(())
    }

    async fn scan(&mut self, units: &[u8], address: u16, limit: Duration) -> Result<Vec<u8>> {
        let mut found = Vec::new();

        for &unit in units {
            debug!("scanning unit {}", unit);
            match self
                .read(FunctionCode::ReadHoldingRegisters, unit, address, 1, limit)
                .await
            {
                Ok(_) => found.push(unit),
                Err(e) if e.is_device_exception() => found.push(unit),
                Err(e) if e.is_connection() => return Err(e),
                Err(e) => debug!("unit {}: {}", unit, e),
            }
        }

        Ok(found)
    }

    async fn close(&mut self) {
        self.transport.close().await
    }

    fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}
