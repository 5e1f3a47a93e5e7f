//! Modbus RTU frame layout: `unit | function | payload | crc16 (LE)`.

use crc::{Crc, CRC_16_MODBUS};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;

use super::ProtocolError;

pub const MAX_FRAME_LEN: usize = 256;
pub const HEADER_LEN: usize = 3;
pub const MAX_READ_WORDS: u16 = 125;
pub const MAX_WRITE_WORDS: u16 = 123;
pub const EXCEPTION_FLAG: u8 = 0x80;

const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum FunctionCode {
    ReadHoldingRegisters = 0x03,
    ReadInputRegisters = 0x04,
    WriteSingleRegister = 0x06,
    WriteMultipleRegisters = 0x10,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum ExceptionCode {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    SlaveDeviceFailure = 0x04,
    Acknowledge = 0x05,
    SlaveDeviceBusy = 0x06,
    GatewayPathUnavailable = 0x0A,
    GatewayTargetFailed = 0x0B,
}

pub fn crc16(data: &[u8]) -> u16 {
    MODBUS_CRC.checksum(data)
}

pub fn encode_frame(buffer: &mut [u8], unit: u8, function: u8, params: &[u8]) -> usize {
    let len = 4 + params.len();
    assert!(len <= buffer.len());

    buffer[0] = unit;
    buffer[1] = function;
    buffer[2..2 + params.len()].copy_from_slice(params);

    let crc = crc16(&buffer[0..2 + params.len()]);
    buffer[2 + params.len()..len].copy_from_slice(&crc.to_le_bytes());
    len
}

fn frame(unit: u8, function: u8, params: &[u8]) -> Vec<u8> {
    let mut buffer = [0u8; MAX_FRAME_LEN];
    let len = encode_frame(&mut buffer, unit, function, params);
    buffer[..len].to_vec()
}

pub fn read_request(unit: u8, function: FunctionCode, address: u16, count: u16) -> Vec<u8> {
    frame(
        unit,
        function as u8,
        &[address.to_be_bytes(), count.to_be_bytes()].concat(),
    )
}

pub fn write_single_request(unit: u8, address: u16, word: u16) -> Vec<u8> {
    frame(
        unit,
        FunctionCode::WriteSingleRegister as u8,
        &[address.to_be_bytes(), word.to_be_bytes()].concat(),
    )
}

pub fn write_multiple_request(unit: u8, address: u16, words: &[u16]) -> Vec<u8> {
    let mut params = Vec::with_capacity(5 + 2 * words.len());
    params.extend_from_slice(&address.to_be_bytes());
    params.extend_from_slice(&(words.len() as u16).to_be_bytes());
    params.push((2 * words.len()) as u8);
    words
        .iter()
        .for_each(|word| params.extend_from_slice(&word.to_be_bytes()));
    frame(unit, FunctionCode::WriteMultipleRegisters as u8, &params)
}

pub fn exception_response(unit: u8, function: u8, code: ExceptionCode) -> Vec<u8> {
    frame(unit, function | EXCEPTION_FLAG, &[code as u8])
}

pub fn read_response(unit: u8, function: u8, words: &[u16]) -> Vec<u8> {
    let mut params = Vec::with_capacity(1 + 2 * words.len());
    params.push((2 * words.len()) as u8);
    words
        .iter()
        .for_each(|word| params.extend_from_slice(&word.to_be_bytes()));
    frame(unit, function, &params)
}

pub fn echo_response(unit: u8, function: u8, first: u16, second: u16) -> Vec<u8> {
    frame(
        unit,
        function,
        &[first.to_be_bytes(), second.to_be_bytes()].concat(),
    )
}

/// Total length of a response frame given its first [`HEADER_LEN`] bytes.
pub fn response_len(header: &[u8]) -> Result<usize, String> {
    let function = header[1];
    if function & EXCEPTION_FLAG != 0 {
        return Ok(5);
    }

    match FunctionCode::from_u8(function) {
        Some(FunctionCode::ReadHoldingRegisters) | Some(FunctionCode::ReadInputRegisters) => {
            let byte_count = header[2] as usize;
            if byte_count == 0 || byte_count % 2 != 0 || byte_count > 2 * MAX_READ_WORDS as usize {
                return Err(format!("bad byte count {}", byte_count));
            }
            Ok(5 + byte_count)
        }
        Some(FunctionCode::WriteSingleRegister) | Some(FunctionCode::WriteMultipleRegisters) => {
            Ok(8)
        }
        None => Err(format!("unexpected function code {:#04x}", function)),
    }
}

/// Checks CRC, unit echo and function echo; returns the payload between
/// the function code and the CRC.
pub fn decode_response(frame: &[u8], unit: u8, function: FunctionCode) -> Result<&[u8], ProtocolError> {
    if frame.len() < 5 {
        return Err(ProtocolError::Framing(format!(
            "frame too short ({} bytes)",
            frame.len()
        )));
    }

    let body = &frame[..frame.len() - 2];
    let expected = crc16(body);
    let received = u16::from_le_bytes([frame[frame.len() - 2], frame[frame.len() - 1]]);
    if expected != received {
        return Err(ProtocolError::Crc { expected, received });
    }

    if frame[0] != unit {
        return Err(ProtocolError::Framing(format!(
            "unit id mismatch: expected {}, received {}",
            unit, frame[0]
        )));
    }

    if frame[1] == function as u8 | EXCEPTION_FLAG {
        return Err(ProtocolError::from_exception(frame[2]));
    }

    if frame[1] != function as u8 {
        return Err(ProtocolError::Framing(format!(
            "function code mismatch: expected {:#04x}, received {:#04x}",
            function as u8, frame[1]
        )));
    }

    Ok(&body[2..])
}
