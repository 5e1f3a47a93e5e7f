use std::sync::Arc;

use log::{info, warn};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{oneshot, Notify};

use crate::bits::BitDefinition;
use crate::codec;
use crate::protocol::ProtocolError;
use crate::regs::{Register, RegisterMap};
use crate::session::{Link, Session};

/// An inverted value this close to an integer is taken as that integer.
const SNAP_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scaling {
    /// The value is in engineering units and goes through the inverse of
    /// the register expression.
    Engineering,
    /// The value is written as decoded, ignoring the expression.
    Raw,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WriteRequest {
    pub register: usize,
    pub value: f64,
    pub scaling: Scaling,
}

impl WriteRequest {
    pub fn engineering(register: usize, value: f64) -> Self {
        WriteRequest {
            register,
            value,
            scaling: Scaling::Engineering,
        }
    }

    pub fn raw(register: usize, value: f64) -> Self {
        WriteRequest {
            register,
            value,
            scaling: Scaling::Raw,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WriteAck {
    pub register: usize,
    pub address: u16,
    pub words: Vec<u16>,
    /// Words read back after the write, if the register is readable and the
    /// read succeeded.
    pub readback: Option<Vec<u16>>,
    pub verified: bool,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum WriteError {
    #[error("no register at index {0}")]
    UnknownRegister(usize),
    #[error("invalid value: {0}")]
    InvalidValue(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

pub type WriteResult = Result<WriteAck, WriteError>;

/// Validates writes against the register map and performs them on the
/// session's line, between the poll scheduler's reads.
#[derive(Clone)]
pub struct WriteCoordinator {
    link: Link,
    unit: u8,
    registers: Arc<RegisterMap>,
    waker: Option<Arc<Notify>>,
}

fn to_raw(register: &Register, request: &WriteRequest) -> Result<f64, WriteError> {
    let value = request.value;
    if !value.is_finite() {
        return Err(WriteError::InvalidValue(format!("{} is not a finite number", value)));
    }

    let raw = match request.scaling {
        Scaling::Raw => return Ok(value),
        Scaling::Engineering => register.expression().invert(value).ok_or_else(|| {
            WriteError::InvalidValue(format!(
                "expression '{}' cannot be inverted, write a raw value instead",
                register.expression()
            ))
        })?,
    };

    let snapped = raw.round();
    if register.definition().data_type.is_integer() && (raw - snapped).abs() < SNAP_EPSILON {
        Ok(snapped)
    } else {
        Ok(raw)
    }
}

impl WriteCoordinator {
    pub fn new(session: &Session) -> Self {
        WriteCoordinator {
            link: session.link(),
            unit: session.unit(),
            registers: session.registers(),
            waker: None,
        }
    }

    /// Notified after every successful write so that the next poll cycle
    /// shows its effect. A scheduler in backoff ignores it, see
    /// [`PollScheduler::waker`](crate::poll::PollScheduler::waker).
    pub fn with_waker(mut self, waker: Arc<Notify>) -> Self {
        self.waker = Some(waker);
        self
    }

    /// Checks `request` and encodes it, without touching the line.
    pub fn prepare(&self, request: &WriteRequest) -> Result<Vec<u16>, WriteError> {
        let register = self
            .registers
            .get(request.register)
            .ok_or(WriteError::UnknownRegister(request.register))?;
        let definition = register.definition();

        if !definition.access.is_writable() {
            return Err(WriteError::InvalidValue(format!(
                "register {} is read-only",
                definition.name()
            )));
        }

        let raw = to_raw(register, request)?;
        codec::encode(raw, definition.data_type, definition.byte_order)
            .map_err(|e| WriteError::InvalidValue(e.to_string()))
    }

    pub async fn write(&self, request: WriteRequest) -> WriteResult {
        let words = self.prepare(&request)?;
        let register = self
            .registers
            .get(request.register)
            .ok_or(WriteError::UnknownRegister(request.register))?;
        let address = register.address();
        let unit = register.unit_or(self.unit);

        let readback = {
            let mut link = self.link.lock().await;
            link.write_registers(unit, address, &words).await?;

            if register.definition().access.is_readable() {
                match link.read_registers(unit, address, register.count()).await {
                    Ok(words) => Some(words),
                    Err(e) => {
                        warn!("read-back of register {} failed: {}", address, e);
                        None
                    }
                }
            } else {
                None
            }
        };

        if let Some(waker) = &self.waker {
            waker.notify_one();
        }

        let verified = readback.as_deref() == Some(&words[..]);
        match &readback {
            Some(read) if !verified => warn!(
                "register {} reads back {:04X?} after writing {:04X?}",
                address, read, words
            ),
            _ => info!("wrote {:04X?} to register {}", words, address),
        }

        Ok(WriteAck {
            register: request.register,
            address,
            words,
            readback,
            verified,
        })
    }

    /// Runs [`write`](Self::write) on a task and delivers the result
    /// through the returned channel.
    pub fn submit(&self, request: WriteRequest) -> oneshot::Receiver<WriteResult> {
        let (tx, rx) = oneshot::channel();
        let this = self.clone();
        tokio::spawn(async move {
            // the caller may have lost interest
            let _ = tx.send(this.write(request).await);
        });
        rx
    }

    /// Sets or clears one bit with a read-modify-write of its word. The
    /// line stays locked in between, so polling cannot interleave. Returns
    /// the word written.
    pub async fn write_bit(&self, bit: &BitDefinition, on: bool) -> Result<u16, WriteError> {
        bit.validate()
            .map_err(|e| WriteError::InvalidValue(e.to_string()))?;
        let unit = bit.unit.unwrap_or(self.unit);
        let address = bit.register_address;

        let word = {
            let mut link = self.link.lock().await;
            let current = link.read_registers(unit, address, 1).await?;
            let word = bit.apply(current.first().copied().unwrap_or_default(), on);
            link.write_registers(unit, address, &[word]).await?;
            word
        };

        if let Some(waker) = &self.waker {
            waker.notify_one();
        }
        info!(
            "{} {} ({:04X} to register {})",
            if on { "set" } else { "cleared" },
            bit.designator(self.unit),
            word,
            address
        );
        Ok(word)
    }

    /// Writes `words` at `address` as is, outside the register map.
    pub async fn write_raw(&self, address: u16, words: &[u16]) -> Result<(), WriteError> {
        self.link
            .lock()
            .await
            .write_registers(self.unit, address, words)
            .await?;

        if let Some(waker) = &self.waker {
            waker.notify_one();
        }
        Ok(())
    }
}
