//! Polling and writing typed values on Modbus RTU field devices.

pub mod bits;
pub mod codec;
pub mod expr;
pub mod poll;
pub mod port;
pub mod project;
pub mod protocol;
pub mod regs;
pub mod sample;
pub mod session;
pub mod transport;
pub mod variables;
pub mod write;

#[cfg(test)]
mod testing;
