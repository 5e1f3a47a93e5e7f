use anyhow::Result;
pub use clap::StructOpt;
use clap::{Parser, Subcommand};
use hex::FromHex;
use lazy_static::lazy_static;
use regex::Regex;
use std::cmp;
use std::ops::Deref;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

use regscope_lib::codec::{ByteOrder, DataType};
use regscope_lib::project::Project;
use regscope_lib::regs::RegisterDefinition;
use regscope_lib::session::{ConnectionSettings, Parity};

#[derive(Error, Debug)]
pub enum RangeError {
    #[error("invalid range '{0}'")]
    BadRange(String),
    #[error("invalid register '{0}', expected ADDRESS[:TYPE[:ORDER]]")]
    BadRegister(String),
    #[error("invalid word list '{0}', expected ADDRESS:HEXWORDS")]
    BadWords(String),
    #[error("invalid bit state '{0}', expected on or off")]
    BadSwitch(String),
}

#[derive(Debug)]
pub struct IdRange(Vec<u8>);

impl Deref for IdRange {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl FromStr for IdRange {
    type Err = RangeError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        lazy_static! {
            static ref RE: Regex = Regex::new(r"^(\d+)(?:-(\d+))?$").unwrap();
        }

        let mut result: Vec<u8> = Vec::new();

        for s in input.split(',') {
            let c = RE
                .captures(s)
                .ok_or_else(|| RangeError::BadRange(s.to_string()))?;
            let parse = |m: Option<regex::Match>| {
                m.map(|m| m.as_str().parse::<u8>())
                    .transpose()
                    .map_err(|_| RangeError::BadRange(s.to_string()))
            };

            match (parse(c.get(1))?, parse(c.get(2))?) {
                (Some(val1), Some(val2)) => {
                    result.extend(cmp::min(val1, val2)..=cmp::max(val1, val2))
                }
                (Some(val), None) => result.push(val),
                _ => return Err(RangeError::BadRange(s.to_string())),
            }
        }

        result.sort_unstable();
        result.dedup();
        Ok(IdRange(result))
    }
}

/// An ad hoc register given on the command line, e.g. `40001:float32:little`.
#[derive(Debug, Clone)]
pub struct RegisterSpec {
    pub address: u16,
    pub data_type: DataType,
    pub byte_order: ByteOrder,
}

impl FromStr for RegisterSpec {
    type Err = RangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        lazy_static! {
            static ref RE: Regex =
                Regex::new(r"^(0x[0-9a-fA-F]+|0b[01]+|\d+)(?::(\w+))?(?::(\w+))?$").unwrap();
        }

        let bad = || RangeError::BadRegister(s.to_string());
        let c = RE.captures(s).ok_or_else(bad)?;

        Ok(RegisterSpec {
            address: parse_with_radix(&c[1]).map_err(|_| bad())?,
            data_type: c
                .get(2)
                .map(|m| m.as_str().parse::<DataType>())
                .transpose()
                .map_err(|_| bad())?
                .unwrap_or_default(),
            byte_order: c
                .get(3)
                .map(|m| m.as_str().parse::<ByteOrder>())
                .transpose()
                .map_err(|_| bad())?
                .unwrap_or_default(),
        })
    }
}

impl From<&RegisterSpec> for RegisterDefinition {
    fn from(spec: &RegisterSpec) -> Self {
        RegisterDefinition::new(spec.address, spec.data_type).byte_order(spec.byte_order)
    }
}

/// Raw words for one write, e.g. `100:42480000`.
#[derive(Debug)]
pub struct WordSpec {
    pub address: u16,
    pub words: Vec<u16>,
}

impl FromStr for WordSpec {
    type Err = RangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        lazy_static! {
            static ref RE: Regex =
                Regex::new(r"^(0x[0-9a-fA-F]+|\d+):((?:[0-9a-fA-F]{4})+)$").unwrap();
        }

        let bad = || RangeError::BadWords(s.to_string());
        let c = RE.captures(s).ok_or_else(bad)?;
        let bytes = Vec::from_hex(&c[2]).map_err(|_| bad())?;

        Ok(WordSpec {
            address: parse_with_radix(&c[1]).map_err(|_| bad())?,
            words: bytes
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect(),
        })
    }
}

pub fn parse_switch(input: &str) -> Result<bool, RangeError> {
    match input.to_ascii_lowercase().as_str() {
        "on" | "1" | "true" | "set" => Ok(true),
        "off" | "0" | "false" | "clear" => Ok(false),
        _ => Err(RangeError::BadSwitch(input.to_string())),
    }
}

pub fn parse_with_radix<T>(input: &str) -> Result<T, T::FromStrRadixErr>
where
    T: num::Num,
    <T as num::Num>::FromStrRadixErr: std::error::Error + Send + Sync,
{
    if input.starts_with("0x") {
        T::from_str_radix(input.trim_start_matches("0x"), 16)
    } else if input.starts_with("0b") {
        T::from_str_radix(input.trim_start_matches("0b"), 2)
    } else {
        T::from_str_radix(input, 10)
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    /// Skip sanity checks
    #[clap(long, short)]
    pub force: bool,

    /// enable debug output
    #[clap(long, short)]
    pub debug: bool,

    /// Project file providing connection settings and registers
    #[clap(long, short = 'P')]
    pub project: Option<PathBuf>,

    /// UART device or 'auto' [default: auto]
    #[clap(long, short)]
    pub port: Option<String>,

    /// UART baud rate [default: 9600]
    #[clap(long, short)]
    pub baudrate: Option<u32>,

    /// Parity: N, E or O [default: N]
    #[clap(long)]
    pub parity: Option<Parity>,

    /// Stop bits: 1 or 2 [default: 1]
    #[clap(long)]
    pub stop_bits: Option<u8>,

    /// Modbus unit id [default: 1]
    #[clap(long, short, parse(try_from_str=parse_with_radix))]
    pub unit: Option<u8>,

    /// Response timeout in seconds [default: 1.0]
    #[clap(long, short)]
    pub timeout: Option<f64>,

    /// Use json-formatted output
    #[clap(long, short)]
    pub json: bool,

    #[clap(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Connection settings from the project, overridden by the flags given.
    pub fn settings(&self, project: Option<&Project>) -> ConnectionSettings {
        let mut settings = project
            .map(|p| p.connection.clone())
            .unwrap_or_default();

        if let Some(port) = &self.port {
            settings.port = port.clone();
        }
        if settings.port.is_empty() {
            settings.port = "auto".to_string();
        }
        if let Some(baudrate) = self.baudrate {
            settings.baud_rate = baudrate;
        }
        if let Some(parity) = self.parity {
            settings.parity = parity;
        }
        if let Some(stop_bits) = self.stop_bits {
            settings.stop_bits = stop_bits;
        }
        if let Some(unit) = self.unit {
            settings.slave_id = unit;
        }
        if let Some(timeout) = self.timeout {
            settings.timeout = timeout;
        }
        settings
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List serial ports
    ListPorts,

    /// Scan for responding unit ids
    Scan {
        #[clap(default_value = "1-247")]
        units: IdRange,
        /// Register read from every unit
        #[clap(long, short, default_value_t = 0, parse(try_from_str=parse_with_radix))]
        address: u16,
    },

    /// Read typed values, e.g. 100:float32:little
    Read {
        #[clap(required = true)]
        registers: Vec<RegisterSpec>,
    },

    /// Read raw 16-bit words
    #[clap(visible_alias = "readw")]
    ReadWords {
        #[clap(parse(try_from_str=parse_with_radix))]
        address: u16,
        #[clap(default_value_t = 1, parse(try_from_str=parse_with_radix))]
        count: u16,
        /// Read input registers (0x04) instead of holding registers
        #[clap(long, short)]
        input: bool,
    },

    /// Write a typed value
    Write {
        register: RegisterSpec,
        #[clap(allow_hyphen_values = true)]
        value: f64,
    },

    /// Write raw 16-bit words, e.g. 100:42480000
    #[clap(visible_alias = "writew")]
    WriteWords {
        #[clap(required = true)]
        specs: Vec<WordSpec>,
    },

    /// Write an engineering value to a project register, by index or label
    Set {
        register: String,
        #[clap(allow_hyphen_values = true)]
        value: f64,
        /// Bypass the register expression
        #[clap(long, short)]
        raw: bool,
    },

    /// Poll registers until interrupted
    Poll {
        /// Registers to poll instead of the project ones
        registers: Vec<RegisterSpec>,
        /// Stop after this many cycles
        #[clap(long, short)]
        count: Option<u64>,
        /// Milliseconds between cycles
        #[clap(long, short)]
        interval: Option<u64>,
    },

    /// Read the named bits of the project
    Bits,

    /// Set or clear a named bit of the project
    SetBit {
        bit: String,
        /// on or off
        #[clap(parse(try_from_str=parse_switch))]
        state: bool,
    },

    /// Validate the project and list its registers, variables and bits
    Check,

    /// Save connection settings and registers as a project file
    Export {
        path: PathBuf,
        registers: Vec<RegisterSpec>,
    },
}
