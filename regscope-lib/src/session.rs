//! Connection parameters, the register map and the shared line.

use log::info;
use serde::{Deserialize, Serialize};
use std::{fmt::Display, str::FromStr, sync::Arc, time::Duration};
use tokio::sync::Mutex;

use crate::port::{self, OpenPortError};
use crate::protocol::{make_protocol, Protocol};
use crate::regs::RegisterMap;
use crate::transport::{StreamTransport, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Parity {
    #[serde(rename = "N")]
    None,
    #[serde(rename = "E")]
    Even,
    #[serde(rename = "O")]
    Odd,
}

impl Default for Parity {
    fn default() -> Self {
        Parity::None
    }
}

impl Display for Parity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Parity::None => "N".fmt(f),
            Parity::Even => "E".fmt(f),
            Parity::Odd => "O".fmt(f),
        }
    }
}

impl FromStr for Parity {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.to_ascii_uppercase().as_str() {
            "N" | "NONE" => Ok(Parity::None),
            "E" | "EVEN" => Ok(Parity::Even),
            "O" | "ODD" => Ok(Parity::Odd),
            _ => Err(format!("invalid parity '{}'", input)),
        }
    }
}

fn default_slave_id() -> u8 {
    1
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_stop_bits() -> u8 {
    1
}

fn default_timeout() -> f64 {
    1.0
}

/// Longest response timeout accepted, in seconds.
pub const MAX_TIMEOUT: f64 = 3600.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSettings {
    #[serde(default)]
    pub port: String,
    #[serde(default = "default_slave_id")]
    pub slave_id: u8,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default)]
    pub parity: Parity,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    /// Response timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: f64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        ConnectionSettings {
            port: String::new(),
            slave_id: default_slave_id(),
            baud_rate: default_baud_rate(),
            parity: Parity::default(),
            stop_bits: default_stop_bits(),
            timeout: default_timeout(),
        }
    }
}

impl ConnectionSettings {
    pub fn validate(&self) -> Result<(), String> {
        if self.port.is_empty() {
            return Err("no port given".into());
        }
        if self.baud_rate == 0 {
            return Err("baud rate must be positive".into());
        }
        if !matches!(self.stop_bits, 1 | 2) {
            return Err(format!("{} stop bits, expected 1 or 2", self.stop_bits));
        }
        if !(1..=247).contains(&self.slave_id) {
            return Err(format!("slave id {} is outside 1..=247", self.slave_id));
        }
        if !self.timeout.is_finite() || self.timeout <= 0.0 || self.timeout > MAX_TIMEOUT {
            return Err(format!(
                "timeout {}s is outside (0, {}]",
                self.timeout, MAX_TIMEOUT
            ));
        }
        Ok(())
    }

    /// The timeout clamped to `0..=MAX_TIMEOUT`; unusable values fall back
    /// to the default.
    pub fn timeout_duration(&self) -> Duration {
        Duration::try_from_secs_f64(self.timeout.clamp(0.0, MAX_TIMEOUT))
            .unwrap_or_else(|_| Duration::from_secs_f64(default_timeout()))
    }
}

impl Display for ConnectionSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} @ {} {}{}{} unit {}",
            self.port, self.baud_rate, 8, self.parity, self.stop_bits, self.slave_id
        )
    }
}

/// The serialization point: every exchange on the line goes through this
/// lock, one request/response at a time.
pub type Link = Arc<Mutex<Box<dyn Protocol>>>;

/// A connected line plus the registers polled on it.
///
/// Cloning shares the line. The register map is a snapshot: replacing it
/// with [`Session::set_registers`] only affects clones and schedulers made
/// afterwards.
#[derive(Clone)]
pub struct Session {
    settings: ConnectionSettings,
    registers: Arc<RegisterMap>,
    link: Link,
}

impl Session {
    pub fn connect(
        settings: ConnectionSettings,
        registers: RegisterMap,
        force: bool,
    ) -> Result<Self, OpenPortError> {
        let stream = port::open_port_async(&settings, force)?;
        info!("connected to {}", settings);
        Ok(Self::with_transport(
            settings,
            registers,
            Box::new(StreamTransport::new(stream)),
        ))
    }

    /// Wraps an already open transport, e.g. an in-memory pipe.
    pub fn with_transport(
        settings: ConnectionSettings,
        registers: RegisterMap,
        transport: Box<dyn Transport>,
    ) -> Self {
        let protocol = make_protocol(transport, settings.timeout_duration());
        Session {
            settings,
            registers: Arc::new(registers),
            link: Arc::new(Mutex::new(protocol)),
        }
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub fn unit(&self) -> u8 {
        self.settings.slave_id
    }

    pub fn registers(&self) -> Arc<RegisterMap> {
        self.registers.clone()
    }

    pub fn set_registers(&mut self, registers: RegisterMap) {
        self.registers = Arc::new(registers);
    }

    pub fn link(&self) -> Link {
        self.link.clone()
    }

    pub async fn is_connected(&self) -> bool {
        self.link.lock().await.is_open()
    }

    /// Closes the line for every clone of this session.
    pub async fn disconnect(&self) {
        self.link.lock().await.close().await;
        info!("disconnected from {}", self.settings.port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn settings_defaults_from_json() {
        let settings: ConnectionSettings =
            serde_json::from_str(r#"{"port": "/dev/ttyUSB0", "parity": "E"}"#).unwrap();
        assert_eq!(settings.baud_rate, 9600);
        assert_eq!(settings.parity, Parity::Even);
        assert_eq!(settings.slave_id, 1);
        assert_eq!(settings.timeout_duration(), Duration::from_secs(1));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn settings_validation() {
        let good = ConnectionSettings {
            port: "/dev/ttyUSB0".into(),
            ..Default::default()
        };
        assert!(good.validate().is_ok());

        for bad in [
            ConnectionSettings { baud_rate: 0, ..good.clone() },
            ConnectionSettings { stop_bits: 3, ..good.clone() },
            ConnectionSettings { slave_id: 0, ..good.clone() },
            ConnectionSettings { timeout: 0.0, ..good.clone() },
            ConnectionSettings { timeout: 1e20, ..good.clone() },
            ConnectionSettings { timeout: f64::NAN, ..good.clone() },
            ConnectionSettings { port: String::new(), ..good.clone() },
        ] {
            assert!(bad.validate().is_err(), "{:?}", bad);
        }
    }

    #[tokio::test]
    async fn huge_timeout_is_rejected_and_never_panics() {
        let settings: ConnectionSettings =
            serde_json::from_str(r#"{"port": "/dev/ttyUSB0", "timeout": 1e20}"#).unwrap();
        assert!(settings.validate().is_err());
        assert_eq!(settings.timeout_duration(), Duration::from_secs(3600));

        let nan = ConnectionSettings {
            timeout: f64::NAN,
            ..Default::default()
        };
        assert_eq!(nan.timeout_duration(), Duration::from_secs(1));

        let (near, _far) = duplex(64);
        let session = Session::with_transport(
            settings,
            RegisterMap::new(),
            Box::new(StreamTransport::new(near)),
        );
        assert_eq!(session.link().lock().await.timeout(), Duration::from_secs(3600));
    }

    #[test]
    fn parse_parity() {
        assert_eq!("o".parse::<Parity>(), Ok(Parity::Odd));
        assert_eq!("none".parse::<Parity>(), Ok(Parity::None));
        assert!("x".parse::<Parity>().is_err());
    }

    #[tokio::test]
    async fn disconnect_closes_all_clones() {
        let (near, _far) = duplex(64);
        let session = Session::with_transport(
            ConnectionSettings::default(),
            RegisterMap::new(),
            Box::new(StreamTransport::new(near)),
        );
        let clone = session.clone();
        assert!(clone.is_connected().await);
        session.disconnect().await;
        session.disconnect().await;
        assert!(!clone.is_connected().await);
    }
}
