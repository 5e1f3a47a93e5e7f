#[cfg(target_os = "linux")]
mod linux;
#[cfg(not(target_os = "linux"))]
mod other;

#[cfg(target_os = "linux")]
use linux::is_port_open;
#[cfg(not(target_os = "linux"))]
use other::is_port_open;

pub use tokio_serial::SerialStream;

use log::debug;
use serde::Serialize;
use serialport::SerialPortType;
use thiserror::Error;
use tokio_serial::SerialPortBuilderExt;

use crate::session::{ConnectionSettings, Parity};

#[derive(Error, Debug)]
pub enum OpenPortError {
    #[error("no compatible ports found")]
    NoCompatiblePort,
    #[error("{port_name:?} busy")]
    PortBusy { port_name: String },
    #[error("rs485 configuration failed on {port_name:?}")]
    Rs485Error { port_name: String },
    #[error("cannot open {port_name:?}: {source}")]
    Open {
        port_name: String,
        source: serialport::Error,
    },
    #[error("invalid connection settings: {0}")]
    InvalidSettings(String),
    #[error("port enumeration failed: {0}")]
    Enumerate(#[from] serialport::Error),
}

trait Rs485 {
    fn rs485_is_enabled(&self) -> std::io::Result<bool>;
    fn rs485_enable(&self, enable: bool) -> std::io::Result<()>;

    fn rs485_is_supported(&self) -> bool {
        match self.rs485_is_enabled() {
            Ok(enabled) => self.rs485_enable(enabled).is_ok(),
            Err(_) => false,
        }
    }
}

#[derive(PartialEq)]
struct UsbId(u16, u16);

static COMPATIBLE_IDS: &[UsbId] = &[
    UsbId(0x0403, 0x6001), // FTDI FT232R USB UART
    UsbId(0x0403, 0x6014), // FTDI FT232H Single HS USB-UART/FIFO IC
    UsbId(0x1a86, 0x7523), // QinHeng Electronics HL-340 USB-Serial adapter
    UsbId(0x10c4, 0xea60), // Silicon Labs CP210x UART Bridge
    UsbId(0x067b, 0x2303), // Prolific PL2303 Serial Port
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortInfo {
    pub name: String,
    pub description: String,
}

fn describe(port_type: &SerialPortType) -> String {
    match port_type {
        SerialPortType::UsbPort(usb) => {
            let product = [usb.manufacturer.as_deref(), usb.product.as_deref()]
                .iter()
                .flatten()
                .copied()
                .collect::<Vec<_>>()
                .join(" ");
            if product.is_empty() {
                format!("USB {:04x}:{:04x}", usb.vid, usb.pid)
            } else {
                format!("{} ({:04x}:{:04x})", product, usb.vid, usb.pid)
            }
        }
        SerialPortType::PciPort => "PCI".to_string(),
        SerialPortType::BluetoothPort => "Bluetooth".to_string(),
        SerialPortType::Unknown => String::new(),
    }
}

/// Serial ports known to the OS, sorted by name.
pub fn list_ports() -> Result<Vec<PortInfo>, OpenPortError> {
    let mut ports: Vec<PortInfo> = serialport::available_ports()?
        .into_iter()
        .map(|info| PortInfo {
            description: describe(&info.port_type),
            name: info.port_name,
        })
        .collect();
    ports.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(ports)
}

/// Opens the port named in `settings` as an async stream, 8 data bits.
/// `"auto"` picks the first known USB-RS485 adapter.
pub fn open_port_async(settings: &ConnectionSettings, force: bool) -> Result<SerialStream, OpenPortError> {
    settings.validate().map_err(OpenPortError::InvalidSettings)?;

    let true_name: String = if settings.port == "auto" {
        guess_port()?
    } else {
        settings.port.clone()
    };

    if !force && is_port_open(&true_name) {
        return Err(OpenPortError::PortBusy {
            port_name: true_name,
        });
    }

    let parity = match settings.parity {
        Parity::None => tokio_serial::Parity::None,
        Parity::Even => tokio_serial::Parity::Even,
        Parity::Odd => tokio_serial::Parity::Odd,
    };
    let stop_bits = match settings.stop_bits {
        2 => tokio_serial::StopBits::Two,
        _ => tokio_serial::StopBits::One,
    };

    let port = tokio_serial::new(&true_name, settings.baud_rate)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(parity)
        .stop_bits(stop_bits)
        .open_native_async()
        .map_err(|source| OpenPortError::Open {
            port_name: true_name.clone(),
            source,
        })?;

    if port.rs485_is_supported() && port.rs485_enable(true).is_err() && !force {
        return Err(OpenPortError::Rs485Error {
            port_name: true_name,
        });
    }

    debug!(
        "open_port OK: {} @ {} baud {}{}",
        &true_name, settings.baud_rate, settings.parity, settings.stop_bits
    );
    Ok(port)
}

fn guess_port() -> Result<String, OpenPortError> {
    serialport::available_ports()?
        .into_iter()
        .filter(|info| match &info.port_type {
            SerialPortType::UsbPort(usb_info) => {
                COMPATIBLE_IDS.contains(&UsbId(usb_info.vid, usb_info.pid))
            }
            SerialPortType::Unknown => {
                !is_port_open(&info.port_name)
                    && match serialport::new(&info.port_name, 9600).open_native() {
                        Ok(p) => p.rs485_is_supported(),
                        Err(_) => false,
                    }
            }
            SerialPortType::PciPort | SerialPortType::BluetoothPort => false,
        })
        .map(|info| info.port_name)
        .next()
        .ok_or(OpenPortError::NoCompatiblePort)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serialport::UsbPortInfo;

    #[test]
    fn describe_usb() {
        let usb = SerialPortType::UsbPort(UsbPortInfo {
            vid: 0x0403,
            pid: 0x6001,
            serial_number: None,
            manufacturer: Some("FTDI".into()),
            product: Some("FT232R USB UART".into()),
        });
        assert_eq!(describe(&usb), "FTDI FT232R USB UART (0403:6001)");
        assert_eq!(describe(&SerialPortType::PciPort), "PCI");
    }

    #[test]
    fn invalid_settings_are_rejected_before_opening() {
        let settings = ConnectionSettings {
            port: "/dev/null-port".into(),
            baud_rate: 0,
            ..Default::default()
        };
        assert!(matches!(
            open_port_async(&settings, true),
            Err(OpenPortError::InvalidSettings(_))
        ));
    }
}
