use super::Rs485;
use std::io;

// No portable way to find other holders of a device.
pub fn is_port_open(_port_name: &str) -> bool {
    false
}

impl<T> Rs485 for T {
    fn rs485_is_enabled(&self) -> io::Result<bool> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "rs485 ioctl"))
    }

    fn rs485_enable(&self, _enable: bool) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "rs485 ioctl"))
    }
}
