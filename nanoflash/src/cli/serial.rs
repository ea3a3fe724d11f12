use std::io;

use log::debug;
use serialport::{available_ports, SerialPortInfo, SerialPortType};

use super::config::Config;
use crate::error::{Error, Transport};

/// Pick the serial port of the device.
///
/// A port given on the command line takes precedence over the one in the
/// configuration file; either must exist. Without one, the first USB serial
/// port is used.
pub fn get_serial_port(requested: Option<&str>, config: &Config) -> Result<String, Error> {
    let ports = detect_serial_ports()?;
    debug!("Serial ports: {ports:?}");

    match requested.or(config.connection.serial.as_deref()) {
        Some(name) => find_serial_port(&ports, name),
        None => first_usb_port(&ports),
    }
}

pub fn detect_serial_ports() -> Result<Vec<SerialPortInfo>, Error> {
    Ok(available_ports().map_err(io::Error::from)?)
}

/// Given a slice of `SerialPortInfo` structs, attempt to find and return one
/// whose `port_name` field matches the provided `name` argument.
fn find_serial_port(ports: &[SerialPortInfo], name: &str) -> Result<String, Error> {
    ports
        .iter()
        .find(|port| port.port_name.eq_ignore_ascii_case(name))
        .map(|port| port.port_name.clone())
        .ok_or_else(|| Error::DeviceIdNotFound {
            transport: Transport::Serial,
            id: name.to_owned(),
        })
}

fn first_usb_port(ports: &[SerialPortInfo]) -> Result<String, Error> {
    ports
        .iter()
        .find(|port| matches!(port.port_type, SerialPortType::UsbPort(_)))
        .map(|port| port.port_name.clone())
        .ok_or(Error::DeviceNotFound(Transport::Serial))
}
