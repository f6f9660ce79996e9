//! Serial port opening, fixed to the dockserver's UART settings.
//!
//! Adapted from `sergw::serial::configure_serial`, generalized from
//! CLI-selectable framing to the fixed 115200 8N1/no-handshake framing
//! spec.md §4.1 requires, with the input buffer cleared on open (the
//! `reset_input_buffer=True` the original's `serial_asyncio.open_serial_connection`
//! passes).

use std::time::Duration;

use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};

pub const BAUD_RATE: u32 = 115_200;

/// Opens `path` at the dockserver's fixed framing (115200 8N1, no flow
/// control) and clears any bytes already queued in the input buffer.
pub fn open_serial_port(path: &str) -> serialport::Result<Box<dyn SerialPort>> {
    let port = serialport::new(path, BAUD_RATE)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .timeout(Duration::from_millis(200))
        .open()?;
    port.clear(serialport::ClearBuffer::Input)?;
    Ok(port)
}

/// Reads the modem's carrier-detect line. Treated as a transient fault by
/// callers, since a USB-serial adapter briefly unplugged looks the same as
/// a read error.
pub fn read_carrier_detect(port: &mut dyn SerialPort) -> serialport::Result<bool> {
    port.read_carrier_detect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baud_rate_is_dockserver_standard() {
        assert_eq!(BAUD_RATE, 115_200);
    }
}
