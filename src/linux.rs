use std::io::ErrorKind as IoErrorKind;
use std::path::Path;
use std::time::Duration;

use serial_core::{
    BaudRate, CharSize, Error as SerialError, FlowControl, Parity, SerialDevice as _,
    SerialPortSettings as _, StopBits,
};
use linux_embedded_hal::Serial;

use crate::{Bootloader, Eeprom, Options, SelfProgram};

/// Read timeout of the host port, one empty poll of the watchdog
pub const POLL_PERIOD: Duration = Duration::from_millis(1);

/// Host silence tolerated before handing over to the application
pub const HOST_TIMEOUT: Duration = Duration::from_secs(1);

/// Empty polls allowed on a host port.
///
/// Each poll blocks for `POLL_PERIOD`, so this is `HOST_TIMEOUT` worth of
/// polls unless `max_time_count` is set.
pub fn host_time_limit(options: &Options) -> u32 {
    let polls = HOST_TIMEOUT.as_micros() / POLL_PERIOD.as_micros();
    options.max_time_count.unwrap_or(polls as u32)
}

impl<F, M> Bootloader<Serial, F, M, IoErrorKind>
where
    F: SelfProgram,
    M: Eeprom,
{
    /// Create a bootloader serving on a linux serial port
    pub fn linux<P: AsRef<Path>>(
        port: P,
        baud: usize,
        flash: F,
        eeprom: M,
        options: Options,
    ) -> Result<Self, SerialError> {
        // Open port
        let mut port = Serial::open(port.as_ref())?;

        // Apply settings, 8N1 as the bootloader UART is configured
        let mut settings = port.0.read_settings()?;

        settings.set_char_size(CharSize::Bits8);
        settings.set_stop_bits(StopBits::Stop1);
        settings.set_baud_rate(BaudRate::from_speed(baud))?;
        settings.set_flow_control(FlowControl::FlowNone);
        settings.set_parity(Parity::ParityNone);

        port.0.write_settings(&settings)?;
        port.0.set_timeout(POLL_PERIOD)?;

        let options = Options {
            max_time_count: Some(host_time_limit(&options)),
            ..options
        };
        debug!("Host timeout after {} polls", options.time_limit());

        // Return instance
        Ok(Self::new(port, flash, eeprom, options))
    }
}
