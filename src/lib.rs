//! AVR ATmega serial bootloader.
//!
//! Speaks the STK500v1 subset used by the Arduino `ATmegaBOOT` bootloader
//! over a polled UART, and reprograms flash page-by-page and EEPROM
//! byte-by-byte. If the host goes quiet the session ends and control is
//! handed to the application.

use core::fmt::{self, Debug};
use core::num::ParseIntError;
use core::str::FromStr;

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;
use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::digital::v2::OutputPin;
use embedded_hal::serial::{Read, Write};

#[cfg(feature = "structopt")]
extern crate structopt;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

#[cfg(feature = "linux")]
pub mod linux;

pub mod device;
pub mod eeprom;
pub mod flash;
#[cfg(feature = "monitor")]
pub mod monitor;
pub mod protocol;
pub mod session;
pub mod sim;
pub mod transport;

pub use device::Device;
pub use eeprom::Eeprom;
pub use flash::{PageStats, SelfProgram};
pub use protocol::Command;
pub use session::BootloaderSession;
pub use transport::Transport;

use protocol::*;

/// LED on / off time while signalling bootloader entry
const LED_ON_MS: u32 = 100;
const LED_OFF_MS: u32 = 100;

pub trait SerialPort<E>: Write<u8, Error = E> + Read<u8, Error = E> {}

impl<T, E> SerialPort<E> for T where T: Write<u8, Error = E> + Read<u8, Error = E> {}

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum Error<SerialError> {
    #[error("serial error: {0:?}")]
    Serial(SerialError),

    /// The host went quiet, the session is over
    #[error("no host activity after {0} polls")]
    Timeout(u32),

    /// The host asked for the application to be started
    #[error("application start requested")]
    AppStart,
}

impl<SerialError> Error<SerialError> {
    /// Whether this ends the session by handing control to the application
    pub fn starts_application(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::AppStart)
    }
}

impl<SerialError> From<SerialError> for Error<SerialError> {
    fn from(e: SerialError) -> Self {
        Self::Serial(e)
    }
}

/// How empty polls accumulate towards the host-absence timeout
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum TimeoutPolicy {
    /// Each byte gets the full timeout
    PerByte,
    /// Polls accumulate over the session, restarted by `P` (enter programming mode)
    Session,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        TimeoutPolicy::PerByte
    }
}

impl fmt::Display for TimeoutPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutPolicy::PerByte => f.write_str("per-byte"),
            TimeoutPolicy::Session => f.write_str("session"),
        }
    }
}

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
#[error("unknown timeout policy '{0}', expected per-byte or session")]
pub struct UnknownPolicy(pub String);

impl FromStr for TimeoutPolicy {
    type Err = UnknownPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "per-byte" => Ok(TimeoutPolicy::PerByte),
            "session" => Ok(TimeoutPolicy::Session),
            _ => Err(UnknownPolicy(s.to_string())),
        }
    }
}

/// Parse a byte as decimal or `0x` prefixed hex
pub fn parse_byte(s: &str) -> Result<u8, ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(h) => u8::from_str_radix(h, 16),
        None => s.parse(),
    }
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Target part, sets the signature and flash page size
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "atmega8"))]
    pub device: Device,

    /// CPU clock in Hz, the receive timeout is half this many empty polls
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "16000000"))]
    pub cpu_hz: u32,

    /// Empty polls before giving up on the host, overrides the clock derived value
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub max_time_count: Option<u32>,

    /// Timeout accounting, per-byte or session
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "per-byte"))]
    pub timeout_policy: TimeoutPolicy,

    /// High byte used to complete an odd-length flash write
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "0xff", parse(try_from_str = parse_byte)))]
    pub pad_byte: u8,

    /// Hardware version reported to the host
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "0x02", parse(try_from_str = parse_byte)))]
    pub hw_ver: u8,

    /// Software major version reported to the host
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "0x01", parse(try_from_str = parse_byte)))]
    pub sw_major: u8,

    /// Software minor version reported to the host
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "0x12", parse(try_from_str = parse_byte)))]
    pub sw_minor: u8,

    /// LED flashes on entering the bootloader (0 means 3)
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "3"))]
    pub led_flashes: u8,
}

impl Options {
    /// Empty polls allowed before the session ends
    pub fn time_limit(&self) -> u32 {
        self.max_time_count.unwrap_or(self.cpu_hz >> 1)
    }
}

impl Default for Options {
    fn default() -> Self {
        Self {
            device: Device::default(),
            cpu_hz: 16_000_000,
            max_time_count: None,
            timeout_policy: TimeoutPolicy::default(),
            pad_byte: 0xFF,
            hw_ver: 0x02,
            sw_major: 0x01,
            sw_minor: 0x12,
            led_flashes: 3,
        }
    }
}

/// Outcome of one dispatcher step
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Handled {
    /// A recognised command was processed (it may still have been silent)
    Command(Command),
    /// The byte was not a command and was dropped
    Ignored(u8),
    /// `!!!` was received
    MonitorRequested,
}

/// Flash the board LED `count` times to show the bootloader is running
pub fn signal_entry<L, D>(led: &mut L, delay: &mut D, count: u8) -> Result<(), L::Error>
where
    L: OutputPin,
    D: DelayMs<u32>,
{
    let count = if count == 0 { 3 } else { count };

    for _ in 0..count {
        led.set_high()?;
        delay.delay_ms(LED_ON_MS);
        led.set_low()?;
        delay.delay_ms(LED_OFF_MS);
    }

    Ok(())
}

pub struct Bootloader<P, F, M, E> {
    options: Options,
    uart: Transport<P, E>,
    flash: F,
    eeprom: M,
}

impl<P, F, M, E> Bootloader<P, F, M, E>
where
    P: SerialPort<E>,
    F: SelfProgram,
    M: Eeprom,
    E: Debug,
{
    /// Create a bootloader over the given UART and memories
    pub fn new(port: P, flash: F, eeprom: M, options: Options) -> Self {
        let uart = Transport::new(port, options.time_limit(), options.timeout_policy);
        Self {
            options,
            uart,
            flash,
            eeprom,
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn transport(&mut self) -> &mut Transport<P, E> {
        &mut self.uart
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn eeprom(&self) -> &M {
        &self.eeprom
    }

    /// Release the UART and memories
    pub fn free(self) -> (P, F, M) {
        (self.uart.free(), self.flash, self.eeprom)
    }

    /// Whether the reset vector holds anything other than erased flash
    pub fn application_present(&mut self) -> bool {
        self.flash.read_byte(0) != 0xFF || self.flash.read_byte(1) != 0xFF
    }

    /// Process commands until the session ends, returning the reason
    pub fn serve(&mut self, session: &mut BootloaderSession) -> Error<E> {
        loop {
            if let Err(e) = self.poll(session) {
                info!("Session ended: {}", e);
                return e;
            }
        }
    }

    /// Process commands until the session ends, entering the monitor on `!!!`
    #[cfg(feature = "monitor")]
    pub fn serve_with_monitor<T>(&mut self, session: &mut BootloaderSession, target: &mut T) -> Error<E>
    where
        T: monitor::MonitorTarget,
    {
        loop {
            match self.poll(session) {
                Ok(Handled::MonitorRequested) => {
                    info!("Entering monitor");
                    let e = monitor::run(&mut self.uart, target);
                    info!("Monitor ended: {}", e);
                    return e;
                }
                Ok(_) => (),
                Err(e) => {
                    info!("Session ended: {}", e);
                    return e;
                }
            }
        }
    }

    /// Read and execute a single command
    pub fn poll(&mut self, session: &mut BootloaderSession) -> Result<Handled, Error<E>> {
        let ch = self.uart.getch()?;

        let command = match Command::from_byte(ch) {
            Some(c) => c,
            None => {
                debug!("Ignoring 0x{:02x}", ch);
                return Ok(Handled::Ignored(ch));
            }
        };

        debug!("Command {:?}", command);

        match command {
            Command::GetSync => self.nothing_response()?,
            Command::GetSignOn => {
                if self.uart.getch()? == CRC_EOP {
                    self.uart.putch(STK_INSYNC)?;
                    self.uart.put(SIGN_ON)?;
                    self.uart.putch(STK_OK)?;
                }
            }
            Command::SetParameter => {
                if self.uart.getch()? > PARAM_EXTENDED {
                    self.uart.getch()?;
                }
                self.nothing_response()?;
            }
            Command::GetParameter => {
                let value = match self.uart.getch()? {
                    PARAM_HW_VER => self.options.hw_ver,
                    PARAM_SW_MAJOR => self.options.sw_major,
                    PARAM_SW_MINOR => self.options.sw_minor,
                    PARAM_STUDIO => PARAM_STUDIO_VALUE,
                    _ => 0x00,
                };
                self.byte_response(value)?;
            }
            Command::SetDevice => {
                self.uart.get_n(DEVICE_PARAMS_LEN)?;
                self.nothing_response()?;
            }
            Command::SetDeviceExt => {
                self.uart.get_n(DEVICE_EXT_PARAMS_LEN)?;
                self.nothing_response()?;
            }
            Command::EnterProgMode => {
                if self.uart.policy() == TimeoutPolicy::Session {
                    self.uart.reset_watchdog();
                }
                self.nothing_response()?;
            }
            Command::LeaveProgMode | Command::ChipErase => self.nothing_response()?,
            Command::LoadAddress => {
                let lo = self.uart.getch()?;
                let hi = self.uart.getch()?;
                session.address = u16::from_le_bytes([lo, hi]);
                self.nothing_response()?;
            }
            Command::Universal => {
                self.uart.get_n(UNIVERSAL_LEN)?;
                self.byte_response(0x00)?;
            }
            Command::ProgPage => self.prog_page(session)?,
            Command::ReadPage => self.read_page(session)?,
            Command::ReadSign => {
                if self.uart.getch()? == CRC_EOP {
                    self.uart.putch(STK_INSYNC)?;
                    self.uart.put(&self.options.device.signature())?;
                    self.uart.putch(STK_OK)?;
                }
            }
            Command::ReadOscCal => self.byte_response(0x00)?,
            #[cfg(feature = "monitor")]
            Command::Monitor => {
                if self.uart.getch()? != MONITOR_ESCAPE || self.uart.getch()? != MONITOR_ESCAPE {
                    return Ok(Handled::Ignored(ch));
                }
                return Ok(Handled::MonitorRequested);
            }
        }

        Ok(Handled::Command(command))
    }

    /// `d`: receive a block and commit it to EEPROM or flash
    fn prog_page(&mut self, session: &mut BootloaderSession) -> Result<(), Error<E>> {
        let hi = self.uart.getch()?;
        let lo = self.uart.getch()?;
        session.length = u16::from_be_bytes([hi, lo]);
        session.eeprom = self.uart.getch()? == MEMTYPE_EEPROM;

        // Receive everything up front, programming can't keep up with the line
        for i in 0..session.length as usize {
            let b = self.uart.getch()?;
            if i < MAX_BLOCK {
                session.buffer[i] = b;
            }
        }
        if session.length as usize > MAX_BLOCK {
            warn!("Block of {} bytes truncated to {}", session.length, MAX_BLOCK);
        }

        if self.uart.getch()? != CRC_EOP {
            debug!("Missing terminator, dropping block");
            return Ok(());
        }

        let n = session.buffered();
        if session.eeprom {
            debug!("EEPROM write {} bytes at 0x{:04x}", n, session.address);
            eeprom::write_block(&mut self.eeprom, &mut session.address, &session.buffer[..n]);
        } else {
            let page_words = self.options.device.page_words();
            let pad = self.options.pad_byte;
            let word_addr = session.address as u32;
            let data = &session.buffer[..n];

            // Flash writes stall the CPU, finish any EEPROM write first
            self.eeprom.wait_ready();
            let stats = self
                .flash
                .free(|f| flash::program(f, page_words, word_addr, data, pad));

            debug!(
                "Flash write {} bytes at word 0x{:04x}: {:?}",
                n, word_addr, stats
            );
        }

        self.uart.putch(STK_INSYNC)?;
        self.uart.putch(STK_OK)?;

        Ok(())
    }

    /// `t`: stream a block of EEPROM or flash back to the host
    fn read_page(&mut self, session: &mut BootloaderSession) -> Result<(), Error<E>> {
        let hi = self.uart.getch()?;
        let lo = self.uart.getch()?;
        session.length = u16::from_be_bytes([hi, lo]);
        session.rampz = self.options.device.extended_addressing() && session.address > 0x7FFF;

        if self.uart.getch()? == MEMTYPE_EEPROM {
            session.eeprom = true;
        } else {
            session.eeprom = false;
            session.address <<= 1;
        }

        if self.uart.getch()? != CRC_EOP {
            debug!("Missing terminator, dropping read");
            return Ok(());
        }

        debug!(
            "{} read {} bytes at 0x{:04x}",
            if session.eeprom { "EEPROM" } else { "Flash" },
            session.length,
            session.address
        );

        self.uart.putch(STK_INSYNC)?;
        for _ in 0..session.length {
            let b = if session.eeprom {
                self.eeprom.wait_ready();
                self.eeprom.read(session.address)
            } else {
                let far = if session.rampz { 0x1_0000 } else { 0 };
                self.flash.read_byte(session.address as u32 + far)
            };
            self.uart.putch(b)?;
            session.address = session.address.wrapping_add(1);
        }
        self.uart.putch(STK_OK)?;

        Ok(())
    }

    /// Ack, if the terminator follows
    fn nothing_response(&mut self) -> Result<(), Error<E>> {
        if self.uart.getch()? == CRC_EOP {
            self.uart.putch(STK_INSYNC)?;
            self.uart.putch(STK_OK)?;
        }
        Ok(())
    }

    /// Ack with a single value, if the terminator follows
    fn byte_response(&mut self, value: u8) -> Result<(), Error<E>> {
        if self.uart.getch()? == CRC_EOP {
            self.uart.putch(STK_INSYNC)?;
            self.uart.putch(value)?;
            self.uart.putch(STK_OK)?;
        }
        Ok(())
    }
}
