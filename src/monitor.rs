//! Interactive hex monitor, entered by sending `!!!`.
//!
//! A terminal user gets a `: ` prompt and single-letter commands to peek and
//! poke the data space, toggle the LED, echo the line, or jump to the
//! application. Everything typed is echoed.

use core::convert::Infallible;
use core::fmt::Debug;

use crate::transport::Transport;
use crate::{Error, SerialPort};

pub const BANNER: &[u8] = b"atmega-boot monitor\n\r";
const PROMPT: &[u8] = b"\n\r: ";
const HEX: &[u8; 16] = b"0123456789abcdef";

/// What the monitor can reach on the board
pub trait MonitorTarget {
    /// Read a byte from the data space (SRAM and I/O registers)
    fn peek(&mut self, addr: u16) -> u8;

    /// Write a byte to the data space
    fn poke(&mut self, addr: u16, value: u8);

    /// Toggle the board LED, returning whether it is now lit
    fn toggle_led(&mut self) -> bool;
}

/// Run the monitor until the host goes quiet or asks for the application
pub fn run<P, E, T>(uart: &mut Transport<P, E>, target: &mut T) -> Error<E>
where
    P: SerialPort<E>,
    E: Debug,
    T: MonitorTarget,
{
    match serve(uart, target) {
        Ok(never) => match never {},
        Err(e) => e,
    }
}

fn serve<P, E, T>(uart: &mut Transport<P, E>, target: &mut T) -> Result<Infallible, Error<E>>
where
    P: SerialPort<E>,
    E: Debug,
    T: MonitorTarget,
{
    uart.put(BANNER)?;

    loop {
        uart.put(PROMPT)?;

        match echo(uart)? {
            b't' => {
                let lit = target.toggle_led();
                uart.putch(if lit { b'1' } else { b'0' })?;
            }
            b'r' => {
                echo(uart)?;
                let addr = get_addr(uart)?;
                uart.putch(b'=')?;
                put_hex(uart, target.peek(addr))?;
            }
            b'w' => {
                echo(uart)?;
                let addr = get_addr(uart)?;
                echo(uart)?;
                let value = get_hex(uart)?;
                debug!("Monitor poke 0x{:04x} = 0x{:02x}", addr, value);
                target.poke(addr, value);
            }
            b'u' => loop {
                let b = uart.getch()?;
                uart.putch(b)?;
            },
            b'j' => return Err(Error::AppStart),
            _ => (),
        }
    }
}

fn echo<P, E>(uart: &mut Transport<P, E>) -> Result<u8, Error<E>>
where
    P: SerialPort<E>,
    E: Debug,
{
    let b = uart.getch()?;
    uart.putch(b)?;
    Ok(b)
}

/// Two echoed hex digits, anything that isn't a digit counts as zero
fn get_hex<P, E>(uart: &mut Transport<P, E>) -> Result<u8, Error<E>>
where
    P: SerialPort<E>,
    E: Debug,
{
    let hi = nibble(echo(uart)?);
    let lo = nibble(echo(uart)?);
    Ok(hi << 4 | lo)
}

fn get_addr<P, E>(uart: &mut Transport<P, E>) -> Result<u16, Error<E>>
where
    P: SerialPort<E>,
    E: Debug,
{
    let hi = get_hex(uart)?;
    let lo = get_hex(uart)?;
    Ok(u16::from_be_bytes([hi, lo]))
}

fn put_hex<P, E>(uart: &mut Transport<P, E>, value: u8) -> Result<(), Error<E>>
where
    P: SerialPort<E>,
    E: Debug,
{
    uart.putch(HEX[(value >> 4) as usize])?;
    uart.putch(HEX[(value & 0x0f) as usize])
}

fn nibble(c: u8) -> u8 {
    (c as char).to_digit(16).unwrap_or(0) as u8
}
