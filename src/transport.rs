//! Blocking byte transport over a polled UART, with the host-absence watchdog.

use core::fmt::Debug;
use core::marker::PhantomData;

use crate::{Error, SerialPort, TimeoutPolicy};

pub struct Transport<P, E> {
    port: P,
    max_time_count: u32,
    policy: TimeoutPolicy,
    time_count: u32,
    receive_errors: u32,
    _err: PhantomData<E>,
}

impl<P, E> Transport<P, E> {
    /// Wrap a serial port, giving up on the host after `max_time_count` empty polls
    pub fn new(port: P, max_time_count: u32, policy: TimeoutPolicy) -> Self {
        Self {
            port,
            max_time_count,
            policy,
            time_count: 0,
            receive_errors: 0,
            _err: PhantomData,
        }
    }

    /// Empty polls counted so far
    pub fn time_count(&self) -> u32 {
        self.time_count
    }

    /// Receive errors seen by the last `getch`
    pub fn receive_errors(&self) -> u32 {
        self.receive_errors
    }

    /// Restart the watchdog count
    pub fn reset_watchdog(&mut self) {
        self.time_count = 0;
    }

    pub fn policy(&self) -> TimeoutPolicy {
        self.policy
    }

    pub fn port(&mut self) -> &mut P {
        &mut self.port
    }

    /// Release the underlying serial port
    pub fn free(self) -> P {
        self.port
    }
}

impl<P, E> Transport<P, E>
where
    P: SerialPort<E>,
    E: Debug,
{
    /// Send one byte, blocking until the transmitter accepts it
    pub fn putch(&mut self, b: u8) -> Result<(), Error<E>> {
        trace!("tx 0x{:02x}", b);
        block!(self.port.write(b))?;
        Ok(())
    }

    /// Send a run of bytes
    pub fn put(&mut self, data: &[u8]) -> Result<(), Error<E>> {
        for b in data {
            self.putch(*b)?;
        }
        Ok(())
    }

    /// Receive one byte.
    ///
    /// Each empty poll counts towards the watchdog; once the count passes
    /// `max_time_count` the session is over and `Error::Timeout` is returned.
    pub fn getch(&mut self) -> Result<u8, Error<E>> {
        if self.policy == TimeoutPolicy::PerByte {
            self.time_count = 0;
        }

        self.receive_errors = 0;

        loop {
            match self.port.read() {
                Ok(b) => {
                    trace!("rx 0x{:02x}", b);
                    return Ok(b);
                }
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => {
                    if self.receive_errors == 0 {
                        warn!("Receive error: {:?}", e);
                    } else {
                        trace!("Receive error: {:?}", e);
                    }
                    self.receive_errors = self.receive_errors.saturating_add(1);
                }
            }

            self.time_count = self.time_count.saturating_add(1);
            if self.time_count > self.max_time_count {
                if self.receive_errors > 1 {
                    debug!("{} receive errors while waiting", self.receive_errors);
                }
                debug!("No host activity after {} polls", self.time_count);
                return Err(Error::Timeout(self.time_count));
            }
        }
    }

    /// Discard `count` bytes
    pub fn get_n(&mut self, count: usize) -> Result<(), Error<E>> {
        for _ in 0..count {
            self.getch()?;
        }
        Ok(())
    }
}
