use crate::protocol::MAX_BLOCK;

/// Mutable state shared between commands for one bootloader session.
///
/// `address` and the mode flags persist across commands: `U` sets the
/// address, `d` and `t` consume it (and may advance it).
#[derive(Clone, PartialEq, Debug)]
pub struct BootloaderSession {
    /// Word address for flash, byte address for EEPROM
    pub address: u16,

    /// Byte count of the block command in flight
    pub length: u16,

    /// The in-flight block targets EEPROM rather than flash
    pub eeprom: bool,

    /// Flash reads go through extended addressing (above 64 KiB)
    pub rampz: bool,

    /// Staging buffer for `d`
    pub buffer: [u8; MAX_BLOCK],
}

impl BootloaderSession {
    pub fn new() -> Self {
        Self {
            address: 0,
            length: 0,
            eeprom: false,
            rampz: false,
            buffer: [0u8; MAX_BLOCK],
        }
    }

    /// Number of received bytes that actually fit in the buffer
    pub fn buffered(&self) -> usize {
        (self.length as usize).min(MAX_BLOCK)
    }
}

impl Default for BootloaderSession {
    fn default() -> Self {
        Self::new()
    }
}
