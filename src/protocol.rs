//! STK500v1 wire constants, as spoken by the Arduino `ATmegaBOOT` family.

/// Leading byte of every successful response
pub const STK_INSYNC: u8 = 0x14;
/// Trailing byte of every successful response
pub const STK_OK: u8 = 0x10;
/// Command terminator, required before a response is sent
pub const CRC_EOP: u8 = b' ';

/// Memory type selector for EEPROM in `d`/`t` commands
pub const MEMTYPE_EEPROM: u8 = b'E';

/// Parameter ids understood by `A`
pub const PARAM_HW_VER: u8 = 0x80;
pub const PARAM_SW_MAJOR: u8 = 0x81;
pub const PARAM_SW_MINOR: u8 = 0x82;
/// Queried by AVR Studio, which expects `PARAM_STUDIO_VALUE` back
pub const PARAM_STUDIO: u8 = 0x98;
pub const PARAM_STUDIO_VALUE: u8 = 0x03;

/// `@` parameters above this id carry a second value byte
pub const PARAM_EXTENDED: u8 = 0x85;

/// Argument bytes skipped by the "don't care" commands
pub const DEVICE_PARAMS_LEN: usize = 20;
pub const DEVICE_EXT_PARAMS_LEN: usize = 5;
pub const UNIVERSAL_LEN: usize = 4;

/// Size of the page buffer, and so the largest block a single `d` commits
pub const MAX_BLOCK: usize = 256;

/// Programmer identification returned by `1`
pub const SIGN_ON: &[u8; 7] = b"AVR ISP";

/// Byte sent three times to enter the monitor
pub const MONITOR_ESCAPE: u8 = b'!';

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Command {
    /// Hello, is anyone home
    GetSync = 0x30,

    /// Request programmer identification
    GetSignOn = 0x31,

    /// Set a programmer parameter (ignored)
    SetParameter = 0x40,

    /// Read a programmer parameter (versions)
    GetParameter = 0x41,

    /// Device programming parameters (ignored, device is fixed)
    SetDevice = 0x42,

    /// Extended device / parallel programming parameters (ignored)
    SetDeviceExt = 0x45,

    /// Enter programming mode
    EnterProgMode = 0x50,

    /// Leave programming mode
    LeaveProgMode = 0x51,

    /// Chip erase (ignored, pages are erased as they are written)
    ChipErase = 0x52,

    /// Load address, little endian. Words for flash, bytes for EEPROM.
    LoadAddress = 0x55,

    /// Universal SPI command (fuses and lock bits, unsupported)
    Universal = 0x56,

    /// Write up to 256 bytes of flash or EEPROM from the current address
    ProgPage = 0x64,

    /// Read a block of flash or EEPROM from the current address
    ReadPage = 0x74,

    /// Read the three device signature bytes
    ReadSign = 0x75,

    /// Read the oscillator calibration byte (unsupported)
    ReadOscCal = 0x76,

    /// Enter the interactive monitor, sent as `!!!`
    #[cfg(feature = "monitor")]
    Monitor = 0x21,
}

impl Command {
    /// Decode a command byte, returning `None` for anything the bootloader ignores
    pub fn from_byte(b: u8) -> Option<Self> {
        use Command::*;

        let c = match b {
            0x30 => GetSync,
            0x31 => GetSignOn,
            0x40 => SetParameter,
            0x41 => GetParameter,
            0x42 => SetDevice,
            0x45 => SetDeviceExt,
            0x50 => EnterProgMode,
            0x51 => LeaveProgMode,
            0x52 => ChipErase,
            0x55 => LoadAddress,
            0x56 => Universal,
            0x64 => ProgPage,
            0x74 => ReadPage,
            0x75 => ReadSign,
            0x76 => ReadOscCal,
            #[cfg(feature = "monitor")]
            0x21 => Monitor,
            _ => return None,
        };

        Some(c)
    }
}
