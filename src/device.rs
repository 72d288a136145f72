//! Supported ATmega parts.
//!
//! Each part fixes the signature reported to the host, the flash page size
//! used by the programming engine, and whether flash reads above 64 KiB need
//! extended (RAMPZ) addressing.

use core::fmt;
use core::str::FromStr;

/// Manufacturer byte, Atmel is the only AVR source
pub const SIG_ATMEL: u8 = 0x1E;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Device {
    ATmega8,
    ATmega88,
    ATmega168,
    ATmega16,
    ATmega32,
    ATmega64,
    ATmega128,
    ATmega162,
    ATmega163,
    ATmega169,
    ATmega8515,
    ATmega8535,
}

pub const DEVICES: &[Device] = &[
    Device::ATmega8,
    Device::ATmega88,
    Device::ATmega168,
    Device::ATmega16,
    Device::ATmega32,
    Device::ATmega64,
    Device::ATmega128,
    Device::ATmega162,
    Device::ATmega163,
    Device::ATmega169,
    Device::ATmega8515,
    Device::ATmega8535,
];

impl Device {
    /// Signature bytes returned by `u`
    pub fn signature(&self) -> [u8; 3] {
        use Device::*;

        let (sig2, sig3) = match self {
            ATmega8 => (0x93, 0x07),
            ATmega88 => (0x93, 0x0a),
            ATmega168 => (0x94, 0x06),
            ATmega16 => (0x94, 0x03),
            ATmega32 => (0x95, 0x02),
            ATmega64 => (0x96, 0x02),
            ATmega128 => (0x97, 0x02),
            ATmega162 => (0x94, 0x04),
            ATmega163 => (0x94, 0x02),
            ATmega169 => (0x94, 0x05),
            ATmega8515 => (0x93, 0x06),
            ATmega8535 => (0x93, 0x08),
        };

        [SIG_ATMEL, sig2, sig3]
    }

    /// Flash page size in 16-bit words
    pub fn page_words(&self) -> u16 {
        use Device::*;

        match self {
            ATmega8 | ATmega88 | ATmega8515 | ATmega8535 => 0x20,
            ATmega16 | ATmega32 | ATmega168 | ATmega162 | ATmega163 | ATmega169 => 0x40,
            ATmega64 | ATmega128 => 0x80,
        }
    }

    pub fn page_bytes(&self) -> usize {
        self.page_words() as usize * 2
    }

    /// Total flash size in bytes
    pub fn flash_bytes(&self) -> usize {
        use Device::*;

        let kib = match self {
            ATmega8 | ATmega88 | ATmega8515 | ATmega8535 => 8,
            ATmega16 | ATmega168 | ATmega162 | ATmega163 | ATmega169 => 16,
            ATmega32 => 32,
            ATmega64 => 64,
            ATmega128 => 128,
        };

        kib * 1024
    }

    /// Total EEPROM size in bytes
    pub fn eeprom_bytes(&self) -> usize {
        use Device::*;

        match self {
            ATmega32 => 1024,
            ATmega64 => 2048,
            ATmega128 => 4096,
            _ => 512,
        }
    }

    /// Whether flash beyond the first 64 KiB is only reachable through RAMPZ
    pub fn extended_addressing(&self) -> bool {
        *self == Device::ATmega128
    }

    fn name(&self) -> &'static str {
        use Device::*;

        match self {
            ATmega8 => "atmega8",
            ATmega88 => "atmega88",
            ATmega168 => "atmega168",
            ATmega16 => "atmega16",
            ATmega32 => "atmega32",
            ATmega64 => "atmega64",
            ATmega128 => "atmega128",
            ATmega162 => "atmega162",
            ATmega163 => "atmega163",
            ATmega169 => "atmega169",
            ATmega8515 => "atmega8515",
            ATmega8535 => "atmega8535",
        }
    }
}

impl Default for Device {
    fn default() -> Self {
        Device::ATmega8
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
#[error("unsupported device '{0}'")]
pub struct UnknownDevice(pub String);

impl FromStr for Device {
    type Err = UnknownDevice;

    /// Accepts `atmega168`, `ATmega168` or the avrdude style `m168`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        let part = lower
            .strip_prefix("atmega")
            .or_else(|| lower.strip_prefix('m'))
            .ok_or_else(|| UnknownDevice(s.to_string()))?;

        DEVICES
            .iter()
            .find(|d| &d.name()["atmega".len()..] == part)
            .copied()
            .ok_or_else(|| UnknownDevice(s.to_string()))
    }
}
