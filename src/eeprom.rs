//! Byte-wise EEPROM access.

/// The EEPROM controller
pub trait Eeprom {
    /// Spin until any write in progress has completed
    fn wait_ready(&mut self);

    fn read(&mut self, addr: u16) -> u8;

    /// Start writing one byte, performing the master-enable then strobe sequence
    fn write(&mut self, addr: u16, value: u8);
}

/// Write `data` one byte at a time from `*addr`, advancing it past the block
pub fn write_block<M: Eeprom>(eeprom: &mut M, addr: &mut u16, data: &[u8]) {
    for b in data {
        eeprom.wait_ready();
        eeprom.write(*addr, *b);
        *addr = addr.wrapping_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::sim::SimEeprom;

    #[test]
    fn writes_and_advances() {
        let mut e = SimEeprom::new(Device::ATmega8);
        let mut addr = 0x10;

        write_block(&mut e, &mut addr, &[1, 2, 3]);

        assert_eq!(addr, 0x13);
        assert_eq!(&e.image()[0x10..0x13], &[1, 2, 3]);

        e.wait_ready();
        assert_eq!(e.read(0x11), 2);
        assert_eq!(e.busy_violations(), 0);
    }

    #[test]
    fn read_while_busy_is_flagged() {
        let mut e = SimEeprom::new(Device::ATmega8);
        let mut addr = 0;

        write_block(&mut e, &mut addr, &[0xAA]);
        e.read(0);

        assert_eq!(e.busy_violations(), 1);
    }
}
