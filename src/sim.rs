//! In-memory stand-ins for the UART, SPM unit, EEPROM and LED.
//!
//! These back the test suite and the host simulator. The flash model keeps
//! the properties the engine relies on: erase sets a page to `0xFF`, a page
//! write can only clear bits, operations take time, and the RWW section is
//! unreadable between an erase/write and the following re-enable.

use std::collections::VecDeque;
use std::convert::Infallible;

use embedded_hal::digital::v2::OutputPin;
use embedded_hal::serial::{Read, Write};

use crate::device::Device;
use crate::eeprom::Eeprom;
use crate::flash::SelfProgram;
use crate::{Bootloader, Options};

/// Polls an SPM erase or page write stays busy for
const SPM_BUSY_POLLS: u32 = 4;
/// Polls an EEPROM byte write stays busy for
const EEPROM_BUSY_POLLS: u32 = 2;

/// Loopback serial port: bytes fed in are read by the bootloader, bytes it
/// writes are collected for inspection.
#[derive(Clone, Debug, Default)]
pub struct SimSerial {
    rx: VecDeque<(u32, u8)>,
    tx: Vec<u8>,
    polls: u32,
}

impl SimSerial {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue bytes that are available immediately
    pub fn feed(&mut self, data: &[u8]) {
        self.feed_after(0, data);
    }

    /// Queue bytes that only arrive after `idle` more empty polls
    pub fn feed_after(&mut self, idle: u32, data: &[u8]) {
        for (i, b) in data.iter().enumerate() {
            let delay = if i == 0 { idle } else { 0 };
            self.rx.push_back((delay, *b));
        }
    }

    /// Bytes not yet consumed
    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    /// Empty polls seen so far
    pub fn polls(&self) -> u32 {
        self.polls
    }

    pub fn output(&self) -> &[u8] {
        &self.tx
    }

    pub fn take_output(&mut self) -> Vec<u8> {
        core::mem::take(&mut self.tx)
    }
}

impl Read<u8> for SimSerial {
    type Error = Infallible;

    fn read(&mut self) -> nb::Result<u8, Self::Error> {
        let ready = match self.rx.front_mut() {
            Some((delay, _)) if *delay > 0 => {
                *delay -= 1;
                false
            }
            Some(_) => true,
            None => false,
        };

        if ready {
            if let Some((_, b)) = self.rx.pop_front() {
                return Ok(b);
            }
        }

        self.polls += 1;
        Err(nb::Error::WouldBlock)
    }
}

impl Write<u8> for SimSerial {
    type Error = Infallible;

    fn write(&mut self, word: u8) -> nb::Result<(), Self::Error> {
        self.tx.push(word);
        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), Self::Error> {
        Ok(())
    }
}

/// A bootloader running entirely on simulated hardware
pub type SimBootloader = Bootloader<SimSerial, SimFlash, SimEeprom, Infallible>;

impl Bootloader<SimSerial, SimFlash, SimEeprom, Infallible> {
    /// Bootloader on blank flash and EEPROM for the configured device
    pub fn simulated(options: Options) -> Self {
        let device = options.device;
        Self::new(SimSerial::new(), SimFlash::new(device), SimEeprom::new(device), options)
    }
}

/// Operations issued to the simulated SPM unit
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum FlashOp {
    Erase(u32),
    EnableRww,
    Load(u32, u16),
    Commit(u32),
}

#[derive(Clone, Debug)]
pub struct SimFlash {
    memory: Vec<u8>,
    page_bytes: usize,
    temp: Vec<u16>,
    ops: Vec<FlashOp>,
    busy: u32,
    rww_enabled: bool,
    interrupts_disabled: bool,
    busy_violations: usize,
    interrupt_violations: usize,
    rww_violations: usize,
}

impl SimFlash {
    /// Blank (fully erased) flash for `device`
    pub fn new(device: Device) -> Self {
        Self {
            memory: vec![0xFF; device.flash_bytes()],
            page_bytes: device.page_bytes(),
            temp: vec![0xFFFF; device.page_words() as usize],
            ops: Vec::new(),
            busy: 0,
            rww_enabled: true,
            interrupts_disabled: false,
            busy_violations: 0,
            interrupt_violations: 0,
            rww_violations: 0,
        }
    }

    /// Flash preloaded with `image`, truncated to the device size
    pub fn from_image(device: Device, image: &[u8]) -> Self {
        let mut s = Self::new(device);
        let n = image.len().min(s.memory.len());
        s.memory[..n].copy_from_slice(&image[..n]);
        s
    }

    pub fn image(&self) -> &[u8] {
        &self.memory
    }

    pub fn ops(&self) -> &[FlashOp] {
        &self.ops
    }

    pub fn erases(&self) -> usize {
        self.ops.iter().filter(|o| matches!(o, FlashOp::Erase(_))).count()
    }

    pub fn commits(&self) -> usize {
        self.ops.iter().filter(|o| matches!(o, FlashOp::Commit(_))).count()
    }

    /// Operations started while a previous one was still running
    pub fn busy_violations(&self) -> usize {
        self.busy_violations
    }

    /// Operations started with interrupts enabled
    pub fn interrupt_violations(&self) -> usize {
        self.interrupt_violations
    }

    /// Reads issued while the RWW section was disabled
    pub fn rww_violations(&self) -> usize {
        self.rww_violations
    }

    fn wrap(&self, addr: u32) -> usize {
        addr as usize % self.memory.len()
    }

    fn page_base(&self, addr: u32) -> usize {
        let a = self.wrap(addr);
        a - a % self.page_bytes
    }

    fn start(&mut self, op: FlashOp, busy: u32) {
        trace!("spm {:?}", op);

        if self.busy > 0 {
            self.busy_violations += 1;
        }
        if !self.interrupts_disabled {
            self.interrupt_violations += 1;
        }

        self.ops.push(op);
        self.busy = busy;
    }
}

impl SelfProgram for SimFlash {
    fn wait_ready(&mut self) {
        self.busy = 0;
    }

    fn erase_page(&mut self, addr: u32) {
        self.start(FlashOp::Erase(addr), SPM_BUSY_POLLS);

        let base = self.page_base(addr);
        let page_bytes = self.page_bytes;
        self.memory[base..base + page_bytes].iter_mut().for_each(|b| *b = 0xFF);
        self.rww_enabled = false;
    }

    fn enable_rww(&mut self) {
        self.start(FlashOp::EnableRww, 1);
        self.rww_enabled = true;
    }

    fn load_word(&mut self, addr: u32, word: u16) {
        self.start(FlashOp::Load(addr, word), 0);

        let index = (self.wrap(addr) % self.page_bytes) / 2;
        self.temp[index] = word;
    }

    fn commit_page(&mut self, addr: u32) {
        self.start(FlashOp::Commit(addr), SPM_BUSY_POLLS);

        let base = self.page_base(addr);
        for (i, w) in self.temp.iter_mut().enumerate() {
            let [lo, hi] = w.to_le_bytes();
            // Programming can only clear bits
            self.memory[base + 2 * i] &= lo;
            self.memory[base + 2 * i + 1] &= hi;
            *w = 0xFFFF;
        }
        self.rww_enabled = false;
    }

    fn read_byte(&mut self, addr: u32) -> u8 {
        if !self.rww_enabled {
            self.rww_violations += 1;
        }
        self.memory[self.wrap(addr)]
    }

    fn free<R, F>(&mut self, f: F) -> R
    where
        F: FnOnce(&mut Self) -> R,
    {
        let previous = self.interrupts_disabled;
        self.interrupts_disabled = true;
        let r = f(self);
        self.interrupts_disabled = previous;
        r
    }
}

#[derive(Clone, Debug)]
pub struct SimEeprom {
    memory: Vec<u8>,
    busy: u32,
    writes: usize,
    busy_violations: usize,
}

impl SimEeprom {
    pub fn new(device: Device) -> Self {
        Self {
            memory: vec![0xFF; device.eeprom_bytes()],
            busy: 0,
            writes: 0,
            busy_violations: 0,
        }
    }

    pub fn from_image(device: Device, image: &[u8]) -> Self {
        let mut s = Self::new(device);
        let n = image.len().min(s.memory.len());
        s.memory[..n].copy_from_slice(&image[..n]);
        s
    }

    pub fn image(&self) -> &[u8] {
        &self.memory
    }

    pub fn writes(&self) -> usize {
        self.writes
    }

    /// Accesses started while a write was still in progress
    pub fn busy_violations(&self) -> usize {
        self.busy_violations
    }

    fn wrap(&self, addr: u16) -> usize {
        addr as usize % self.memory.len()
    }
}

impl Eeprom for SimEeprom {
    fn wait_ready(&mut self) {
        self.busy = 0;
    }

    fn read(&mut self, addr: u16) -> u8 {
        if self.busy > 0 {
            self.busy_violations += 1;
        }
        self.memory[self.wrap(addr)]
    }

    fn write(&mut self, addr: u16, value: u8) {
        trace!("eeprom[0x{:04x}] = 0x{:02x}", addr, value);

        if self.busy > 0 {
            self.busy_violations += 1;
        }
        let a = self.wrap(addr);
        self.memory[a] = value;
        self.writes += 1;
        self.busy = EEPROM_BUSY_POLLS;
    }
}

/// Board LED, counting transitions
#[derive(Clone, Debug, Default)]
pub struct SimLed {
    lit: bool,
    toggles: usize,
}

impl SimLed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_lit(&self) -> bool {
        self.lit
    }

    pub fn toggles(&self) -> usize {
        self.toggles
    }

    fn set(&mut self, lit: bool) {
        if self.lit != lit {
            self.toggles += 1;
        }
        self.lit = lit;
    }
}

impl OutputPin for SimLed {
    type Error = Infallible;

    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.set(false);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.set(true);
        Ok(())
    }
}

/// Data space (SRAM and I/O) seen by the monitor
#[derive(Clone, Debug)]
pub struct SimRam {
    memory: Vec<u8>,
    pub led: SimLed,
}

impl SimRam {
    pub fn new() -> Self {
        Self {
            memory: vec![0u8; 0x10000],
            led: SimLed::new(),
        }
    }

    pub fn memory(&self) -> &[u8] {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut [u8] {
        &mut self.memory
    }
}

impl Default for SimRam {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "monitor")]
impl crate::monitor::MonitorTarget for SimRam {
    fn peek(&mut self, addr: u16) -> u8 {
        self.memory[addr as usize]
    }

    fn poke(&mut self, addr: u16, value: u8) {
        self.memory[addr as usize] = value;
    }

    fn toggle_led(&mut self) -> bool {
        let lit = !self.led.is_lit();
        self.led.set(lit);
        lit
    }
}
