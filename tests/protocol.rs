//! End-to-end command handling on simulated hardware.

use atmega_boot::protocol::{STK_INSYNC, STK_OK};
use atmega_boot::sim::{SimBootloader, SimEeprom, SimFlash, SimSerial};
use atmega_boot::{
    Bootloader, BootloaderSession, Command, Device, Error, Handled, Options, TimeoutPolicy,
};

const LIMIT: u32 = 16;
const ACK: [u8; 2] = [STK_INSYNC, STK_OK];

fn options(device: Device) -> Options {
    Options {
        device,
        max_time_count: Some(LIMIT),
        ..Options::default()
    }
}

fn boot(device: Device) -> SimBootloader {
    SimBootloader::simulated(options(device))
}

fn boot_with_image(device: Device, image: &[u8]) -> SimBootloader {
    Bootloader::new(
        SimSerial::new(),
        SimFlash::from_image(device, image),
        SimEeprom::new(device),
        options(device),
    )
}

/// Feed `input`, serve until the line goes quiet, and collect the replies
fn exchange(bl: &mut SimBootloader, session: &mut BootloaderSession, input: &[u8]) -> Vec<u8> {
    bl.transport().port().feed(input);
    let e = bl.serve(session);
    assert_eq!(e, Error::Timeout(LIMIT + 1));
    bl.transport().port().take_output()
}

fn framed(payload: &[u8]) -> Vec<u8> {
    let mut v = vec![STK_INSYNC];
    v.extend_from_slice(payload);
    v.push(STK_OK);
    v
}

fn load_address(addr: u16) -> Vec<u8> {
    let [lo, hi] = addr.to_le_bytes();
    vec![b'U', lo, hi, b' ']
}

fn prog_page(memtype: u8, data: &[u8]) -> Vec<u8> {
    let [hi, lo] = (data.len() as u16).to_be_bytes();
    let mut v = vec![b'd', hi, lo, memtype];
    v.extend_from_slice(data);
    v.push(b' ');
    v
}

fn read_page(memtype: u8, len: u16) -> Vec<u8> {
    let [hi, lo] = len.to_be_bytes();
    vec![b't', hi, lo, memtype, b' ']
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(7).wrapping_add(seed)).collect()
}

#[test]
fn sync_is_idempotent() {
    for n in 1..=8 {
        let mut bl = boot(Device::ATmega8);
        let mut s = BootloaderSession::new();

        let out = exchange(&mut bl, &mut s, &b"0 ".repeat(n));

        assert_eq!(out, ACK.repeat(n));
    }
}

#[test]
fn sign_on() {
    let mut bl = boot(Device::ATmega8);
    let mut s = BootloaderSession::new();

    assert_eq!(exchange(&mut bl, &mut s, b"1 "), framed(b"AVR ISP"));
}

#[test]
fn parameters() {
    let mut bl = boot(Device::ATmega8);
    let mut s = BootloaderSession::new();

    let out = exchange(&mut bl, &mut s, b"A\x80 A\x81 A\x82 A\x98 A\x90 ");

    let mut expected = framed(&[0x02]);
    expected.extend(framed(&[0x01]));
    expected.extend(framed(&[0x12]));
    expected.extend(framed(&[0x03]));
    expected.extend(framed(&[0x00]));
    assert_eq!(out, expected);
}

#[test]
fn configured_versions() {
    let mut bl = SimBootloader::simulated(Options {
        hw_ver: 0x03,
        sw_minor: 0x20,
        ..options(Device::ATmega8)
    });
    let mut s = BootloaderSession::new();

    let out = exchange(&mut bl, &mut s, b"A\x80 A\x82 ");

    let mut expected = framed(&[0x03]);
    expected.extend(framed(&[0x20]));
    assert_eq!(out, expected);
}

#[test]
fn dont_care_commands_ack() {
    let mut bl = boot(Device::ATmega8);
    let mut s = BootloaderSession::new();

    let mut input = b"@\x10 @\x86\x00 ".to_vec();
    input.push(b'B');
    input.extend_from_slice(&[0xAA; 20]);
    input.push(b' ');
    input.push(b'E');
    input.extend_from_slice(&[0xAA; 5]);
    input.push(b' ');
    input.extend_from_slice(b"P Q R ");

    let out = exchange(&mut bl, &mut s, &input);

    assert_eq!(out, ACK.repeat(7));
    assert!(bl.flash().ops().is_empty());
}

#[test]
fn unsupported_reads_return_zero() {
    let mut bl = boot(Device::ATmega8);
    let mut s = BootloaderSession::new();

    let out = exchange(&mut bl, &mut s, b"V\xAC\x53\x00\x00 v ");

    let mut expected = framed(&[0x00]);
    expected.extend(framed(&[0x00]));
    assert_eq!(out, expected);
}

#[test]
fn signature_follows_device() {
    let cases = [
        (Device::ATmega8, [0x1E, 0x93, 0x07]),
        (Device::ATmega168, [0x1E, 0x94, 0x06]),
        (Device::ATmega128, [0x1E, 0x97, 0x02]),
    ];

    for (device, sig) in cases.iter() {
        let mut bl = boot(*device);
        let mut s = BootloaderSession::new();
        assert_eq!(exchange(&mut bl, &mut s, b"u "), framed(sig));
    }
}

#[test]
fn address_round_trip() {
    let device = Device::ATmega8;
    let image = pattern(device.flash_bytes(), 3);
    let mut bl = boot_with_image(device, &image);

    for addr in [0x0000u16, 0x0001, 0x007F, 0x0FFF, 0x1000, 0x8001, 0xFFFF].iter() {
        let mut s = BootloaderSession::new();
        let mut input = load_address(*addr);
        input.extend(read_page(b'F', 2));

        let out = exchange(&mut bl, &mut s, &input);

        let byte_addr = (*addr << 1) as usize % device.flash_bytes();
        let mut expected = ACK.to_vec();
        expected.extend(framed(&image[byte_addr..byte_addr + 2]));
        assert_eq!(out, expected, "address 0x{:04x}", addr);

        // Flash reads leave the address as a byte address past the block
        assert_eq!(s.address, (*addr << 1).wrapping_add(2));
    }
}

#[test]
fn page_write_readback() {
    for len in [1usize, 2, 31, 64, 65, 127, 255, 256].iter() {
        let mut bl = boot(Device::ATmega8);
        let mut s = BootloaderSession::new();
        let data = pattern(*len, 0x40);

        let mut input = load_address(0x40);
        input.extend(prog_page(b'F', &data));
        input.extend(load_address(0x40));
        input.extend(read_page(b'F', (len + len % 2) as u16));

        let out = exchange(&mut bl, &mut s, &input);

        let mut readback = data.clone();
        if len % 2 == 1 {
            readback.push(0xFF);
        }
        let mut expected = ACK.repeat(3);
        expected.extend(framed(&readback));
        assert_eq!(out, expected, "length {}", len);
    }
}

#[test]
fn odd_length_uses_configured_pad() {
    let mut bl = SimBootloader::simulated(Options {
        pad_byte: 0x00,
        ..options(Device::ATmega8)
    });
    let mut s = BootloaderSession::new();

    let mut input = load_address(0);
    input.extend(prog_page(b'F', &[0x11, 0x22, 0x33]));

    exchange(&mut bl, &mut s, &input);

    assert_eq!(&bl.flash().image()[..4], &[0x11, 0x22, 0x33, 0x00]);
}

#[test]
fn one_erase_per_page() {
    let device = Device::ATmega8;

    for len in [64usize, 65, 128, 256].iter() {
        let mut bl = boot(device);
        let mut s = BootloaderSession::new();

        let mut input = load_address(0x80);
        input.extend(prog_page(b'F', &pattern(*len, 1)));
        exchange(&mut bl, &mut s, &input);

        let pages = (len + device.page_bytes() - 1) / device.page_bytes();
        assert_eq!(bl.flash().erases(), pages, "length {}", len);
        assert_eq!(bl.flash().commits(), pages, "length {}", len);
    }
}

#[test]
fn flash_discipline_holds() {
    let mut bl = boot(Device::ATmega168);
    let mut s = BootloaderSession::new();

    let mut input = load_address(0);
    input.extend(prog_page(b'F', &pattern(256, 9)));
    input.extend(load_address(0x80));
    input.extend(prog_page(b'F', &pattern(100, 4)));
    input.extend(load_address(0));
    input.extend(read_page(b'F', 256));
    exchange(&mut bl, &mut s, &input);

    let flash = bl.flash();
    assert_eq!(flash.busy_violations(), 0);
    assert_eq!(flash.interrupt_violations(), 0);
    assert_eq!(flash.rww_violations(), 0);
}

#[test]
fn flash_write_keeps_address() {
    let mut bl = boot(Device::ATmega8);
    let mut s = BootloaderSession::new();

    let mut input = load_address(0x0123);
    input.extend(prog_page(b'F', &[1, 2, 3, 4]));
    exchange(&mut bl, &mut s, &input);

    assert_eq!(s.address, 0x0123);
    assert!(!s.eeprom);
    assert_eq!(s.length, 4);
}

#[test]
fn eeprom_byte_round_trip() {
    let cases = [(0x0000u16, 0x00u8), (0x0001, 0xFF), (0x0100, 0x5A), (0x01FF, 0xA5)];

    for (addr, value) in cases.iter() {
        let mut bl = boot(Device::ATmega8);
        let mut s = BootloaderSession::new();

        let mut input = load_address(*addr);
        input.extend(prog_page(b'E', &[*value]));
        input.extend(load_address(*addr));
        input.extend(read_page(b'E', 1));

        let out = exchange(&mut bl, &mut s, &input);

        let mut expected = ACK.repeat(3);
        expected.extend(framed(&[*value]));
        assert_eq!(out, expected);
        assert_eq!(bl.eeprom().busy_violations(), 0);
    }
}

#[test]
fn eeprom_block_advances_address() {
    let mut bl = boot(Device::ATmega8);
    let mut s = BootloaderSession::new();

    let mut input = load_address(0x20);
    input.extend(prog_page(b'E', b"hello"));
    let out = exchange(&mut bl, &mut s, &input);

    assert_eq!(out, ACK.repeat(2));
    assert_eq!(s.address, 0x25);
    assert!(s.eeprom);
    assert_eq!(&bl.eeprom().image()[0x20..0x25], b"hello");
    assert_eq!(bl.eeprom().writes(), 5);
    assert!(bl.flash().ops().is_empty());
}

#[test]
fn bad_terminator_is_silent() {
    let inputs: [&[u8]; 7] = [
        b"d\x00\x02F\x01\x02X",
        b"d\x00\x01E\x01X",
        b"t\x00\x02FX",
        b"uX",
        b"1X",
        b"0X",
        b"A\x80X",
    ];

    for input in inputs.iter() {
        let mut bl = boot(Device::ATmega8);
        let mut s = BootloaderSession::new();

        assert!(exchange(&mut bl, &mut s, input).is_empty(), "{:02x?}", input);
        assert!(bl.flash().ops().is_empty());
        assert_eq!(bl.eeprom().writes(), 0);
    }
}

#[test]
fn unknown_bytes_are_ignored() {
    let mut bl = boot(Device::ATmega8);
    let mut s = BootloaderSession::new();
    bl.transport().port().feed(b"S\xFF0 ");

    assert_eq!(bl.poll(&mut s), Ok(Handled::Ignored(b'S')));
    assert_eq!(bl.poll(&mut s), Ok(Handled::Ignored(0xFF)));
    assert_eq!(bl.poll(&mut s), Ok(Handled::Command(Command::GetSync)));
    assert_eq!(bl.transport().port().take_output(), ACK.to_vec());
}

#[cfg(not(feature = "monitor"))]
#[test]
fn monitor_escape_ignored_without_monitor() {
    let mut bl = boot(Device::ATmega8);
    let mut s = BootloaderSession::new();

    assert!(exchange(&mut bl, &mut s, b"!!!").is_empty());
}

#[cfg(feature = "monitor")]
#[test]
fn monitor_escape() {
    let mut bl = boot(Device::ATmega8);
    let mut s = BootloaderSession::new();
    bl.transport().port().feed(b"!!x!!!");

    assert_eq!(bl.poll(&mut s), Ok(Handled::Ignored(b'!')));
    assert_eq!(bl.poll(&mut s), Ok(Handled::MonitorRequested));
}

#[test]
fn oversized_block_stays_in_sync() {
    let mut bl = boot(Device::ATmega8);
    let mut s = BootloaderSession::new();
    let data = pattern(300, 2);

    let mut input = load_address(0);
    input.extend(prog_page(b'F', &data));
    input.extend(b"0 ");
    let out = exchange(&mut bl, &mut s, &input);

    assert_eq!(out, ACK.repeat(3));
    assert_eq!(&bl.flash().image()[..256], &data[..256]);
    assert_eq!(bl.flash().image()[256], 0xFF);
}

#[test]
fn empty_block_acks() {
    let mut bl = boot(Device::ATmega8);
    let mut s = BootloaderSession::new();

    let out = exchange(&mut bl, &mut s, &prog_page(b'F', &[]));

    assert_eq!(out, ACK.to_vec());
    assert!(bl.flash().ops().is_empty());
}

#[test]
fn extended_addressing_reads_upper_flash() {
    let device = Device::ATmega128;
    let mut image = vec![0u8; device.flash_bytes()];
    image[0x0000] = 0x11;
    image[0x10000] = 0xEE;
    image[0x10001] = 0xDD;
    let mut bl = boot_with_image(device, &image);
    let mut s = BootloaderSession::new();

    let mut input = load_address(0x8000);
    input.extend(read_page(b'F', 2));
    let out = exchange(&mut bl, &mut s, &input);

    let mut expected = ACK.to_vec();
    expected.extend(framed(&[0xEE, 0xDD]));
    assert_eq!(out, expected);
    assert!(s.rampz);
}

#[test]
fn extended_addressing_inert_on_small_parts() {
    let device = Device::ATmega8;
    let image = pattern(device.flash_bytes(), 0);
    let mut bl = boot_with_image(device, &image);
    let mut s = BootloaderSession::new();

    let mut input = load_address(0x8000);
    input.extend(read_page(b'F', 2));
    let out = exchange(&mut bl, &mut s, &input);

    let mut expected = ACK.to_vec();
    expected.extend(framed(&image[..2]));
    assert_eq!(out, expected);
    assert!(!s.rampz);
}

#[test]
fn extended_addressing_writes_upper_flash() {
    let device = Device::ATmega128;
    let mut bl = boot(device);
    let mut s = BootloaderSession::new();

    let mut input = load_address(0x8000);
    input.extend(prog_page(b'F', &[0xC0, 0xDE]));
    exchange(&mut bl, &mut s, &input);

    assert_eq!(&bl.flash().image()[0x10000..0x10002], &[0xC0, 0xDE]);
    assert_eq!(bl.flash().image()[0], 0xFF);
}

/// Records the handover instead of jumping to the reset vector
#[derive(Default)]
struct Launcher {
    started: bool,
}

impl Launcher {
    fn start(&mut self) {
        self.started = true;
    }
}

#[test]
fn silence_starts_application() {
    let mut bl = boot(Device::ATmega8);
    let mut s = BootloaderSession::new();
    let mut app = Launcher::default();

    let e = bl.serve(&mut s);
    if e.starts_application() {
        app.start();
    }

    assert_eq!(bl.options().time_limit(), LIMIT);
    assert_eq!(e, Error::Timeout(LIMIT + 1));
    assert!(app.started);
    assert_eq!(bl.transport().port().polls(), LIMIT + 1);
    assert!(bl.transport().port().output().is_empty());
}

#[test]
fn slow_host_survives_per_byte_timeout() {
    let mut bl = boot(Device::ATmega8);
    let mut s = BootloaderSession::new();

    for _ in 0..4 {
        bl.transport().port().feed_after(LIMIT - 2, b"0");
        bl.transport().port().feed_after(LIMIT - 2, b" ");
    }

    assert_eq!(bl.serve(&mut s), Error::Timeout(LIMIT + 1));
    assert_eq!(bl.transport().port().take_output(), ACK.repeat(4));
}

#[test]
fn session_timeout_accumulates_until_programming_mode() {
    let mut bl = SimBootloader::simulated(Options {
        timeout_policy: TimeoutPolicy::Session,
        ..options(Device::ATmega8)
    });
    let mut s = BootloaderSession::new();

    // 6 + 6 idle polls, then 'P' resets the count
    bl.transport().port().feed_after(6, b"0");
    bl.transport().port().feed_after(6, b" ");
    bl.transport().port().feed(b"P ");
    bl.transport().port().feed_after(10, b"0 ");
    // 10 more polls, then 10 overrun the limit
    bl.transport().port().feed_after(10, b"0 ");

    assert_eq!(bl.serve(&mut s), Error::Timeout(LIMIT + 1));
    assert_eq!(bl.transport().port().take_output(), ACK.repeat(3));
    assert_eq!(bl.transport().port().pending(), 2);
}

#[test]
fn application_presence() {
    let mut blank = boot(Device::ATmega8);
    assert!(!blank.application_present());

    let mut programmed = boot_with_image(Device::ATmega8, &[0x0C, 0x94]);
    assert!(programmed.application_present());
}

#[test]
fn example_scenario() {
    // 16 MHz part at its real timeout, driven one command at a time
    let mut bl = SimBootloader::simulated(Options::default());
    let mut s = BootloaderSession::new();
    let data: Vec<u8> = (0x00..0x20).collect();

    let mut input = load_address(0x1000);
    input.extend(prog_page(b'F', &data));
    input.extend(load_address(0x1000));
    input.extend(read_page(b'F', 32));
    bl.transport().port().feed(&input);

    for _ in 0..4 {
        assert!(matches!(bl.poll(&mut s), Ok(Handled::Command(_))));
    }

    let mut expected = ACK.repeat(3);
    expected.extend(framed(&data));
    assert_eq!(bl.transport().port().take_output(), expected);
}
