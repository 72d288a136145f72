#[macro_use]
extern crate log;

use std::fs;
use std::path::{Path, PathBuf};

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use anyhow::{anyhow, Context};
use linux_embedded_hal::Delay;

use atmega_boot::sim::{SimEeprom, SimFlash, SimLed};
use atmega_boot::{signal_entry, Bootloader, BootloaderSession, Device, Options};

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    /// Serial port to serve the bootloader on
    #[structopt(long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Serial port baud rate
    #[structopt(long, default_value = "115200")]
    baud: usize,

    /// Raw flash image, loaded if present and written back after each session
    #[structopt(long, parse(from_os_str))]
    flash: Option<PathBuf>,

    /// Raw EEPROM image, loaded if present and written back after each session
    #[structopt(long, parse(from_os_str))]
    eeprom: Option<PathBuf>,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,
}

fn main() {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    if let Err(e) = run(o) {
        error!("{:?}", e);
        std::process::exit(1);
    }
}

fn run(o: Args) -> anyhow::Result<()> {
    let device = o.options.device;

    let flash = match load(o.flash.as_deref())? {
        Some(image) => SimFlash::from_image(device, &image),
        None => SimFlash::new(device),
    };
    let eeprom = match load(o.eeprom.as_deref())? {
        Some(image) => SimEeprom::from_image(device, &image),
        None => SimEeprom::new(device),
    };

    describe(device, &flash);

    info!("Connecting to serial port {}", o.port);

    let mut bl = Bootloader::linux(&o.port, o.baud, flash, eeprom, o.options.clone())
        .map_err(|e| anyhow!("Error opening serial port {}: {:?}", o.port, e))?;

    let mut led = SimLed::new();
    let mut delay = Delay;

    #[cfg(feature = "monitor")]
    let mut ram = atmega_boot::sim::SimRam::new();

    info!(
        "Starting application after {} ms without host activity",
        bl.options().time_limit() as u128 * atmega_boot::linux::POLL_PERIOD.as_millis()
    );

    loop {
        let _ = signal_entry(&mut led, &mut delay, bl.options().led_flashes);

        info!("Bootloader waiting for host");
        let mut session = BootloaderSession::new();

        #[cfg(feature = "monitor")]
        let e = bl.serve_with_monitor(&mut session, &mut ram);
        #[cfg(not(feature = "monitor"))]
        let e = bl.serve(&mut session);

        store(o.flash.as_deref(), bl.flash().image())?;
        store(o.eeprom.as_deref(), bl.eeprom().image())?;

        if !e.starts_application() {
            return Err(anyhow!("Serial port failed: {:?}", e));
        }

        if bl.application_present() {
            info!("Starting application");
            debug!("Reset vector: {}", hex::encode(&bl.flash().image()[..4]));
            return Ok(());
        }

        info!("No application present, restarting bootloader");
    }
}

fn describe(device: Device, flash: &SimFlash) {
    info!(
        "Simulating {} with {} flash ({} byte pages), {} EEPROM",
        device,
        bytefmt::format(device.flash_bytes() as u64),
        device.page_bytes(),
        bytefmt::format(device.eeprom_bytes() as u64),
    );
    info!("Signature: {}", hex::encode(device.signature()));

    let used = flash.image().iter().rposition(|b| *b != 0xFF).map(|i| i + 1).unwrap_or(0);
    info!("Flash image: {} in use", bytefmt::format(used as u64));
}

fn load(path: Option<&Path>) -> anyhow::Result<Option<Vec<u8>>> {
    match path {
        Some(p) if p.exists() => {
            let image = fs::read(p).with_context(|| format!("reading {}", p.display()))?;
            debug!("Loaded {} bytes from {}", image.len(), p.display());
            Ok(Some(image))
        }
        _ => Ok(None),
    }
}

fn store(path: Option<&Path>, image: &[u8]) -> anyhow::Result<()> {
    if let Some(p) = path {
        fs::write(p, image).with_context(|| format!("writing {}", p.display()))?;
        debug!("Saved {} to {}", bytefmt::format(image.len() as u64), p.display());
    }
    Ok(())
}
