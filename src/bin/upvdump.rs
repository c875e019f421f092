use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;

use usbpv::{
    CaptureOptions, CaptureSpeed, DeliveryMode, EventType, PacketSink, UpvDriver, list_devices,
    speed_bits,
};

/// Dump USB bus traffic from a tusb.org protocol analyzer to stdout.
#[derive(Debug, Parser)]
#[command(name = "upvdump")]
struct Args {
    /// Analyzer firmware image pushed to the device at open time
    #[arg(short = 'F', long, value_name = "FILE")]
    firmware: Option<PathBuf>,

    /// Serial number of the analyzer (defaults to the first one found)
    #[arg(short, long)]
    serial: Option<String>,

    /// Capture speed: auto, high, full or low
    #[arg(long, default_value = "auto")]
    speed: String,

    /// Event mask (decimal or 0x-prefixed hex), 0xff forwards everything
    #[arg(long, default_value = "0xff", value_parser = parse_mask)]
    mask: u8,

    /// Drop transactions matching the filter bank instead of accepting them
    #[arg(long)]
    reject: bool,

    /// Deliver raw 60 MHz ticks instead of wall-clock timestamps
    #[arg(long)]
    raw_ticks: bool,

    /// List matching devices and exit
    #[arg(short, long)]
    list: bool,
}

fn parse_mask(arg: &str) -> Result<u8, String> {
    let parsed = match arg.strip_prefix("0x") {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => arg.parse(),
    };
    parsed.map_err(|e| e.to_string())
}

fn parse_speed(arg: &str) -> anyhow::Result<CaptureSpeed> {
    Ok(match arg {
        "auto" => CaptureSpeed::Auto,
        "high" => CaptureSpeed::High,
        "full" => CaptureSpeed::Full,
        "low" => CaptureSpeed::Low,
        other => bail!("unknown capture speed '{other}'"),
    })
}

struct StdoutSink;

impl PacketSink for StdoutSink {
    fn on_packet(&mut self, sec: u64, nsec: u32, payload: &[u8], status: u32) -> i32 {
        let event = match EventType::from_status(status) {
            Some(EventType::Data) => "data",
            Some(EventType::ResetBegin) => "reset-begin",
            Some(EventType::ResetEnd) => "reset-end",
            Some(EventType::SuspendBegin) => "suspend-begin",
            Some(EventType::SuspendEnd) => "suspend-end",
            Some(EventType::Overflow) => "overflow",
            None => "unknown",
        };
        let speed = match speed_bits(status) {
            3 => "HS",
            2 => "FS",
            1 => "LS",
            _ => "??",
        };
        let hex: String = payload
            .iter()
            .map(|b| format!("{b:02x} "))
            .collect::<String>();
        println!(
            "{sec}.{nsec:09}  {speed}  {event:<13} len={:<4} {}",
            payload.len(),
            hex.trim_end()
        );
        0
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let devices = list_devices();
    if args.list {
        for serial in &devices {
            println!("{serial}");
        }
        return Ok(());
    }

    let serial = match args.serial {
        Some(serial) => serial,
        None => match devices.first() {
            Some(serial) => serial.clone(),
            None => bail!("no analyzer attached"),
        },
    };

    let Some(firmware_path) = args.firmware else {
        bail!("--firmware is required to open a device");
    };
    let firmware = fs::read(&firmware_path)
        .with_context(|| format!("reading firmware image {}", firmware_path.display()))?;

    let options = CaptureOptions {
        serial,
        speed: parse_speed(&args.speed)?,
        event_mask: args.mask,
        accept: !args.reject,
        ..CaptureOptions::default()
    };

    // The device library consumes the positional option blob.
    let blob = options.to_blob();
    let mut driver = UpvDriver::open(&blob, &firmware)
        .with_context(|| format!("opening analyzer '{}'", options.serial))?;
    let mode = if args.raw_ticks {
        DeliveryMode::RawTick
    } else {
        DeliveryMode::WallClock
    };
    driver
        .start_capture(Box::new(StdoutSink), mode, None)
        .context("starting capture")?;

    let running = Arc::new(AtomicBool::new(true));
    let ctrlc_flag = running.clone();
    ctrlc::set_handler(move || ctrlc_flag.store(false, Ordering::SeqCst))
        .context("installing Ctrl-C handler")?;

    eprintln!("capturing from '{}', Ctrl-C to stop", options.serial);
    while running.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(100));
    }

    driver
        .stop_capture(Duration::from_millis(1000))
        .context("stopping capture")?;
    driver.close().context("closing analyzer")?;
    Ok(())
}
