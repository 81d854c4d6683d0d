//! Loopgrid Player - headless loop playback
//!
//! Loads one file into slot 0, sets its loop window and speed, and plays it
//! for a while on the configured output device.
//!
//! ```text
//! loopgrid-player <file> [loop_start] [loop_end] [speed] [seconds] [--key-lock]
//! loopgrid-player --list-devices
//! ```
//!
//! Engine settings come from `~/.config/loopgrid/engine.yaml`; a default file
//! is written there on first run.

use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};

use loopgrid_core::audio::list_output_devices;
use loopgrid_core::config::{self, EngineConfig};
use loopgrid_core::{Collaborators, Session, SlotId};

const SLOT: SlotId = SlotId(0);
const DEFAULT_SECONDS: f64 = 10.0;
const POLL_INTERVAL: Duration = Duration::from_millis(20);

struct Args {
    file: PathBuf,
    loop_start: Option<f64>,
    loop_end: Option<f64>,
    speed: f64,
    seconds: f64,
    key_lock: bool,
}

fn parse_args(raw: &[String]) -> Result<Args> {
    let key_lock = raw.iter().any(|a| a == "--key-lock");
    let mut positional = raw.iter().filter(|a| !a.starts_with("--"));

    let Some(file) = positional.next() else {
        bail!("usage: loopgrid-player <file> [loop_start] [loop_end] [speed] [seconds] [--key-lock]");
    };
    let mut number = |name: &str| -> Result<Option<f64>> {
        positional
            .next()
            .map(|v| v.parse::<f64>().with_context(|| format!("{} must be a number, got {:?}", name, v)))
            .transpose()
    };

    let loop_start = number("loop_start")?;
    let loop_end = number("loop_end")?;
    let speed = number("speed")?.unwrap_or(1.0);
    let seconds = number("seconds")?.unwrap_or(DEFAULT_SECONDS);

    Ok(Args {
        file: PathBuf::from(file),
        loop_start,
        loop_end,
        speed,
        seconds,
        key_lock,
    })
}

fn main() -> Result<()> {
    // RUST_LOG=debug for verbose output
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let raw: Vec<String> = std::env::args().skip(1).collect();
    if raw.iter().any(|a| a == "--list-devices") {
        for name in list_output_devices() {
            println!("{}", name);
        }
        return Ok(());
    }
    let args = parse_args(&raw)?;

    let config_path = config::default_config_path();
    if !config_path.exists() {
        if let Err(e) = config::save_config(&EngineConfig::default(), &config_path) {
            log::warn!("Could not write default config: {:#}", e);
        }
    }
    let engine_config: EngineConfig = config::load_config(&config_path);

    let mut session = Session::boot(engine_config, Collaborators::default()).context("starting audio engine")?;
    session
        .load(SLOT, &args.file)
        .with_context(|| format!("loading {:?}", args.file))?;

    if args.loop_start.is_some() || args.loop_end.is_some() {
        let slot = session.slot(SLOT)?;
        let duration = slot.duration_secs().unwrap_or(0.0);
        let start = args.loop_start.unwrap_or(0.0);
        let end = args.loop_end.unwrap_or(duration);
        session.update_loop_points(SLOT, start, end)?;
    }
    session.set_key_lock(SLOT, args.key_lock)?;
    session.set_speed(SLOT, args.speed)?;
    session.trigger(SLOT)?;
    log::info!("Playing {:?} for {:.1}s", args.file, args.seconds);

    let deadline = Instant::now() + Duration::from_secs_f64(args.seconds.max(0.0));
    while Instant::now() < deadline {
        session.poll();
        thread::sleep(POLL_INTERVAL);
    }

    session.shutdown();
    Ok(())
}
