//! MIDDS Headless Monitor
//!
//! Connects to a MIDDS device (or the built-in demo device), applies a channel
//! configuration and prints every channel's readings periodically.
//!
//! Usage:
//!   cargo run --example monitor -- [OPTIONS]
//!
//! Options:
//!   --port PORT       Serial port (overrides the configuration)
//!   --config FILE     JSON program configuration
//!   --demo            Use the simulated device instead of a serial port
//!   --record          Record the raw traffic while running
//!   --seconds N       Stop after N seconds (default: 10)
//!
//! Set RUST_LOG (e.g. `RUST_LOG=midds_core=debug`) for protocol logging.

use anyhow::Context;
use midds_core::prelude::*;
use midds_core::protocol::CHANNEL_COUNT;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args: Vec<String> = std::env::args().collect();

    let mut port_name: Option<String> = None;
    let mut config_path: Option<String> = None;
    let mut demo = false;
    let mut record = false;
    let mut seconds = 10u64;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" | "-p" => {
                i += 1;
                if i < args.len() {
                    port_name = Some(args[i].clone());
                }
            }
            "--config" | "-c" => {
                i += 1;
                if i < args.len() {
                    config_path = Some(args[i].clone());
                }
            }
            "--demo" => demo = true,
            "--record" => record = true,
            "--seconds" | "-s" => {
                i += 1;
                if i < args.len() {
                    seconds = args[i].parse().unwrap_or(10);
                }
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            other => {
                eprintln!("Unknown argument: {}", other);
                print_help();
                return Ok(());
            }
        }
        i += 1;
    }

    let mut config = match &config_path {
        Some(path) => ProgramConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path))?,
        None if demo => demo_config(),
        None => ProgramConfig::default(),
    };
    if let Some(port) = port_name {
        config.serial_port = Some(port);
    }
    if demo && config.serial_port.is_none() {
        config.serial_port = Some("demo".to_string());
    }

    let controller = if demo {
        SessionController::new(&config, DemoDevice::opener())
    } else {
        SessionController::with_serial(&config)
    };
    let session = controller.handle();
    let worker = controller.spawn().context("starting the session thread")?;

    session.open();
    if record {
        session.start_recording();
    }

    let deadline = Instant::now() + Duration::from_secs(seconds);
    while Instant::now() < deadline {
        thread::sleep(Duration::from_secs(1));

        if let Some(err) = session.take_error() {
            println!("[{}] {}: {}", err.timestamp.format("%H:%M:%S"), err.title, err.body);
        }
        if let Some(msg) = session.take_message() {
            println!("[{}] {}: {}", msg.timestamp.format("%H:%M:%S"), msg.title, msg.body);
        }

        println!("--- {:?} ---", session.state());
        for channel in session.snapshots() {
            if channel.mode == ChannelMode::Disabled {
                continue;
            }
            println!(
                "CH{:02} {:<12} {} level={} freq={} duty={} rise={} fall={}{}",
                channel.number,
                channel.name,
                channel.mode,
                format_level(channel.level),
                format_value(channel.frequency, "Hz"),
                format_value(channel.duty_cycle, "%"),
                format_value(channel.rising_delta, "s"),
                format_value(channel.falling_delta, "s"),
                if channel.well_configured { "" } else { " (not configured)" }
            );
        }
    }

    if record {
        session.stop_recording();
    }
    session.close();
    session.shutdown();
    worker
        .join()
        .map_err(|_| anyhow::anyhow!("session thread panicked"))?;

    let stats = session.decoder_stats();
    println!(
        "Decoded {} frames ({} noise bytes, {} malformed)",
        stats.frames, stats.noise_bytes, stats.malformed_frames
    );
    if let Some(path) = session.recording_path() {
        println!("Recording: {}", path.display());
    }
    Ok(())
}

/// A few channels in every mode, with SYNC on channel 0
fn demo_config() -> ProgramConfig {
    let json = r#"{
        "sync": { "channel": 0, "frequency": 5.0, "duty_cycle": 50.0 },
        "channels": [
            { "number": 0, "name": "sync", "settings": { "mode": "MB" } },
            { "number": 1, "name": "clock", "settings": { "mode": "MB" } },
            { "number": 2, "name": "rising", "settings": { "mode": "MR" } },
            { "number": 3, "name": "sensor", "settings": { "mode": "IN", "report_frequency": true } },
            { "number": 9, "name": "enable", "settings": { "mode": "OU" } }
        ]
    }"#;
    ProgramConfig::from_json_str(json).unwrap_or_default()
}

fn format_level(level: Reading<Level>) -> String {
    match level {
        Reading::Known(level) => level.to_string(),
        Reading::Unknown => "?".to_string(),
        Reading::NotApplicable => "-".to_string(),
    }
}

fn format_value(value: Reading<f64>, unit: &str) -> String {
    match value {
        Reading::Known(v) => format!("{:.4}{}", v, unit),
        Reading::Unknown => "?".to_string(),
        Reading::NotApplicable => "-".to_string(),
    }
}

fn print_help() {
    println!("MIDDS headless monitor");
    println!();
    println!("Usage: monitor [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --port PORT       Serial port (overrides the configuration)");
    println!("  --config FILE     JSON program configuration");
    println!("  --demo            Use the simulated device instead of a serial port");
    println!("  --record          Record the raw traffic while running");
    println!("  --seconds N       Stop after N seconds (default: 10)");
    println!();
    println!("Channels: 0..{}", CHANNEL_COUNT);
}
