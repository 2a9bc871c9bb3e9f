//! Live view with broadcast delay, freeze-and-scrub and slow-motion replay
//! for the pressure pad and its cameras.
//!
//! ```text
//! cargo run --bin treadcast -- --simulate --delay 1.5
//! cargo run --bin treadcast -- --port /dev/ttyUSB0 /dev/ttyUSB1 /dev/ttyUSB2 /dev/ttyUSB3
//! ```

mod args;
mod gui;
mod recorder;

use args::TreadArgs;
use clap::Parser;
use gui::{Screen, TerminalDisplay};
use log::{info, warn};
use recorder::FrameCounter;
use serial2::SerialPort;
use std::{
    error::Error,
    sync::{Arc, Mutex},
};
use treadcast::{
    config::SessionConfig,
    session::{Hardware, Session},
};

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let args = TreadArgs::parse();

    let mut config = match &args.config {
        Some(path) => SessionConfig::from_path(path)?,
        None => SessionConfig::default(),
    };
    args.apply(&mut config);

    if !args.simulate && !config.has_ports() {
        list_ports();
        return Ok(());
    }
    let hardware = if args.simulate {
        Hardware::Simulated
    } else {
        Hardware::Serial
    };

    let screen = Arc::new(Mutex::new(Screen::default()));
    let mut session = Session::start(
        &config,
        hardware,
        Vec::new(),
        Box::new(TerminalDisplay::new(Arc::clone(&screen))),
        Some(Box::new(FrameCounter::default())),
    )?;
    for name in session.failed_sources() {
        warn!("{} is not available, carrying on without it", name);
    }

    let commands = session.commands();
    if args.record {
        commands.arm_recording(true);
    }
    let res = gui::run(&screen, &commands, config.scrub_step, config.delay_seconds, args.record);

    session.shutdown();
    info!("Ran {} ticks, skipped {}", session.tick_stats().ran(), session.tick_stats().skipped());
    res?;
    Ok(())
}

fn list_ports() {
    match SerialPort::available_ports() {
        Ok(ports) if !ports.is_empty() => {
            println!("No pad ports given. Available devices:");
            for port in ports {
                println!("\t{}", port.to_string_lossy());
            }
            println!("Pass them with --port in quadrant order, or use --simulate.");
        }
        Ok(_) => println!("No serial devices found. Use --simulate to run without hardware."),
        Err(e) => eprintln!("Failed to list serial devices: {}", e),
    }
}
