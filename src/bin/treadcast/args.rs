// Commandline argument parser using clap for TreadCast

use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use treadcast::{config::SessionConfig, quadrant_aggregator::PollStrategy};

#[derive(Debug, Parser, Clone)]
#[clap(version, about)]
pub struct TreadArgs {
    /// Session settings in RON; anything not given keeps its default
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Serial device of each pad quadrant, in quadrant order (up to 4)
    #[arg(short, long = "port", num_args = 1..=4)]
    pub ports: Vec<PathBuf>,

    /// Run on a simulated pad and synthetic cameras
    #[arg(long)]
    pub simulate: bool,

    /// How the pad quadrants are polled
    #[arg(long, value_enum)]
    pub strategy: Option<Strategy>,

    /// Broadcast delay in seconds
    #[arg(short, long)]
    pub delay: Option<f64>,

    /// Start with recording armed
    #[arg(short, long)]
    pub record: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Strategy {
    RoundRobin,
    FullScan,
}

impl From<Strategy> for PollStrategy {
    fn from(value: Strategy) -> Self {
        match value {
            Strategy::RoundRobin => PollStrategy::RoundRobin,
            Strategy::FullScan => PollStrategy::FullScan,
        }
    }
}

impl TreadArgs {
    /// Lets flags given on the commandline win over the config file.
    pub fn apply(&self, config: &mut SessionConfig) {
        if !self.ports.is_empty() {
            config.ports = Default::default();
            for (slot, port) in config.ports.iter_mut().zip(&self.ports) {
                *slot = Some(port.clone());
            }
        }
        if let Some(strategy) = self.strategy {
            config.strategy = strategy.into();
        }
        if let Some(delay) = self.delay {
            config.delay_seconds = delay;
        }
    }
}
