//! Line-oriented front end for packctl.
//!
//! Reads one JSON command per line from stdin and writes the JSON replies
//! to stdout, one per line. Runs against the simulated gauge; logs go to
//! stderr.

use std::io::{self, BufRead, Write};

use anyhow::{Context, Result};

use packctl::{
    api::Controller,
    config::Settings,
    gauge::Gauge,
    hw_trait::StdDelay,
    sim::SimulatedGauge,
    smbus::Bus,
    tracing::{self, prelude::*},
};

fn main() -> Result<()> {
    tracing::init_stderr();

    let settings = Settings::from_env().context("reading settings")?;
    debug!(?settings, "Starting");

    let bus = Bus::new(SimulatedGauge::new(), StdDelay, settings.bus);
    let controller = Controller::new(Gauge::new(bus), settings.controller);

    if !controller.poll()? {
        warn!("Initial status refresh incomplete");
    }

    let stdout = io::stdout();
    let mut out = stdout.lock();
    for line in io::stdin().lock().lines() {
        let line = line.context("reading stdin")?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        for reply in controller.handle_line(line) {
            writeln!(out, "{}", reply)?;
        }
        out.flush()?;
    }

    info!("Input closed, exiting");
    Ok(())
}
