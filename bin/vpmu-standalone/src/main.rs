// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::num::ParseIntError;

use anyhow::Context;
use clap::Parser;
use slog::{info, o, Drain};

use vpmu::usdt::register_probes;

mod replay;

fn build_log() -> (slog::Logger, slog_async::AsyncGuard) {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::CompactFormat::new(decorator).build().fuse();
    let (drain, guard) = slog_async::Async::new(drain).build_with_guard();
    (slog::Logger::root(drain.fuse(), o!()), guard)
}

/// Accepts a CPU family in decimal or `0x`-prefixed hexadecimal.
fn parse_family(raw: &str) -> Result<u8, ParseIntError> {
    match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => raw.parse(),
    }
}

/// Picks the CPU family to model: the command line wins over the config file,
/// which wins over the host itself.
fn resolve_family(
    log: &slog::Logger,
    cli: Option<u8>,
    config: Option<u8>,
) -> anyhow::Result<u8> {
    if let Some(family) = cli.or(config) {
        return Ok(family);
    }

    let family = cpuid_utils::host::amd_family().context(
        "Cannot determine the host CPU family; \
        set main.cpu_family or pass --family",
    )?;
    info!(log, "using host CPU family"; "family" => format!("{family:#x}"));
    Ok(family)
}

#[derive(clap::Parser)]
/// Replays trapped PMU accesses and scheduler events against AMD vPMUs on a
/// simulated host.
struct Args {
    /// The harness config file.
    #[clap(value_name = "CONFIG", action)]
    config: String,

    /// CPU family to model, overriding the config file.
    #[clap(short, long, value_parser = parse_family)]
    family: Option<u8>,

    /// Dump every vCPU's vPMU state after the replay.
    #[clap(short, long, action)]
    dump: bool,
}

fn main() -> anyhow::Result<()> {
    let Args { config, family, dump } = Args::parse();

    // Ensure proper setup of USDT probes
    register_probes().context("Failed to setup USDT probes")?;

    let (log, _log_async_guard) = build_log();

    let config = vpmu_config::parse(&config)
        .with_context(|| format!("Failed to parse config {config}"))?;
    let family = resolve_family(&log, family, config.main.cpu_family)?;

    let mut harness = replay::Harness::new(&log, &config, family);
    let mut out = std::io::stdout().lock();
    for (i, step) in config.steps.iter().enumerate() {
        harness.step(step, &mut out).with_context(|| format!("step {i}"))?;
    }
    if dump {
        harness.dump_all(&mut out)?;
    }
    harness.destroy_all();

    info!(log, "replay complete"; "steps" => config.steps.len());
    Ok(())
}
