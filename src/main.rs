use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Env;
use log::info;

use regtap::cli::Cli;
use regtap::engine::{SimEngine, UnicornEngine};
use regtap::regmap::Role;
use regtap::sink::{FanOut, JsonLinesSink};
use regtap::{HarnessConfig, Session};

fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(Env::default().default_filter_or(&cli.log_level)).init();

    info!("Starting regtap with {}", cli.image.display());

    let config = HarnessConfig::from_cli(&cli)?;
    let image = std::fs::read(&config.image).with_context(|| format!("reading {}", config.image.display()))?;
    config.image_end(image.len())?;
    let (begin, end) = config.run_range(image.len())?;

    if config.dry_run {
        return dry_run(&config);
    }

    let mut engine = UnicornEngine::new(config.architecture)?;
    engine.map(0, config.mem_size)?;
    engine.load(config.base, &image)?;
    info!("Loaded {} bytes at {:#x} for {:?}", image.len(), config.base, engine.architecture());

    let mut sinks = FanOut::new();
    if let Some(path) = &config.trace_file {
        sinks.push(Box::new(JsonLinesSink::create(path)?));
    }

    let mut session = Session::new(engine, config.session.clone(), sinks)?;
    session.install()?;
    let summary = session.run(begin, end, config.limits)?;
    session.cleanup()?;

    info!("Finished: {:?}, {} register write(s) observed", summary.exit, summary.observations);
    Ok(())
}

/// Attach the region and install every hook on a scripted engine that
/// treats memory above `--mem-size` as unmapped, then release everything.
/// The region is never unlinked.
fn dry_run(config: &HarnessConfig) -> Result<()> {
    let engine = SimEngine::new(Vec::new()).with_unmapped(config.mem_size, u64::MAX);
    let mut session_config = config.session.clone();
    session_config.unlink_on_cleanup = false;

    let mut session = Session::new(engine, session_config, FanOut::new())?;
    let hooks = session.install()?;
    let registers = session.registers();
    info!(
        "Dry run ok: {} hook(s) for {} data / {} status register(s)",
        hooks,
        registers.count(Role::Data),
        registers.count(Role::Status)
    );
    session.cleanup()?;
    Ok(())
}
