use std::io::Write;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::Local;
use clap::ArgMatches;
use env_logger::Builder;
use log::LevelFilter;

use crate::bridge::Bridge;
use crate::config::Config;
use crate::signal::spawn_signal_listener;

/// Timestamped line logger; the level comes from `--log-level` with
/// `RUST_LOG` as an override hook for per-module filtering.
pub fn init_logging(level: &str) -> Result<()> {
    let level = LevelFilter::from_str(level)
        .with_context(|| format!("unknown log level '{level}'"))?;
    let mut builder = Builder::new();
    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}: {}",
                Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .filter_level(level);
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    builder.init();
    Ok(())
}

/// Load the configuration, start the workers and the broker connection,
/// and block in the main loop until a termination signal arrives.
pub fn run(matches: &ArgMatches) -> Result<()> {
    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("./modbridge.toml");

    let config = Config::from_file(config_path)?;
    log::info!(
        "loaded {} with {} network(s) and {} object(s)",
        config_path,
        config.networks.len(),
        config.objects.len()
    );

    if matches.get_flag("check") {
        println!("{config_path}: configuration ok");
        return Ok(());
    }

    // must happen before worker threads spawn so they inherit the mask
    let signals = spawn_signal_listener()?;

    let mut bridge = Bridge::build(&config)?;
    bridge.run(&signals);
    Ok(())
}
