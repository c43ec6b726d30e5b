use clap::{Arg, ArgMatches, Command};

use modbridge::boot;

fn parse_args() -> ArgMatches {
    Command::new("modbridge")
        .about("Bridge between Modbus RTU/TCP fieldbuses and an MQTT broker")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .value_name("FILE")
                .help("Configuration file path (default: ./modbridge.toml)"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .default_value("info")
                .help("Log level: error, warn, info, debug, trace"),
        )
        .arg(
            Arg::new("check")
                .long("check")
                .action(clap::ArgAction::SetTrue)
                .help("Validate the configuration and exit"),
        )
        .get_matches()
}

fn main() {
    let matches = parse_args();

    let level = matches
        .get_one::<String>("log-level")
        .map(String::as_str)
        .unwrap_or("info");
    if let Err(e) = boot::init_logging(level) {
        eprintln!("{e}");
        std::process::exit(1);
    }

    if let Err(e) = boot::run(&matches) {
        log::error!("{e:#}");
        std::process::exit(1);
    }
}
