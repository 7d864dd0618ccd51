// rfsentry: Honeywell 5800 security sensor ingestion over a 345 MHz SDR.

use clap::{Arg, Command};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use rfsentry::daemon;

fn init_tracing() {
    let default = if cfg!(debug_assertions) { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if cfg!(debug_assertions) {
        builder.init();
    } else {
        builder.json().init();
    }
}

#[tokio::main]
async fn main() {
    let matches = Command::new("rfsentry")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Tracks Honeywell 5800 wireless security sensors via an rtl_433 SDR decoder")
        .arg(
            Arg::new("database")
                .help("Path to the SQLite state database")
                .value_name("DATABASE")
                .required(true),
        )
        .arg(
            Arg::new("sdr_device")
                .help("SDR device to listen to. USB device index or colon and serial number.")
                .long("sdr-device")
                .value_name("DEVICE"),
        )
        .get_matches();

    init_tracing();
    info!(version = env!("CARGO_PKG_VERSION"), "rfsentry starting");

    let conf = daemon::Config {
        db_path: matches
            .get_one::<String>("database")
            .cloned()
            .expect("DATABASE is a required argument"),
        sdr_device: matches.get_one::<String>("sdr_device").cloned(),
    };

    if let Err(e) = daemon::run(&conf).await {
        error!(error = %e, "aborting");
        std::process::exit(1);
    }
}
