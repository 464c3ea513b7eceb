#[macro_use]
extern crate log;

mod bedrock;
mod config;
mod crafty;
mod health;
mod metrics;
mod monitor;
mod proto;
mod proxy;
mod server;
mod service;
mod state;
mod status;
mod webhook;

use std::env;
use std::path::PathBuf;
use std::process;

use clap::{crate_description, crate_name, crate_version, Arg, Command};

use crate::config::Config;

fn cli() -> Command {
    Command::new(crate_name!())
        .version(crate_version!())
        .about(crate_description!())
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .default_value(config::CONFIG_FILE)
                .help("Path to the YAML config file"),
        )
}

#[tokio::main]
async fn main() {
    let matches = cli().get_matches();

    // Load a .env file when present, the API token may live there.
    let _ = dotenv::dotenv();

    let config_path = PathBuf::from(
        matches
            .get_one::<String>("config")
            .expect("config has a default value"),
    );

    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(err) => {
            init_log("info");
            error!(target: "craftnap", "Configuration error: {}", err);
            process::exit(1);
        }
    };

    init_log(&config.logging.level);
    info!(target: "craftnap", "craftnap v{} starting", crate_version!());
    info!(
        target: "craftnap",
        "Managing {} server(s)",
        config.servers.len()
    );

    if let Err(err) = service::run(config, config_path).await {
        error!(target: "craftnap", "{:#}", err);
        process::exit(1);
    }
}

/// Initialize the logger, the config level is a default that `RUST_LOG`
/// overrides.
fn init_log(level: &str) {
    if env::var_os("RUST_LOG").is_none() {
        env::set_var("RUST_LOG", level.to_lowercase());
    }
    pretty_env_logger::init_timed();
}
