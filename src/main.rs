#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::process::ExitCode;

use clap::Parser;
use radius_proxy::config::{Cli, Config, LogLevel};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.version {
        println!("radsecproxyd {}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }

    let path = cli.config_path();
    let mut config = match Config::load(&path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{}: {err}", path.display());
            return ExitCode::FAILURE;
        }
    };

    if let Some(debug) = cli.debug {
        if let Some(level) = LogLevel::from_number(debug) {
            config.log_level = level;
        }
    }

    if let Err(err) = radius_proxy::logger::init(config.log_level, &config.log_destination, cli.foreground) {
        eprintln!("failed to initialize logging: {err}");
        return ExitCode::FAILURE;
    }

    if let Err(err) = radius_proxy::startup(config).await {
        log::error!("{err}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
