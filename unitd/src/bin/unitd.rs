// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

use unitd::config::Config;
use unitd::error::{Error, ErrorKind};
use unitd::server::ServerContext;

#[derive(Debug, Parser)]
#[command(name = "unitd", version, about = "Distributed real-time publish/subscribe broker")]
struct Cli {
    /// Specify config file path.
    #[arg(short, long, value_name = "config_file")]
    config: Option<PathBuf>,

    /// Test config file and exit.
    #[arg(short = 't', long)]
    test: bool,
}

fn load_config(cli: &Cli) -> Result<Config, Error> {
    let Some(path) = &cli.config else {
        return Ok(Config::default());
    };
    let content = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&content).map_err(|err| {
        Error::from_string(ErrorKind::ConfigError, format!("Invalid config: {err}"))
    })?;
    Ok(config)
}

fn run() -> Result<(), Error> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    config.validate()?;

    if cli.test {
        println!("Configuration syntax is Ok");
        return Ok(());
    }

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.log().level()),
    )
    .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let server = ServerContext::new(config);
    runtime.block_on(server.run())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("unitd: {err}");
            ExitCode::FAILURE
        }
    }
}
