// SPDX-License-Identifier: GPL-3.0-or-later

use clap::Parser;
use kmscomp::{
    backend::{dummy::run_dummy, udev::run_udev},
    cli::{Backend, Cli},
    config::Config,
};

const DEFAULT_DUMMY_FRAMES: u64 = 60;

fn main() -> anyhow::Result<()> {
    match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(env_filter) => {
            tracing_subscriber::fmt()
                .compact()
                .with_env_filter(env_filter)
                .init();
        }
        Err(_) => {
            tracing_subscriber::fmt().compact().init();
        }
    }

    #[cfg(feature = "tracy")]
    tracy_client::Client::start();

    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref())?;

    match cli.backend {
        Backend::Udev => {
            tracing::info!("Starting udev backend");
            run_udev(config, cli.device, cli.frames)?;
        }
        Backend::Dummy => {
            tracing::info!("Starting dummy backend");
            run_dummy(config, cli.frames.unwrap_or(DEFAULT_DUMMY_FRAMES))?;
        }
    }

    Ok(())
}
