// SPDX-License-Identifier: GPL-3.0-or-later

use std::path::PathBuf;

use clap::ValueHint;

/// Devices kmscomp can drive.
#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    /// Drive the GPU's display controller directly from a tty
    #[default]
    Udev,
    /// Render to an in-memory device with one fake monitor
    Dummy,
}

/// The main CLI struct.
#[derive(clap::Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Run with the specified backend
    #[arg(short, long, value_enum, default_value_t)]
    pub backend: Backend,

    /// Use this DRM device instead of the seat's primary GPU
    ///
    /// Only used by the udev backend.
    #[arg(short, long, value_name("PATH"), value_hint(ValueHint::FilePath))]
    pub device: Option<PathBuf>,

    /// Load the config from this file instead of `$XDG_CONFIG_HOME/kmscomp/config.toml`
    #[arg(short, long, value_name("FILE"), value_hint(ValueHint::FilePath))]
    pub config: Option<PathBuf>,

    /// Exit after rendering this many frames
    ///
    /// The dummy backend renders 60 frames if this isn't set.
    #[arg(short, long)]
    pub frames: Option<u64>,
}
