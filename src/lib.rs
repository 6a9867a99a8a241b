// SPDX-License-Identifier: GPL-3.0-or-later

//! Output management for a compositor that drives monitors through kernel mode setting.
//!
//! A [`Compositor`] owns one display device and one rendering [`Context`]. Every monitor
//! plugged into the device shows up as an [`Output`] with a catalog of [`Mode`]s.
//! Activating an output gives it a double-buffered framebuffer that the context draws
//! into; [`Output::swap`] puts the result on screen.

pub mod backend;
pub mod cli;
pub mod compositor;
pub mod config;
pub mod context;
pub mod error;
pub mod framebuffer;
pub mod mode;
pub mod output;
pub mod render;
pub mod state;

pub use compositor::Compositor;
pub use context::Context;
pub use error::{BusyReason, DeviceError, OutputError};
pub use framebuffer::Framebuffer;
pub use mode::{Mode, ModeInfo};
pub use output::Output;
