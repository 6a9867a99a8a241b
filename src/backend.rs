// SPDX-License-Identifier: GPL-3.0-or-later

//! The device boundary.
//!
//! A [`DisplayDevice`] is what the compositor talks to in order to discover connectors,
//! allocate scanout memory and flip buffers onto the screen. [`udev`] drives a real KMS
//! device; [`dummy`] keeps everything in memory.

use std::{cell::RefCell, fmt, rc::Rc};

use crate::{error::DeviceError, mode::ModeInfo, render::Pixels};

pub mod dummy;
pub mod udev;

/// A shared handle to a display device.
///
/// The device is owned by whoever created it; the compositor and every framebuffer
/// only hold references.
pub type DeviceHandle = Rc<RefCell<dyn DisplayDevice>>;

/// Identifies a physical connector on a device.
///
/// This stays the same across reprobes for as long as something is plugged into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectorId(pub u32);

impl fmt::Display for ConnectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connector#{}", self.0)
    }
}

/// Identifies one scanout buffer allocated by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub u64);

/// A connected connector as reported by [`DisplayDevice::probe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorInfo {
    pub id: ConnectorId,
    /// A human readable name, i.e. "HDMI-A-1".
    pub name: String,
    pub modes: Vec<ModeInfo>,
    /// Index into `modes` of the mode the monitor prefers.
    pub preferred: Option<usize>,
}

impl ConnectorInfo {
    /// Whether `other` describes the same mode catalog.
    pub fn same_catalog(&self, other: &ConnectorInfo) -> bool {
        self.modes == other.modes && self.preferred == other.preferred
    }
}

/// A buffer the device can scan out, together with CPU-visible storage for its contents.
///
/// The storage is shared with the rendering context; the device copies it into
/// scanout memory when the buffer is presented.
#[derive(Debug, Clone)]
pub struct ScanoutBuffer {
    id: BufferId,
    width: u32,
    height: u32,
    pixels: Pixels,
}

impl ScanoutBuffer {
    pub fn new(id: BufferId, width: u32, height: u32) -> Self {
        Self {
            id,
            width,
            height,
            pixels: Pixels::new(width, height),
        }
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn pixels(&self) -> &Pixels {
        &self.pixels
    }
}

pub trait DisplayDevice {
    /// Query the currently connected connectors.
    fn probe(&mut self) -> Result<Vec<ConnectorInfo>, DeviceError>;

    /// Allocate a front and a back buffer for driving `connector` at `mode`.
    fn allocate_scanout(
        &mut self,
        connector: ConnectorId,
        mode: &ModeInfo,
    ) -> Result<[ScanoutBuffer; 2], DeviceError>;

    /// Free a buffer returned by [`DisplayDevice::allocate_scanout`].
    fn release_scanout(&mut self, buffer: ScanoutBuffer);

    /// Put `buffer` on screen.
    ///
    /// The first present after an allocation or a [`resume`][DisplayDevice::resume]
    /// performs a full modeset.
    fn present(
        &mut self,
        connector: ConnectorId,
        mode: &ModeInfo,
        buffer: &ScanoutBuffer,
    ) -> Result<(), DeviceError>;

    /// Stop scanning out to `connector`.
    fn disable(&mut self, connector: ConnectorId) -> Result<(), DeviceError>;

    /// Give up exclusive access to the device.
    fn pause(&mut self);

    /// Take back exclusive access to the device.
    fn resume(&mut self) -> Result<(), DeviceError>;
}
