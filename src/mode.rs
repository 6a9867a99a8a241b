// SPDX-License-Identifier: GPL-3.0-or-later

use std::{fmt, rc::Rc};

/// A plain description of a display mode as reported by a device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModeInfo {
    pub name: String,
    pub width: u32,
    pub height: u32,
    /// Vertical refresh rate in Hz. Zero if unknown.
    pub refresh: u32,
}

impl ModeInfo {
    pub fn new(name: impl Into<String>, width: u32, height: u32, refresh: u32) -> Self {
        Self {
            name: name.into(),
            width,
            height,
            refresh,
        }
    }
}

/// A mode in an [`Output`][crate::output::Output]'s mode catalog.
///
/// This is a reference-counted handle. Cloning acquires a reference, dropping releases it.
/// Modes are immutable and compared by identity: two modes with the same dimensions
/// belonging to different outputs are not the same mode.
#[derive(Clone)]
pub struct Mode {
    inner: Rc<ModeInfo>,
}

impl Mode {
    pub(crate) fn new(info: ModeInfo) -> Self {
        Self {
            inner: Rc::new(info),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn width(&self) -> u32 {
        self.inner.width
    }

    pub fn height(&self) -> u32 {
        self.inner.height
    }

    pub fn refresh(&self) -> u32 {
        self.inner.refresh
    }

    pub fn size(&self) -> (u32, u32) {
        (self.inner.width, self.inner.height)
    }

    pub fn info(&self) -> &ModeInfo {
        &self.inner
    }

    /// Whether `self` and `other` are the same catalog entry.
    pub fn same(&self, other: &Mode) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// The number of live handles to this mode.
    pub fn ref_count(&self) -> usize {
        Rc::strong_count(&self.inner)
    }
}

impl fmt::Debug for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mode")
            .field("name", &self.inner.name)
            .field("size", &(self.inner.width, self.inner.height))
            .field("refresh", &self.inner.refresh)
            .finish()
    }
}

/// Build a mode catalog from device-reported modes, in the order given.
pub(crate) fn build_catalog(infos: &[ModeInfo]) -> Vec<Mode> {
    infos.iter().cloned().map(Mode::new).collect()
}
