// SPDX-License-Identifier: GPL-3.0-or-later

//! An in-memory display device.
//!
//! Connectors are plugged and unplugged by hand and failures can be injected, which
//! makes this the device used by tests and by `--backend dummy`.

use std::{
    cell::RefCell,
    collections::{HashMap, HashSet},
    io,
    rc::Rc,
};

use indexmap::IndexMap;
use tracing::{debug, info};

use crate::{
    backend::{BufferId, ConnectorId, ConnectorInfo, DisplayDevice, ScanoutBuffer},
    config::Config,
    error::DeviceError,
    mode::ModeInfo,
    state::State,
};

pub const DUMMY_OUTPUT_NAME: &str = "Dummy-1";

#[derive(Debug, Default)]
pub struct Dummy {
    connectors: IndexMap<ConnectorId, ConnectorInfo>,
    next_connector: u32,
    /// Live scanout buffers and the connector they were allocated for.
    buffers: HashMap<BufferId, ConnectorId>,
    next_buffer: u64,
    /// What each enabled connector shows.
    presented: HashMap<ConnectorId, ScanoutBuffer>,
    needs_modeset: HashSet<ConnectorId>,
    paused: bool,

    fail_next_probe: bool,
    fail_next_resume: bool,
    fail_allocation: bool,
    reject_flips: bool,

    modesets: usize,
    flips: usize,
    probes: usize,
}

fn paused_error() -> DeviceError {
    DeviceError::Io(io::Error::new(
        io::ErrorKind::PermissionDenied,
        "device is paused",
    ))
}

impl Dummy {
    pub fn new() -> Self {
        Self {
            next_connector: 1,
            next_buffer: 1,
            ..Default::default()
        }
    }

    /// Wrap this device in a handle a compositor can use, keeping a typed handle around.
    pub fn into_shared(self) -> Rc<RefCell<Dummy>> {
        Rc::new(RefCell::new(self))
    }

    /// Plug a monitor into a new connector.
    pub fn plug(
        &mut self,
        name: impl Into<String>,
        modes: Vec<ModeInfo>,
        preferred: Option<usize>,
    ) -> ConnectorId {
        let id = ConnectorId(self.next_connector);
        self.next_connector += 1;

        let info = ConnectorInfo {
            id,
            name: name.into(),
            modes,
            preferred,
        };
        debug!(name = %info.name, %id, "Plugged dummy connector");
        self.connectors.insert(id, info);
        id
    }

    /// Unplug the monitor on the connector called `name`.
    pub fn unplug(&mut self, name: &str) -> bool {
        let Some(id) = self.connector_id(name) else {
            return false;
        };
        self.connectors.shift_remove(&id);
        self.presented.remove(&id);
        self.needs_modeset.remove(&id);
        debug!(name, %id, "Unplugged dummy connector");
        true
    }

    /// Replace the mode list of a connected connector, as if another monitor was swapped in.
    pub fn set_modes(&mut self, name: &str, modes: Vec<ModeInfo>, preferred: Option<usize>) {
        if let Some(info) = self
            .connectors
            .values_mut()
            .find(|info| info.name == name)
        {
            info.modes = modes;
            info.preferred = preferred;
        }
    }

    pub fn connector_id(&self, name: &str) -> Option<ConnectorId> {
        self.connectors
            .values()
            .find(|info| info.name == name)
            .map(|info| info.id)
    }

    /// Make the next probe fail with an I/O error.
    pub fn fail_next_probe(&mut self) {
        self.fail_next_probe = true;
    }

    /// Make the next attempt to reacquire the device fail.
    pub fn fail_next_resume(&mut self) {
        self.fail_next_resume = true;
    }

    pub fn set_fail_allocation(&mut self, fail: bool) {
        self.fail_allocation = fail;
    }

    pub fn set_reject_flips(&mut self, reject: bool) {
        self.reject_flips = reject;
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn modesets(&self) -> usize {
        self.modesets
    }

    pub fn flips(&self) -> usize {
        self.flips
    }

    pub fn probes(&self) -> usize {
        self.probes
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// The buffer last put on screen on `connector`.
    pub fn presented(&self, connector: ConnectorId) -> Option<&ScanoutBuffer> {
        self.presented.get(&connector)
    }
}

impl DisplayDevice for Dummy {
    fn probe(&mut self) -> Result<Vec<ConnectorInfo>, DeviceError> {
        self.probes += 1;
        if std::mem::take(&mut self.fail_next_probe) {
            return Err(DeviceError::Io(io::Error::other("injected probe failure")));
        }
        Ok(self.connectors.values().cloned().collect())
    }

    fn allocate_scanout(
        &mut self,
        connector: ConnectorId,
        mode: &ModeInfo,
    ) -> Result<[ScanoutBuffer; 2], DeviceError> {
        if self.paused {
            return Err(paused_error());
        }
        let info = self
            .connectors
            .get(&connector)
            .ok_or(DeviceError::UnknownConnector(connector))?;
        if !info.modes.contains(mode) {
            return Err(DeviceError::Allocation(format!(
                "{} does not support mode {}",
                info.name, mode.name
            )));
        }
        if self.fail_allocation {
            return Err(DeviceError::Allocation("injected allocation failure".into()));
        }

        let buffers = [0, 1].map(|_| {
            let id = BufferId(self.next_buffer);
            self.next_buffer += 1;
            self.buffers.insert(id, connector);
            ScanoutBuffer::new(id, mode.width, mode.height)
        });
        self.needs_modeset.insert(connector);

        Ok(buffers)
    }

    fn release_scanout(&mut self, buffer: ScanoutBuffer) {
        self.buffers.remove(&buffer.id());
    }

    fn present(
        &mut self,
        connector: ConnectorId,
        _mode: &ModeInfo,
        buffer: &ScanoutBuffer,
    ) -> Result<(), DeviceError> {
        if self.paused {
            return Err(paused_error());
        }
        if !self.connectors.contains_key(&connector) {
            return Err(DeviceError::UnknownConnector(connector));
        }
        if self.buffers.get(&buffer.id()) != Some(&connector) {
            return Err(DeviceError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "buffer was not allocated for this connector",
            )));
        }
        if self.reject_flips {
            return Err(DeviceError::Busy);
        }

        if self.needs_modeset.remove(&connector) {
            self.modesets += 1;
        } else {
            self.flips += 1;
        }
        self.presented.insert(connector, buffer.clone());

        Ok(())
    }

    fn disable(&mut self, connector: ConnectorId) -> Result<(), DeviceError> {
        self.presented.remove(&connector);
        self.needs_modeset.remove(&connector);
        Ok(())
    }

    fn pause(&mut self) {
        self.paused = true;
    }

    fn resume(&mut self) -> Result<(), DeviceError> {
        if std::mem::take(&mut self.fail_next_resume) {
            return Err(DeviceError::Io(io::Error::other("injected resume failure")));
        }
        self.paused = false;
        self.needs_modeset.extend(self.presented.keys().copied());
        Ok(())
    }
}

/// Render `frames` frames on a dummy device with one monitor and log what happened.
pub fn run_dummy(config: Config, frames: u64) -> anyhow::Result<()> {
    let mut dummy = Dummy::new();
    dummy.plug(
        DUMMY_OUTPUT_NAME,
        vec![
            ModeInfo::new("1920x1080", 1920, 1080, 60),
            ModeInfo::new("1280x720", 1280, 720, 60),
        ],
        Some(0),
    );
    let dummy = dummy.into_shared();

    let mut state = State::new(dummy.clone(), config)?;
    state.activate_outputs();

    for _ in 0..frames {
        state.render_frame();
    }

    let dummy = dummy.borrow();
    info!(
        frames,
        modesets = dummy.modesets(),
        flips = dummy.flips(),
        "Dummy run finished"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn modes() -> Vec<ModeInfo> {
        vec![ModeInfo::new("800x600", 800, 600, 60)]
    }

    #[test]
    fn first_present_after_allocation_is_a_modeset() {
        let mut dummy = Dummy::new();
        let id = dummy.plug("Virtual-1", modes(), Some(0));

        let [a, b] = dummy.allocate_scanout(id, &modes()[0]).unwrap();
        dummy.present(id, &modes()[0], &b).unwrap();
        dummy.present(id, &modes()[0], &a).unwrap();

        assert_eq!(dummy.modesets(), 1);
        assert_eq!(dummy.flips(), 1);
        assert_eq!(dummy.presented(id).map(ScanoutBuffer::id), Some(a.id()));
    }

    #[test]
    fn unsupported_modes_are_not_allocated() {
        let mut dummy = Dummy::new();
        let id = dummy.plug("Virtual-1", modes(), Some(0));

        let foreign = ModeInfo::new("640x480", 640, 480, 60);
        assert_matches!(
            dummy.allocate_scanout(id, &foreign),
            Err(DeviceError::Allocation(_))
        );
        assert_eq!(dummy.live_buffers(), 0);
    }

    #[test]
    fn paused_device_refuses_to_present() {
        let mut dummy = Dummy::new();
        let id = dummy.plug("Virtual-1", modes(), Some(0));
        let [_, b] = dummy.allocate_scanout(id, &modes()[0]).unwrap();
        dummy.present(id, &modes()[0], &b).unwrap();

        dummy.pause();
        assert_matches!(
            dummy.present(id, &modes()[0], &b),
            Err(DeviceError::Io(_))
        );

        dummy.resume().unwrap();
        dummy.present(id, &modes()[0], &b).unwrap();
        assert_eq!(dummy.modesets(), 2);
    }

    #[test]
    fn injected_probe_failure_happens_once() {
        let mut dummy = Dummy::new();
        dummy.plug("Virtual-1", modes(), Some(0));
        dummy.fail_next_probe();

        assert!(dummy.probe().is_err());
        assert_eq!(dummy.probe().unwrap().len(), 1);
    }
}
