// SPDX-License-Identifier: GPL-3.0-or-later

//! A [`DisplayDevice`] backed by a KMS device node.
//!
//! Scanout buffers are dumb buffers. Rendered pixels are copied into them right before
//! they are put on screen.

use std::{collections::HashMap, io};

use smithay::{
    backend::drm::DrmDeviceFd,
    reexports::drm::{
        self, Device as _,
        buffer::{Buffer as _, DrmFourcc},
        control::{
            Device as _, ModeTypeFlags, PageFlipFlags, connector, crtc,
            dumbbuffer::DumbBuffer, framebuffer,
        },
    },
};
use tracing::{debug, info, warn};

use crate::{
    backend::{BufferId, ConnectorId, ConnectorInfo, DisplayDevice, ScanoutBuffer},
    error::DeviceError,
    mode::ModeInfo,
};

#[derive(Debug)]
struct DrmConnector {
    handle: connector::Handle,
    modes: Vec<drm::control::Mode>,
    needs_modeset: bool,
}

/// Which crtc drives which connector.
///
/// A crtc is assigned on first allocation and kept until the connector goes away.
/// Crtcs of unplugged connectors stay reserved until they have been turned off.
#[derive(Debug, Default)]
struct CrtcTable {
    assigned: HashMap<ConnectorId, crtc::Handle>,
    unplugged: HashMap<ConnectorId, crtc::Handle>,
}

impl CrtcTable {
    fn get(&self, connector: ConnectorId) -> Option<crtc::Handle> {
        self.assigned.get(&connector).copied()
    }

    fn assign(&mut self, connector: ConnectorId, crtc: crtc::Handle) {
        self.assigned.insert(connector, crtc);
    }

    fn is_taken(&self, crtc: crtc::Handle, by_other_than: ConnectorId) -> bool {
        self.assigned
            .iter()
            .chain(&self.unplugged)
            .any(|(&id, &taken)| id != by_other_than && taken == crtc)
    }

    /// Release the crtc of a vanished connector, or reserve it while `scanning_out`.
    fn unplug(&mut self, connector: ConnectorId, scanning_out: bool) {
        match self.assigned.remove(&connector) {
            Some(crtc) if scanning_out => {
                self.unplugged.insert(connector, crtc);
            }
            _ => {}
        }
    }

    fn replug(&mut self, connector: ConnectorId) {
        if let Some(crtc) = self.unplugged.remove(&connector) {
            self.assigned.insert(connector, crtc);
        }
    }

    /// The crtc that has to be turned off to disable `connector`.
    fn to_disable(&self, connector: ConnectorId) -> Option<crtc::Handle> {
        self.get(connector)
            .or_else(|| self.unplugged.get(&connector).copied())
    }

    fn disabled(&mut self, connector: ConnectorId) {
        self.unplugged.remove(&connector);
    }
}

#[derive(Debug)]
struct DrmScanout {
    connector: ConnectorId,
    dumb: DumbBuffer,
    fb: framebuffer::Handle,
}

#[derive(Debug)]
pub struct DrmDisplay {
    fd: DrmDeviceFd,
    connectors: HashMap<ConnectorId, DrmConnector>,
    crtcs: CrtcTable,
    buffers: HashMap<BufferId, DrmScanout>,
    next_buffer: u64,
    paused: bool,
}

fn mode_info(mode: &drm::control::Mode) -> ModeInfo {
    let (width, height) = mode.size();
    ModeInfo::new(
        mode.name().to_string_lossy(),
        u32::from(width),
        u32::from(height),
        mode.vrefresh(),
    )
}

fn paused_error() -> DeviceError {
    DeviceError::Io(io::Error::new(
        io::ErrorKind::PermissionDenied,
        "drm device is paused",
    ))
}

impl DrmDisplay {
    pub fn new(fd: DrmDeviceFd) -> Self {
        Self {
            fd,
            connectors: HashMap::new(),
            crtcs: CrtcTable::default(),
            buffers: HashMap::new(),
            next_buffer: 1,
            paused: false,
        }
    }

    /// Find a crtc that can drive `connector` and isn't driving anything else.
    fn pick_crtc(&self, connector: ConnectorId) -> Result<crtc::Handle, DeviceError> {
        let state = self
            .connectors
            .get(&connector)
            .ok_or(DeviceError::UnknownConnector(connector))?;
        let info = self.fd.get_connector(state.handle, false)?;
        let resources = self.fd.resource_handles()?;

        // Prefer whatever the connector is already wired to.
        let current = info
            .current_encoder()
            .and_then(|encoder| self.fd.get_encoder(encoder).ok())
            .and_then(|encoder| encoder.crtc());

        current
            .into_iter()
            .chain(info.encoders().iter().flat_map(|&encoder| {
                self.fd
                    .get_encoder(encoder)
                    .map(|encoder| resources.filter_crtcs(encoder.possible_crtcs()))
                    .unwrap_or_default()
            }))
            .find(|&crtc| !self.crtcs.is_taken(crtc, connector))
            .ok_or(DeviceError::NoCrtc(connector))
    }

    fn create_scanout(
        &mut self,
        connector: ConnectorId,
        mode: &ModeInfo,
    ) -> Result<ScanoutBuffer, DeviceError> {
        let mut dumb = self
            .fd
            .create_dumb_buffer((mode.width, mode.height), DrmFourcc::Xrgb8888, 32)
            .map_err(|err| DeviceError::Allocation(format!("dumb buffer: {err}")))?;

        // Start out black rather than with whatever the kernel handed us.
        match self.fd.map_dumb_buffer(&mut dumb) {
            Ok(mut mapping) => mapping.as_mut().fill(0),
            Err(err) => debug!("Failed to map new dumb buffer: {err}"),
        }

        let fb = match self.fd.add_framebuffer(&dumb, 24, 32) {
            Ok(fb) => fb,
            Err(err) => {
                if let Err(err) = self.fd.destroy_dumb_buffer(dumb) {
                    warn!("Failed to destroy dumb buffer: {err}");
                }
                return Err(DeviceError::Allocation(format!("framebuffer: {err}")));
            }
        };

        let id = BufferId(self.next_buffer);
        self.next_buffer += 1;
        self.buffers.insert(
            id,
            DrmScanout {
                connector,
                dumb,
                fb,
            },
        );

        Ok(ScanoutBuffer::new(id, mode.width, mode.height))
    }

    fn destroy_scanout(&mut self, id: BufferId) {
        let Some(scanout) = self.buffers.remove(&id) else {
            return;
        };
        if let Err(err) = self.fd.destroy_framebuffer(scanout.fb) {
            warn!("Failed to destroy framebuffer: {err}");
        }
        if let Err(err) = self.fd.destroy_dumb_buffer(scanout.dumb) {
            warn!("Failed to destroy dumb buffer: {err}");
        }
    }

    /// Copy rendered pixels into the dumb buffer behind `buffer`.
    fn upload(&mut self, buffer: &ScanoutBuffer) -> Result<framebuffer::Handle, DeviceError> {
        let scanout = self
            .buffers
            .get_mut(&buffer.id())
            .ok_or_else(|| DeviceError::Allocation(format!("unknown buffer {:?}", buffer.id())))?;

        let pitch = scanout.dumb.pitch() as usize;
        let (width, height) = buffer.size();
        let pixels = buffer.pixels().data();

        let mut mapping = self.fd.map_dumb_buffer(&mut scanout.dumb)?;
        let dst = mapping.as_mut();

        for (y, row) in pixels.chunks_exact(width as usize).take(height as usize).enumerate() {
            let start = y * pitch;
            let Some(line) = dst.get_mut(start..start + row.len() * 4) else {
                break;
            };
            for (texel, pixel) in line.chunks_exact_mut(4).zip(row) {
                texel.copy_from_slice(&pixel.to_le_bytes());
            }
        }

        Ok(scanout.fb)
    }
}

impl DisplayDevice for DrmDisplay {
    fn probe(&mut self) -> Result<Vec<ConnectorInfo>, DeviceError> {
        let resources = self.fd.resource_handles()?;
        let mut connected = Vec::new();

        for &handle in resources.connectors() {
            let info = match self.fd.get_connector(handle, true) {
                Ok(info) => info,
                Err(err) => {
                    warn!(?handle, "Failed to query connector: {err}");
                    continue;
                }
            };

            if info.state() != connector::State::Connected {
                continue;
            }

            let id = ConnectorId(u32::from(handle));
            let name = format!("{}-{}", info.interface().as_str(), info.interface_id());
            let modes = info.modes().to_vec();
            let preferred = modes
                .iter()
                .position(|mode| mode.mode_type().contains(ModeTypeFlags::PREFERRED));

            connected.push(ConnectorInfo {
                id,
                name,
                modes: modes.iter().map(mode_info).collect(),
                preferred,
            });

            self.crtcs.replug(id);
            let state = self.connectors.entry(id).or_insert_with(|| DrmConnector {
                handle,
                modes: Vec::new(),
                needs_modeset: true,
            });
            state.modes = modes;
        }

        let crtcs = &mut self.crtcs;
        let buffers = &self.buffers;
        self.connectors.retain(|id, _| {
            let still_connected = connected.iter().any(|info| info.id == *id);
            if !still_connected {
                crtcs.unplug(*id, buffers.values().any(|scanout| scanout.connector == *id));
            }
            still_connected
        });

        debug!(connected = connected.len(), "Probed drm connectors");
        Ok(connected)
    }

    fn allocate_scanout(
        &mut self,
        connector: ConnectorId,
        mode: &ModeInfo,
    ) -> Result<[ScanoutBuffer; 2], DeviceError> {
        if self.paused {
            return Err(paused_error());
        }

        let state = self
            .connectors
            .get(&connector)
            .ok_or(DeviceError::UnknownConnector(connector))?;
        if !state.modes.iter().any(|drm_mode| mode_info(drm_mode) == *mode) {
            return Err(DeviceError::Allocation(format!(
                "{connector} does not support mode {}",
                mode.name
            )));
        }

        if self.crtcs.get(connector).is_none() {
            let crtc = self.pick_crtc(connector)?;
            debug!(%connector, ?crtc, "Assigned crtc");
            self.crtcs.assign(connector, crtc);
        }

        let front = self.create_scanout(connector, mode)?;
        let back = match self.create_scanout(connector, mode) {
            Ok(back) => back,
            Err(err) => {
                self.destroy_scanout(front.id());
                return Err(err);
            }
        };

        if let Some(state) = self.connectors.get_mut(&connector) {
            state.needs_modeset = true;
        }

        Ok([front, back])
    }

    fn release_scanout(&mut self, buffer: ScanoutBuffer) {
        self.destroy_scanout(buffer.id());
    }

    fn present(
        &mut self,
        connector: ConnectorId,
        mode: &ModeInfo,
        buffer: &ScanoutBuffer,
    ) -> Result<(), DeviceError> {
        if self.paused {
            return Err(paused_error());
        }

        let (handle, crtc, drm_mode, needs_modeset) = {
            let state = self
                .connectors
                .get(&connector)
                .ok_or(DeviceError::UnknownConnector(connector))?;
            let crtc = self
                .crtcs
                .get(connector)
                .ok_or(DeviceError::NoCrtc(connector))?;
            let drm_mode = state
                .modes
                .iter()
                .find(|drm_mode| mode_info(drm_mode) == *mode)
                .copied()
                .ok_or(DeviceError::UnknownConnector(connector))?;
            (state.handle, crtc, drm_mode, state.needs_modeset)
        };

        if self
            .buffers
            .get(&buffer.id())
            .is_none_or(|scanout| scanout.connector != connector)
        {
            return Err(DeviceError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "buffer was not allocated for this connector",
            )));
        }

        let fb = self.upload(buffer)?;

        if needs_modeset {
            self.fd
                .set_crtc(crtc, Some(fb), (0, 0), &[handle], Some(drm_mode))?;
            if let Some(state) = self.connectors.get_mut(&connector) {
                state.needs_modeset = false;
            }
            info!(%connector, mode = %mode.name, "Modeset");
            return Ok(());
        }

        match self.fd.page_flip(crtc, fb, PageFlipFlags::empty(), None) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::ResourceBusy => Err(DeviceError::Busy),
            Err(err) => Err(err.into()),
        }
    }

    fn disable(&mut self, connector: ConnectorId) -> Result<(), DeviceError> {
        if let Some(state) = self.connectors.get_mut(&connector) {
            state.needs_modeset = true;
        }

        // The connector may already be gone from the last probe.
        if let Some(crtc) = self.crtcs.to_disable(connector) {
            self.fd.set_crtc(crtc, None, (0, 0), &[], None)?;
            debug!(%connector, ?crtc, "Disabled crtc");
        }
        self.crtcs.disabled(connector);
        Ok(())
    }

    fn pause(&mut self) {
        self.paused = true;
        if let Err(err) = self.fd.release_master_lock() {
            debug!("Failed to drop drm master: {err}");
        }
    }

    fn resume(&mut self) -> Result<(), DeviceError> {
        // The session usually hands master back on its own.
        if let Err(err) = self.fd.acquire_master_lock() {
            debug!("Failed to acquire drm master: {err}");
        }
        self.paused = false;
        for state in self.connectors.values_mut() {
            state.needs_modeset = true;
        }
        Ok(())
    }
}

impl Drop for DrmDisplay {
    fn drop(&mut self) {
        let ids = self.buffers.keys().copied().collect::<Vec<_>>();
        for id in ids {
            self.destroy_scanout(id);
        }
    }
}
