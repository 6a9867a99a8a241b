// SPDX-License-Identifier: GPL-3.0-or-later

use tracing::{debug, trace, warn};

use crate::{
    backend::{ConnectorId, DeviceHandle, ScanoutBuffer},
    context::{AttachmentId, Context, WeakContext},
    error::OutputError,
    mode::ModeInfo,
};

/// A double-buffered render target bound to one connector's scanout memory.
///
/// Drawing always goes to the back buffer; [`Framebuffer::swap`] puts it on screen
/// and starts drawing into the other one. Dropping the framebuffer releases both
/// buffers and their render attachments.
pub struct Framebuffer {
    context: WeakContext,
    device: DeviceHandle,
    connector: ConnectorId,
    mode: ModeInfo,
    /// Always two buffers until drop.
    buffers: Vec<ScanoutBuffer>,
    attachments: [AttachmentId; 2],
    back: usize,
}

impl std::fmt::Debug for Framebuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Framebuffer")
            .field("connector", &self.connector)
            .field("mode", &self.mode)
            .field("buffers", &self.buffers)
            .field("back", &self.back)
            .finish_non_exhaustive()
    }
}

impl Framebuffer {
    /// Bind two scanout buffers of `connector` to `context`.
    ///
    /// The framebuffer takes ownership of the buffers; they are handed back to the
    /// device on drop, or right away if the context cannot render into them.
    pub fn new(
        context: &Context,
        device: DeviceHandle,
        connector: ConnectorId,
        mode: &ModeInfo,
        buffers: [ScanoutBuffer; 2],
    ) -> Result<Self, OutputError> {
        let release = |device: &DeviceHandle, buffers: [ScanoutBuffer; 2]| {
            let mut device = device.borrow_mut();
            for buffer in buffers {
                device.release_scanout(buffer);
            }
        };

        let front = match context.create_attachment(&buffers[0]) {
            Ok(id) => id,
            Err(err) => {
                release(&device, buffers);
                return Err(err);
            }
        };
        let back = match context.create_attachment(&buffers[1]) {
            Ok(id) => id,
            Err(err) => {
                context.destroy_attachment(front);
                release(&device, buffers);
                return Err(err);
            }
        };

        debug!(%connector, mode = %mode.name, "Created framebuffer");

        Ok(Self {
            context: context.downgrade(),
            device,
            connector,
            mode: mode.clone(),
            buffers: buffers.into(),
            attachments: [front, back],
            back: 1,
        })
    }

    /// Make this framebuffer the target of all drawing on its context.
    ///
    /// This also makes the context current. The viewport has to be set again afterwards.
    pub fn make_current(&self) -> Result<(), OutputError> {
        let context = self
            .context
            .upgrade()
            .ok_or(OutputError::DeviceUnavailable)?;
        context.bind_attachment(self.attachments[self.back])
    }

    /// Whether drawing on the context currently goes to this framebuffer.
    pub fn is_current(&self) -> bool {
        self.context
            .upgrade()
            .is_some_and(|context| context.is_bound(self.attachments[self.back]))
    }

    /// Present the back buffer and swap front and back.
    ///
    /// A rejected flip leaves the buffers as they were and can be retried.
    pub fn swap(&mut self) -> Result<(), OutputError> {
        let _span = tracy_client::span!("Framebuffer::swap");

        let result =
            self.device
                .borrow_mut()
                .present(self.connector, &self.mode, &self.buffers[self.back]);

        if let Err(err) = result {
            debug!(connector = %self.connector, "Page flip failed: {err}");
            return Err(err.into());
        }

        let old_back = self.back;
        self.back ^= 1;
        if let Some(context) = self.context.upgrade() {
            context.rebind_attachment(self.attachments[old_back], self.attachments[self.back]);
        }
        trace!(connector = %self.connector, "Swapped buffers");

        Ok(())
    }

    pub fn connector(&self) -> ConnectorId {
        self.connector
    }

    pub fn mode(&self) -> &ModeInfo {
        &self.mode
    }

    pub fn size(&self) -> (u32, u32) {
        (self.mode.width, self.mode.height)
    }

    /// The buffer currently drawn into.
    pub fn back_buffer(&self) -> &ScanoutBuffer {
        &self.buffers[self.back]
    }

    /// The buffer currently on screen, once the first swap went through.
    pub fn front_buffer(&self) -> &ScanoutBuffer {
        &self.buffers[self.back ^ 1]
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        if let Some(context) = self.context.upgrade() {
            for attachment in self.attachments {
                context.destroy_attachment(attachment);
            }
        }

        match self.device.try_borrow_mut() {
            Ok(mut device) => {
                for buffer in self.buffers.drain(..) {
                    device.release_scanout(buffer);
                }
            }
            Err(err) => {
                warn!(connector = %self.connector, "Leaking scanout buffers: {err}");
            }
        }

        debug!(connector = %self.connector, "Destroyed framebuffer");
    }
}
