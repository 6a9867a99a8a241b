// SPDX-License-Identifier: GPL-3.0-or-later

use std::{
    cell::RefCell,
    fmt,
    rc::{Rc, Weak},
};

use tracing::{info, warn};

use crate::{
    backend::{ConnectorId, ConnectorInfo, DeviceHandle},
    compositor::CompositorInner,
    error::{BusyReason, OutputError},
    framebuffer::Framebuffer,
    mode::{self, Mode},
};

/// The mutable part of an output.
#[derive(Debug, Default)]
struct OutputState {
    modes: Vec<Mode>,
    /// Always an entry of `modes`.
    current: Option<Mode>,
    /// The mode the monitor prefers.
    default: Option<Mode>,
    /// Present iff the output is active.
    framebuffer: Option<Framebuffer>,
}

struct OutputInner {
    info: ConnectorInfo,
    /// Emptied when the compositor unbinds this output.
    compositor: RefCell<Weak<CompositorInner>>,
    state: RefCell<OutputState>,
}

/// A monitor plugged into a connector.
///
/// This is a reference-counted handle. The compositor holds one reference for as long
/// as the connector stays connected; callers may hold more. Once the compositor has
/// unbound the output (because it was unplugged, or the compositor went away), only the
/// read accessors keep working and everything else returns [`OutputError::Unbound`].
#[derive(Clone)]
pub struct Output {
    inner: Rc<OutputInner>,
}

impl PartialEq for Output {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Output {}

impl fmt::Debug for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Output")
            .field("name", &self.inner.info.name)
            .field("id", &self.inner.info.id)
            .field("active", &self.is_active())
            .field("bound", &self.is_bound())
            .finish()
    }
}

impl Output {
    pub(crate) fn new(info: ConnectorInfo, compositor: Weak<CompositorInner>) -> Self {
        let modes = mode::build_catalog(&info.modes);
        let default = info.preferred.and_then(|idx| modes.get(idx).cloned());

        Self {
            inner: Rc::new(OutputInner {
                info,
                compositor: RefCell::new(compositor),
                state: RefCell::new(OutputState {
                    modes,
                    current: None,
                    default,
                    framebuffer: None,
                }),
            }),
        }
    }

    /// The connector name, i.e. "HDMI-A-1".
    pub fn name(&self) -> &str {
        &self.inner.info.name
    }

    pub fn id(&self) -> ConnectorId {
        self.inner.info.id
    }

    pub(crate) fn connector_info(&self) -> &ConnectorInfo {
        &self.inner.info
    }

    /// This output's mode catalog, in the order the device reported it.
    pub fn modes(&self) -> impl Iterator<Item = Mode> + use<> {
        self.inner.state.borrow().modes.clone().into_iter()
    }

    /// The mode the output was last activated with.
    pub fn current_mode(&self) -> Option<Mode> {
        self.inner.state.borrow().current.clone()
    }

    /// The mode the monitor prefers.
    pub fn default_mode(&self) -> Option<Mode> {
        self.inner.state.borrow().default.clone()
    }

    /// Find a mode in the catalog by name.
    pub fn find_mode(&self, name: &str) -> Option<Mode> {
        self.inner
            .state
            .borrow()
            .modes
            .iter()
            .find(|mode| mode.name() == name)
            .cloned()
    }

    pub fn is_active(&self) -> bool {
        self.inner.state.borrow().framebuffer.is_some()
    }

    /// Whether the output is still tracked by its compositor.
    pub fn is_bound(&self) -> bool {
        self.inner.compositor.borrow().strong_count() > 0
    }

    /// Whether the output is bound to a compositor that is awake.
    pub fn is_awake(&self) -> bool {
        self.compositor()
            .is_ok_and(|compositor| !compositor.is_asleep())
    }

    /// The number of live handles to this output.
    pub fn ref_count(&self) -> usize {
        Rc::strong_count(&self.inner)
    }

    /// Run `f` with this output's framebuffer, if active.
    pub fn with_framebuffer<T>(&self, f: impl FnOnce(&Framebuffer) -> T) -> Option<T> {
        self.inner.state.borrow().framebuffer.as_ref().map(f)
    }

    fn compositor(&self) -> Result<Rc<CompositorInner>, OutputError> {
        self.inner
            .compositor
            .borrow()
            .upgrade()
            .ok_or(OutputError::Unbound)
    }

    fn awake_compositor(&self) -> Result<Rc<CompositorInner>, OutputError> {
        let compositor = self.compositor()?;
        if compositor.is_asleep() {
            return Err(OutputError::DeviceBusy(BusyReason::Asleep));
        }
        Ok(compositor)
    }

    /// Drive this output at `mode` and create a framebuffer for it.
    ///
    /// With `None`, the current mode is used, then the default mode, then the first mode
    /// in the catalog.
    ///
    /// Activating an active output with the mode it already runs is rejected with
    /// [`OutputError::AlreadyActive`]. Activating it with a different mode switches modes:
    /// the old framebuffer is destroyed first, so if the new one can't be created the
    /// output ends up inactive.
    pub fn activate(&self, mode: Option<&Mode>) -> Result<(), OutputError> {
        let _span = tracy_client::span!("Output::activate");

        let compositor = self.awake_compositor()?;
        let mut state = self.inner.state.borrow_mut();

        let mode = match mode {
            Some(mode) => {
                if !state.modes.iter().any(|own| own.same(mode)) {
                    return Err(OutputError::InvalidArgument(format!(
                        "mode {} does not belong to output {}",
                        mode.name(),
                        self.name()
                    )));
                }
                mode.clone()
            }
            None => state
                .current
                .clone()
                .or_else(|| state.default.clone())
                .or_else(|| state.modes.first().cloned())
                .ok_or_else(|| {
                    OutputError::InvalidArgument(format!("output {} has no modes", self.name()))
                })?,
        };

        if state.framebuffer.is_some() {
            if state.current.as_ref().is_some_and(|current| current.same(&mode)) {
                return Err(OutputError::AlreadyActive);
            }
            info!(output = self.name(), mode = mode.name(), "Switching mode");
            state.framebuffer = None;
        }

        let buffers = compositor
            .device
            .borrow_mut()
            .allocate_scanout(self.id(), mode.info())
            .map_err(|err| {
                warn!(output = self.name(), "Failed to allocate scanout buffers: {err}");
                OutputError::from(err)
            })?;

        let framebuffer = Framebuffer::new(
            &compositor.context,
            compositor.device.clone(),
            self.id(),
            mode.info(),
            buffers,
        )
        .inspect_err(|err| warn!(output = self.name(), "Failed to create framebuffer: {err}"))?;

        info!(
            output = self.name(),
            mode = mode.name(),
            "Activated output"
        );
        state.framebuffer = Some(framebuffer);
        state.current = Some(mode);

        Ok(())
    }

    /// Destroy this output's framebuffer. Does nothing if the output is inactive.
    pub fn deactivate(&self) -> Result<(), OutputError> {
        let compositor = self.awake_compositor()?;
        self.deactivate_with(&compositor.device);
        Ok(())
    }

    pub(crate) fn deactivate_with(&self, device: &DeviceHandle) {
        let Some(framebuffer) = self.inner.state.borrow_mut().framebuffer.take() else {
            return;
        };

        if let Err(err) = device.borrow_mut().disable(self.id()) {
            warn!(output = self.name(), "Failed to disable connector: {err}");
        }
        drop(framebuffer);

        info!(output = self.name(), "Deactivated output");
    }

    pub(crate) fn unbind(&self) {
        *self.inner.compositor.borrow_mut() = Weak::new();
    }

    /// Direct all drawing on the compositor's context to this output.
    ///
    /// This makes the context current; set the viewport before drawing.
    pub fn make_current(&self) -> Result<(), OutputError> {
        self.compositor()?;
        let state = self.inner.state.borrow();
        let framebuffer = state.framebuffer.as_ref().ok_or(OutputError::NotActive)?;
        framebuffer.make_current()
    }

    /// Present what was drawn since the last swap.
    pub fn swap(&self) -> Result<(), OutputError> {
        self.awake_compositor()?;
        let mut state = self.inner.state.borrow_mut();
        let framebuffer = state.framebuffer.as_mut().ok_or(OutputError::NotActive)?;
        framebuffer.swap()
    }
}
