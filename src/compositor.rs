// SPDX-License-Identifier: GPL-3.0-or-later

use std::{cell::Cell, cell::RefCell, rc::Rc};

use indexmap::IndexMap;
use tracing::{debug, error, info};

use crate::{
    backend::{ConnectorId, DeviceHandle},
    context::Context,
    error::{BusyReason, OutputError},
    output::Output,
};

pub(crate) struct CompositorInner {
    pub(crate) device: DeviceHandle,
    pub(crate) context: Context,
    /// Outputs in discovery order.
    outputs: RefCell<IndexMap<ConnectorId, Output>>,
    awake: Cell<bool>,
}

impl CompositorInner {
    pub(crate) fn is_asleep(&self) -> bool {
        !self.awake.get()
    }
}

impl Drop for CompositorInner {
    fn drop(&mut self) {
        for (_, output) in std::mem::take(self.outputs.get_mut()) {
            output.deactivate_with(&self.device);
            output.unbind();
        }
    }
}

/// Owns the rendering context and the outputs of one display device.
///
/// This is a reference-counted handle; the compositor goes away when the last clone is
/// dropped, unbinding any outputs callers still hold.
#[derive(Clone)]
pub struct Compositor {
    inner: Rc<CompositorInner>,
}

impl std::fmt::Debug for Compositor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compositor")
            .field("awake", &self.inner.awake.get())
            .field("outputs", &*self.inner.outputs.borrow())
            .finish_non_exhaustive()
    }
}

impl Compositor {
    /// Create a compositor for `device` and probe its connectors.
    pub fn new(device: DeviceHandle) -> Result<Self, OutputError> {
        let compositor = Self {
            inner: Rc::new(CompositorInner {
                device,
                context: Context::new(),
                outputs: RefCell::new(IndexMap::new()),
                awake: Cell::new(true),
            }),
        };

        compositor.reprobe()?;

        info!(
            outputs = compositor.inner.outputs.borrow().len(),
            "Created compositor"
        );

        Ok(compositor)
    }

    /// Give up the device so another process can use it.
    ///
    /// The context and all framebuffers survive, but outputs can't be activated,
    /// deactivated, added or removed until [`Compositor::wake_up`].
    pub fn sleep(&self) {
        if self.is_asleep() {
            return;
        }

        info!("Compositor going to sleep");
        self.inner.device.borrow_mut().pause();
        self.inner.context.suspend();
        self.inner.awake.set(false);
    }

    /// Take the device back and reprobe outputs.
    ///
    /// Does nothing if the compositor is awake.
    pub fn wake_up(&self) -> Result<(), OutputError> {
        if !self.is_asleep() {
            return Ok(());
        }

        if let Err(err) = self.inner.device.borrow_mut().resume() {
            error!("Failed to reacquire the device: {err}");
            return Err(OutputError::DeviceIo(err));
        }

        info!("Compositor waking up");
        self.inner.awake.set(true);
        self.inner.context.resume();

        self.reprobe()
    }

    pub fn is_asleep(&self) -> bool {
        self.inner.is_asleep()
    }

    /// Make the context current.
    pub fn make_current(&self) -> Result<(), OutputError> {
        self.inner.context.make_current()
    }

    pub fn context(&self) -> &Context {
        &self.inner.context
    }

    /// A snapshot of all outputs, in the order they were discovered.
    pub fn outputs(&self) -> impl Iterator<Item = Output> + use<> {
        self.inner
            .outputs
            .borrow()
            .values()
            .cloned()
            .collect::<Vec<_>>()
            .into_iter()
    }

    /// Find an output by its connector name.
    pub fn output(&self, name: &str) -> Option<Output> {
        self.inner
            .outputs
            .borrow()
            .values()
            .find(|output| output.name() == name)
            .cloned()
    }

    /// Reread connected outputs.
    ///
    /// Call this when monitors were hotplugged.
    pub fn refresh(&self) -> Result<(), OutputError> {
        if self.is_asleep() {
            return Err(OutputError::DeviceBusy(BusyReason::Asleep));
        }
        self.reprobe()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    fn reprobe(&self) -> Result<(), OutputError> {
        let _span = tracy_client::span!("Compositor::reprobe");

        let connectors = self
            .inner
            .device
            .borrow_mut()
            .probe()
            .inspect_err(|err| error!("Failed to probe connectors: {err}"))
            .map_err(OutputError::DeviceIo)?;

        let known = self.outputs().collect::<Vec<_>>();

        for output in known {
            match connectors.iter().find(|info| info.id == output.id()) {
                Some(info)
                    if info.name == output.name()
                        && info.same_catalog(output.connector_info()) =>
                {
                    continue;
                }
                Some(_) => info!(output = output.name(), "Mode list changed, replacing output"),
                None => info!(output = output.name(), "Output disconnected"),
            }

            self.remove_output(&output);
        }

        for info in connectors {
            if self.inner.outputs.borrow().contains_key(&info.id) {
                continue;
            }

            info!(
                output = %info.name,
                modes = info.modes.len(),
                "Output connected"
            );
            let output = Output::new(info, Rc::downgrade(&self.inner));
            self.inner.outputs.borrow_mut().insert(output.id(), output);
        }

        Ok(())
    }

    fn remove_output(&self, output: &Output) {
        output.deactivate_with(&self.inner.device);
        output.unbind();
        self.inner.outputs.borrow_mut().shift_remove(&output.id());
        debug!(output = output.name(), "Unbound output");
    }
}
