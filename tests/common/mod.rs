// SPDX-License-Identifier: GPL-3.0-or-later

#![allow(dead_code)]

use std::{cell::RefCell, rc::Rc};

use kmscomp::{
    Compositor, ModeInfo, Output,
    backend::{ConnectorId, dummy::Dummy},
};

pub const HDMI: &str = "HDMI-1";

/// 1920x1080 (preferred), then 1280x720.
pub fn hdmi_modes() -> Vec<ModeInfo> {
    vec![
        ModeInfo::new("1920x1080", 1920, 1080, 60),
        ModeInfo::new("1280x720", 1280, 720, 60),
    ]
}

/// A compositor on top of a dummy device the test can plug monitors into.
pub struct Fixture {
    pub dummy: Rc<RefCell<Dummy>>,
    pub compositor: Compositor,
}

impl Fixture {
    /// A compositor with nothing plugged in.
    pub fn new() -> Self {
        let dummy = Dummy::new().into_shared();
        let compositor = Compositor::new(dummy.clone()).unwrap();
        Self { dummy, compositor }
    }

    /// A compositor that found [`HDMI`] on startup.
    pub fn with_hdmi() -> Self {
        let fixture = Self::new();
        fixture.plug(HDMI, hdmi_modes(), Some(0));
        fixture.compositor.refresh().unwrap();
        fixture
    }

    pub fn plug(&self, name: &str, modes: Vec<ModeInfo>, preferred: Option<usize>) -> ConnectorId {
        self.dummy.borrow_mut().plug(name, modes, preferred)
    }

    pub fn unplug(&self, name: &str) {
        assert!(self.dummy.borrow_mut().unplug(name), "{name} was not plugged in");
    }

    pub fn output(&self, name: &str) -> Output {
        self.compositor
            .output(name)
            .unwrap_or_else(|| panic!("no output called {name}"))
    }

    pub fn output_names(&self) -> Vec<String> {
        self.compositor
            .outputs()
            .map(|output| output.name().to_string())
            .collect()
    }

    pub fn live_buffers(&self) -> usize {
        self.dummy.borrow().live_buffers()
    }
}
