// SPDX-License-Identifier: GPL-3.0-or-later

//! What the binary does with a compositor: keep configured outputs active and draw a
//! simple animated scene on each of them every frame.

use anyhow::Context as _;
use tracing::{debug, error, info, warn};

use crate::{
    backend::DeviceHandle,
    compositor::Compositor,
    config::Config,
    context::{Mat4, TextureId, mat4_identity},
    error::OutputError,
    output::Output,
};

const CHECKER_SIZE: u32 = 8;

pub struct State {
    pub compositor: Compositor,
    pub config: Config,
    frame: u64,
    texture: Option<TextureId>,
}

/// An 8x8 BGRA checkerboard.
fn checkerboard() -> Vec<u8> {
    (0..CHECKER_SIZE * CHECKER_SIZE)
        .flat_map(|i| {
            let (x, y) = (i % CHECKER_SIZE, i / CHECKER_SIZE);
            if (x + y) % 2 == 0 {
                [0xff, 0xff, 0xff, 0xff]
            } else {
                [0x40, 0x40, 0x40, 0xff]
            }
        })
        .collect()
}

/// Scale to a quarter of the screen and slide horizontally with `frame`.
fn slide_transform(frame: u64) -> Mat4 {
    let offset = (frame % 120) as f32 / 60.0 - 1.0;
    let mut m = mat4_identity();
    m[0] = 0.25;
    m[5] = 0.25;
    m[3] = offset;
    m
}

const QUAD: [f32; 12] = [
    -1.0, -1.0, 1.0, -1.0, 1.0, 1.0, -1.0, -1.0, 1.0, 1.0, -1.0, 1.0,
];
const QUAD_TEXCOORDS: [f32; 12] = [0.0, 1.0, 1.0, 1.0, 1.0, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 0.0];

const TRIANGLE: [f32; 6] = [-0.5, -0.5, 0.5, -0.5, 0.0, 0.5];
const TRIANGLE_COLORS: [f32; 12] = [
    1.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0, 0.0, 0.0, 1.0, 1.0,
];

impl State {
    pub fn new(device: DeviceHandle, config: Config) -> anyhow::Result<Self> {
        let compositor = Compositor::new(device).context("Failed to create compositor")?;
        compositor.context().set_clear_color(config.clear_color);

        Ok(Self {
            compositor,
            config,
            frame: 0,
            texture: None,
        })
    }

    /// Activate every enabled output that isn't active yet, and deactivate disabled ones.
    pub fn activate_outputs(&mut self) {
        for output in self.compositor.outputs() {
            let output_config = self.config.output(output.name());

            if !output_config.enabled {
                if output.is_active() {
                    if let Err(err) = output.deactivate() {
                        warn!(output = output.name(), "Failed to deactivate output: {err}");
                    }
                }
                continue;
            }

            if output.is_active() {
                continue;
            }

            let mode = output_config.select_mode(&output);
            match output.activate(mode.as_ref()) {
                Ok(()) => info!(
                    output = output.name(),
                    mode = ?output.current_mode().map(|mode| mode.name().to_string()),
                    "Output ready"
                ),
                Err(err) => error!(output = output.name(), "Failed to activate output: {err}"),
            }
        }
    }

    /// Pick up hotplugged monitors.
    pub fn refresh(&mut self) {
        match self.compositor.refresh() {
            Ok(()) => self.activate_outputs(),
            Err(err) => warn!("Failed to refresh outputs: {err}"),
        }
    }

    pub fn sleep(&mut self) {
        self.compositor.sleep();
    }

    pub fn wake_up(&mut self) {
        match self.compositor.wake_up() {
            Ok(()) => self.activate_outputs(),
            Err(err) => error!("Failed to wake up compositor: {err}"),
        }
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Draw and present one frame on every active output.
    pub fn render_frame(&mut self) {
        let _span = tracy_client::span!("State::render_frame");

        self.frame += 1;

        for output in self.compositor.outputs().filter(Output::is_active) {
            let result = self.draw(&output).and_then(|()| output.swap());
            match result {
                Ok(()) => (),
                Err(err) if err.is_transient() => {
                    debug!(output = output.name(), "Skipping frame: {err}")
                }
                Err(err) => warn!(output = output.name(), "Failed to render: {err}"),
            }
        }
    }

    fn texture(&mut self) -> Result<TextureId, OutputError> {
        if let Some(texture) = self.texture {
            return Ok(texture);
        }

        let ctx = self.compositor.context();
        let texture = ctx.new_tex()?;
        ctx.set_tex(texture, CHECKER_SIZE, CHECKER_SIZE, &checkerboard())?;
        self.texture = Some(texture);
        Ok(texture)
    }

    fn draw(&mut self, output: &Output) -> Result<(), OutputError> {
        output.make_current()?;
        let (width, height) = output
            .current_mode()
            .map(|mode| mode.size())
            .ok_or(OutputError::NotActive)?;

        let texture = self.texture()?;
        let ctx = self.compositor.context();

        ctx.viewport(width, height)?;
        ctx.clear()?;
        ctx.draw_def(&TRIANGLE, &TRIANGLE_COLORS, 3)?;
        ctx.draw_tex(
            &QUAD,
            &QUAD_TEXCOORDS,
            6,
            texture,
            &slide_transform(self.frame),
        )?;
        ctx.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{backend::dummy::Dummy, mode::ModeInfo};

    #[test_log::test]
    fn renders_on_every_active_output() -> anyhow::Result<()> {
        let mut dummy = Dummy::new();
        let id = dummy.plug(
            "Virtual-1",
            vec![ModeInfo::new("64x48", 64, 48, 60)],
            Some(0),
        );
        let dummy = dummy.into_shared();

        let mut state = State::new(dummy.clone(), Config::default())?;
        state.activate_outputs();
        state.render_frame();
        state.render_frame();

        let dummy = dummy.borrow();
        assert_eq!(dummy.modesets(), 1);
        assert_eq!(dummy.flips(), 1);

        let shown = dummy.presented(id).expect("nothing presented");
        // The triangle's centroid is in the middle of the screen.
        assert_ne!(shown.pixels().get(32, 26), Some(0xff00_0000));
        Ok(())
    }

    #[test]
    fn disabled_outputs_stay_inactive() -> anyhow::Result<()> {
        let mut dummy = Dummy::new();
        dummy.plug("Virtual-1", vec![ModeInfo::new("64x48", 64, 48, 60)], Some(0));

        let config = Config::parse("[outputs.Virtual-1]\nenabled = false")?;
        let mut state = State::new(dummy.into_shared(), config)?;
        state.activate_outputs();

        assert!(state.compositor.outputs().all(|output| !output.is_active()));
        Ok(())
    }

    #[test]
    fn configured_mode_is_used() -> anyhow::Result<()> {
        let mut dummy = Dummy::new();
        dummy.plug(
            "Virtual-1",
            vec![
                ModeInfo::new("64x48", 64, 48, 60),
                ModeInfo::new("32x24", 32, 24, 60),
            ],
            Some(0),
        );

        let config = Config::parse("[outputs.Virtual-1]\nmode = \"32x24\"")?;
        let mut state = State::new(dummy.into_shared(), config)?;
        state.activate_outputs();

        let output = state.compositor.output("Virtual-1").expect("no output");
        assert_eq!(output.current_mode().map(|mode| mode.size()), Some((32, 24)));
        Ok(())
    }
}
