// SPDX-License-Identifier: GPL-3.0-or-later

//! Running on a tty: a libseat session hands us the GPU, udev tells us when monitors are
//! plugged in, and a timer drives rendering.

pub mod drm;

use std::{cell::RefCell, path::PathBuf, rc::Rc, time::Duration};

use anyhow::Context as _;
use smithay::{
    backend::{
        drm::DrmDeviceFd,
        session::{self, Session, libseat::LibSeatSession},
        udev::{self, UdevBackend, UdevEvent},
    },
    reexports::{
        calloop::{
            EventLoop, LoopSignal,
            timer::{TimeoutAction, Timer},
        },
        rustix::fs::OFlags,
    },
    utils::DeviceFd,
};
use tracing::{debug, info};

use crate::{config::Config, mode::Mode, output::Output, state::State};

use self::drm::DrmDisplay;

/// Used when no output is active.
const FALLBACK_REFRESH: u32 = 60;

struct UdevData {
    state: State,
    // Closes the device and gives up the seat when dropped.
    _session: LibSeatSession,
    frames_left: Option<u64>,
    signal: LoopSignal,
}

/// How long to wait between frames: one refresh cycle of the fastest active output.
fn frame_interval(modes: impl IntoIterator<Item = Mode>) -> Duration {
    let refresh = modes
        .into_iter()
        .map(|mode| mode.refresh())
        .filter(|&refresh| refresh > 0)
        .max()
        .unwrap_or(FALLBACK_REFRESH);
    Duration::from_secs(1) / refresh
}

/// Run on the seat's primary GPU, or `device` if given, until `frames` frames were
/// rendered or forever.
pub fn run_udev(config: Config, device: Option<PathBuf>, frames: Option<u64>) -> anyhow::Result<()> {
    let mut event_loop = EventLoop::<UdevData>::try_new()?;

    let (mut session, notifier) = LibSeatSession::new()?;

    let path = match device {
        Some(path) => path,
        None => udev::primary_gpu(session.seat())
            .context("unable to get primary gpu path")?
            .context("No GPU!")?,
    };
    info!("Using {} as primary gpu.", path.display());

    let fd = session
        .open(
            &path,
            OFlags::RDWR | OFlags::CLOEXEC | OFlags::NOCTTY | OFlags::NONBLOCK,
        )
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let fd = DrmDeviceFd::new(DeviceFd::from(fd));

    let display = Rc::new(RefCell::new(DrmDisplay::new(fd)));
    let mut state = State::new(display, config)?;
    state.activate_outputs();

    let udev_backend = UdevBackend::new(session.seat())?;
    let device_id = udev_backend
        .device_list()
        .find(|(_, device_path)| *device_path == path.as_path())
        .map(|(id, _)| id);

    let handle = event_loop.handle();

    handle
        .insert_source(udev_backend, move |event, _, data| match event {
            UdevEvent::Changed { device_id: changed }
                if device_id.is_none_or(|id| id == changed) =>
            {
                debug!("Connectors changed");
                data.state.refresh();
            }
            UdevEvent::Added { path, .. } => debug!("Ignoring new gpu {}", path.display()),
            UdevEvent::Removed { .. } | UdevEvent::Changed { .. } => (),
        })
        .map_err(|err| err.error)
        .context("Failed to insert udev backend into event loop")?;

    handle
        .insert_source(notifier, |event, _, data| match event {
            session::Event::PauseSession => {
                info!("pausing session");
                data.state.sleep();
            }
            session::Event::ActivateSession => {
                info!("resuming session");
                data.state.wake_up();
            }
        })
        .map_err(|err| err.error)
        .context("Failed to insert session notifier into event loop")?;

    handle
        .insert_source(Timer::immediate(), |_, _, data| {
            data.state.render_frame();

            if let Some(frames_left) = data.frames_left.as_mut() {
                *frames_left = frames_left.saturating_sub(1);
                if *frames_left == 0 {
                    info!(frames = data.state.frame(), "Rendered all frames, exiting");
                    data.signal.stop();
                    return TimeoutAction::Drop;
                }
            }

            let active = data
                .state
                .compositor
                .outputs()
                .filter(Output::is_active)
                .filter_map(|output| output.current_mode());
            TimeoutAction::ToDuration(frame_interval(active))
        })
        .map_err(|err| err.error)
        .context("Failed to insert frame timer into event loop")?;

    let mut data = UdevData {
        state,
        _session: session,
        frames_left: frames,
        signal: event_loop.get_signal(),
    };

    event_loop.run(None, &mut data, |_| {})?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::ModeInfo;

    fn mode(refresh: u32) -> Mode {
        crate::mode::build_catalog(&[ModeInfo::new("1920x1080", 1920, 1080, refresh)])
            .remove(0)
    }

    #[test]
    fn frame_interval_follows_the_fastest_output() {
        assert_eq!(
            frame_interval([mode(60), mode(120)]),
            Duration::from_secs(1) / 120
        );
    }

    #[test]
    fn frame_interval_without_outputs_is_60hz() {
        assert_eq!(frame_interval(Vec::new()), Duration::from_secs(1) / 60);
        assert_eq!(frame_interval([mode(0)]), Duration::from_secs(1) / 60);
    }
}
