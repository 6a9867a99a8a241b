// SPDX-License-Identifier: GPL-3.0-or-later

mod common;

use proptest::{prelude::*, proptest};

use kmscomp::{BusyReason, ModeInfo, Output, OutputError};

use crate::common::Fixture;

const NAMES: [&str; 3] = ["HDMI-A-1", "DP-1", "eDP-1"];

fn modes(variant: u8) -> Vec<ModeInfo> {
    let mut modes = vec![
        ModeInfo::new("1920x1080", 1920, 1080, 60),
        ModeInfo::new("1280x720", 1280, 720, 60),
    ];
    if variant % 2 == 1 {
        modes.push(ModeInfo::new("800x600", 800, 600, 60));
    }
    modes
}

#[derive(Debug, Clone)]
enum Op {
    Activate { output: usize, mode: Option<usize> },
    ActivateForeign { output: usize },
    Deactivate { output: usize },
    Swap { output: usize },
    Sleep,
    WakeUp,
    Refresh,
    Plug { name: usize, variant: u8 },
    Unplug { name: usize },
    FailAllocation(bool),
    RejectFlips(bool),
}

fn arbitrary_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0usize..4, proptest::option::of(0usize..3))
            .prop_map(|(output, mode)| Op::Activate { output, mode }),
        1 => (0usize..4).prop_map(|output| Op::ActivateForeign { output }),
        2 => (0usize..4).prop_map(|output| Op::Deactivate { output }),
        3 => (0usize..4).prop_map(|output| Op::Swap { output }),
        1 => Just(Op::Sleep),
        1 => Just(Op::WakeUp),
        2 => Just(Op::Refresh),
        2 => (0usize..NAMES.len(), any::<u8>()).prop_map(|(name, variant)| Op::Plug { name, variant }),
        2 => (0usize..NAMES.len()).prop_map(|name| Op::Unplug { name }),
        1 => any::<bool>().prop_map(Op::FailAllocation),
        1 => any::<bool>().prop_map(Op::RejectFlips),
    ]
}

/// What can be observed about an output from the outside.
#[derive(Debug, PartialEq)]
struct Observed {
    name: String,
    active: bool,
    mode: Option<String>,
    bound: bool,
}

fn observe(outputs: &[Output]) -> Vec<Observed> {
    outputs
        .iter()
        .map(|output| Observed {
            name: output.name().to_string(),
            active: output.is_active(),
            mode: output.current_mode().map(|mode| mode.name().to_string()),
            bound: output.is_bound(),
        })
        .collect()
}

fn pick(outputs: &[Output], idx: usize) -> Option<&Output> {
    if outputs.is_empty() {
        None
    } else {
        outputs.get(idx % outputs.len())
    }
}

fn check_invariants(fixture: &Fixture, held: &[Output]) -> Result<(), TestCaseError> {
    let mut active = 0;
    for output in held {
        prop_assert_eq!(
            output.is_active(),
            output.with_framebuffer(|_| ()).is_some()
        );
        if let Some(current) = output.current_mode() {
            prop_assert!(output.modes().any(|mode| mode.same(&current)));
        }
        if !output.is_bound() {
            prop_assert!(!output.is_active());
        }
        if output.is_active() {
            active += 1;
        }
    }

    for output in fixture.compositor.outputs() {
        prop_assert!(output.is_bound());
    }

    // Every live scanout buffer belongs to exactly one active output.
    prop_assert_eq!(fixture.live_buffers(), active * 2);
    Ok(())
}

fn apply(fixture: &Fixture, held: &mut Vec<Output>, op: &Op) -> Result<(), TestCaseError> {
    let outputs = fixture.compositor.outputs().collect::<Vec<_>>();
    let asleep = fixture.compositor.is_asleep();
    let before = observe(&outputs);

    let result = match *op {
        Op::Activate { output, mode } => pick(&outputs, output).map(|output| {
            let mode = mode.and_then(|idx| output.modes().nth(idx));
            output.activate(mode.as_ref())
        }),
        Op::ActivateForeign { output } => {
            let target = pick(&outputs, output);
            let foreign = target.and_then(|target| {
                outputs
                    .iter()
                    .find(|other| *other != target)
                    .and_then(Output::default_mode)
            });
            match (target, foreign) {
                (Some(target), Some(foreign)) => {
                    let result = target.activate(Some(&foreign));
                    if !asleep {
                        prop_assert!(matches!(result, Err(OutputError::InvalidArgument(_))));
                    }
                    Some(result)
                }
                _ => None,
            }
        }
        Op::Deactivate { output } => pick(&outputs, output).map(Output::deactivate),
        Op::Swap { output } => pick(&outputs, output).map(Output::swap),
        Op::Sleep => {
            fixture.compositor.sleep();
            None
        }
        Op::WakeUp => Some(fixture.compositor.wake_up()),
        Op::Refresh => Some(fixture.compositor.refresh()),
        Op::Plug { name, variant } => {
            if fixture.dummy.borrow().connector_id(NAMES[name]).is_none() {
                fixture.plug(NAMES[name], modes(variant), Some(0));
            }
            None
        }
        Op::Unplug { name } => {
            fixture.dummy.borrow_mut().unplug(NAMES[name]);
            None
        }
        Op::FailAllocation(fail) => {
            fixture.dummy.borrow_mut().set_fail_allocation(fail);
            None
        }
        Op::RejectFlips(reject) => {
            fixture.dummy.borrow_mut().set_reject_flips(reject);
            None
        }
    };

    let mutating = matches!(
        op,
        Op::Activate { .. }
            | Op::ActivateForeign { .. }
            | Op::Deactivate { .. }
            | Op::Swap { .. }
            | Op::Refresh
    );
    if asleep && mutating {
        if let Some(result) = result {
            prop_assert!(matches!(
                result,
                Err(OutputError::DeviceBusy(BusyReason::Asleep))
            ));
        }
        let outputs = fixture.compositor.outputs().collect::<Vec<_>>();
        prop_assert_eq!(observe(&outputs), before);
    }

    for output in fixture.compositor.outputs() {
        if !held.contains(&output) {
            held.push(output);
        }
    }

    Ok(())
}

proptest! {
    #[test]
    fn output_state_stays_consistent(ops in proptest::collection::vec(arbitrary_op(), 1..64)) {
        let fixture = Fixture::new();
        // Keep every output ever seen alive to check removed ones too.
        let mut held = Vec::new();

        for op in &ops {
            apply(&fixture, &mut held, op)?;
            check_invariants(&fixture, &held)?;
        }
    }

    #[test]
    fn refresh_is_idempotent(ops in proptest::collection::vec(arbitrary_op(), 0..32)) {
        let fixture = Fixture::new();
        let mut held = Vec::new();
        for op in &ops {
            apply(&fixture, &mut held, op)?;
        }

        fixture.compositor.wake_up().unwrap();
        fixture.compositor.refresh().unwrap();
        let first = fixture.compositor.outputs().collect::<Vec<_>>();
        let first_observed = observe(&first);

        fixture.compositor.refresh().unwrap();
        let second = fixture.compositor.outputs().collect::<Vec<_>>();

        prop_assert_eq!(&first, &second);
        prop_assert_eq!(first_observed, observe(&second));
    }
}
