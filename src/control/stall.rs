use std::fmt;

use crate::error::ValueError;
use crate::servo::protocol::stservo_def::{POSITION_MAX, SPEED_MAX};
use crate::servo::sts::{Direction, Load};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MotionPhase {
    Idle,
    SeekingSafeStart,
    Moving,
    Stalled,
    Backoff,
    Done,
}

impl fmt::Display for MotionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            MotionPhase::Idle => "idle",
            MotionPhase::SeekingSafeStart => "seeking safe start",
            MotionPhase::Moving => "moving",
            MotionPhase::Stalled => "stalled",
            MotionPhase::Backoff => "backing off",
            MotionPhase::Done => "done",
        };
        f.write_str(label)
    }
}

/// How a move ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Reached { position: u16 },
    /// Stopped against an obstruction at `position`; the back-off was issued.
    Stalled { position: u16, load: Load },
    /// Never got within tolerance of the target in the allowed ticks.
    TimedOut { position: u16 },
    Cancelled,
    /// Telemetry was lost; the error itself travels separately.
    Faulted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionState {
    Idle,
    SeekingSafeStart { ticks: u32 },
    Moving { ticks: u32, over_threshold: u32 },
    Stalled { position: u16, load: Load },
    Backoff { position: u16, load: Load },
    Done(Outcome),
}

impl MotionState {
    pub fn phase(&self) -> MotionPhase {
        match self {
            MotionState::Idle => MotionPhase::Idle,
            MotionState::SeekingSafeStart { .. } => MotionPhase::SeekingSafeStart,
            MotionState::Moving { .. } => MotionPhase::Moving,
            MotionState::Stalled { .. } => MotionPhase::Stalled,
            MotionState::Backoff { .. } => MotionPhase::Backoff,
            MotionState::Done(_) => MotionPhase::Done,
        }
    }

    pub fn outcome(&self) -> Option<Outcome> {
        match self {
            MotionState::Done(outcome) => Some(*outcome),
            _ => None,
        }
    }

    /// States where the servo may be under way and needs stopping on abort.
    fn is_active(&self) -> bool {
        !matches!(self, MotionState::Idle | MotionState::Done(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub position: u16,
    pub load: Load,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Start,
    Sample(Sample),
    /// Advances the states that follow on without waiting for telemetry.
    Proceed,
    Cancel { at: Option<u16> },
    LinkLost { at: Option<u16> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Write { position: u16, speed: u16 },
    /// Hold at `position`, or wherever the servo is if unknown.
    Stop { position: Option<u16> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MotionPlan {
    pub target: u16,
    pub safe_start: u16,
    pub speed: u16,
    pub tolerance: u16,
    pub stall_threshold: u16,
    pub stall_confirm_ticks: u32,
    pub safe_start_max_ticks: u32,
    pub max_moving_ticks: u32,
    pub backoff_steps: u16,
}

impl MotionPlan {
    pub fn validate(&self) -> Result<(), ValueError> {
        ValueError::check("target", self.target as i64, 0, POSITION_MAX as i64)?;
        ValueError::check("safe start", self.safe_start as i64, 0, POSITION_MAX as i64)?;
        ValueError::check("speed", self.speed as i64, 0, SPEED_MAX as i64)?;
        ValueError::check(
            "stall confirm ticks",
            self.stall_confirm_ticks as i64,
            1,
            u32::MAX as i64,
        )?;
        Ok(())
    }

    fn backoff_from(&self, position: u16, load: Load) -> u16 {
        let backed = match load.direction {
            Direction::Positive => position.saturating_sub(self.backoff_steps),
            Direction::Negative => position.saturating_add(self.backoff_steps),
        };
        backed.min(POSITION_MAX)
    }
}

fn within(position: u16, goal: u16, tolerance: u16) -> bool {
    position.abs_diff(goal) <= tolerance
}

/// Advances the move by one event. Pure: all I/O is expressed as the
/// returned commands, to be executed in order.
pub fn transition(state: MotionState, event: Event, plan: &MotionPlan) -> (MotionState, Vec<Command>) {
    use MotionState::*;

    match (state, event) {
        (Idle, Event::Start) => (
            SeekingSafeStart { ticks: 0 },
            vec![Command::Write {
                position: plan.safe_start,
                speed: plan.speed,
            }],
        ),

        (state, Event::Cancel { at }) if state.is_active() => {
            (Done(Outcome::Cancelled), vec![Command::Stop { position: at }])
        }
        (Idle, Event::Cancel { .. }) => (Done(Outcome::Cancelled), Vec::new()),

        (state, Event::LinkLost { at }) if state.is_active() => {
            (Done(Outcome::Faulted), vec![Command::Stop { position: at }])
        }
        (Idle, Event::LinkLost { .. }) => (Done(Outcome::Faulted), Vec::new()),

        (SeekingSafeStart { ticks }, Event::Sample(sample)) => {
            let ticks = ticks + 1;
            if within(sample.position, plan.safe_start, plan.tolerance)
                || ticks >= plan.safe_start_max_ticks
            {
                (
                    Moving {
                        ticks: 0,
                        over_threshold: 0,
                    },
                    vec![Command::Write {
                        position: plan.target,
                        speed: plan.speed,
                    }],
                )
            } else {
                (SeekingSafeStart { ticks }, Vec::new())
            }
        }

        (
            Moving {
                ticks,
                over_threshold,
            },
            Event::Sample(sample),
        ) => {
            if within(sample.position, plan.target, plan.tolerance) {
                return (
                    Done(Outcome::Reached {
                        position: sample.position,
                    }),
                    Vec::new(),
                );
            }

            let over_threshold = if sample.load.magnitude > plan.stall_threshold {
                over_threshold + 1
            } else {
                0
            };
            if over_threshold >= plan.stall_confirm_ticks {
                return (
                    Stalled {
                        position: sample.position,
                        load: sample.load,
                    },
                    vec![Command::Stop {
                        position: Some(sample.position),
                    }],
                );
            }

            let ticks = ticks + 1;
            if plan.max_moving_ticks > 0 && ticks >= plan.max_moving_ticks {
                return (
                    Done(Outcome::TimedOut {
                        position: sample.position,
                    }),
                    vec![Command::Stop {
                        position: Some(sample.position),
                    }],
                );
            }

            (
                Moving {
                    ticks,
                    over_threshold,
                },
                Vec::new(),
            )
        }

        (Stalled { position, load }, Event::Proceed) => (
            Backoff { position, load },
            vec![Command::Write {
                position: plan.backoff_from(position, load),
                speed: plan.speed,
            }],
        ),

        (Backoff { position, load }, Event::Proceed) => {
            (Done(Outcome::Stalled { position, load }), Vec::new())
        }

        (state, _) => (state, Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> MotionPlan {
        MotionPlan {
            target: 2048,
            safe_start: 1024,
            speed: 1000,
            tolerance: 20,
            stall_threshold: 500,
            stall_confirm_ticks: 3,
            safe_start_max_ticks: 40,
            max_moving_ticks: 200,
            backoff_steps: 64,
        }
    }

    fn sample(position: u16, magnitude: u16) -> Event {
        Event::Sample(Sample {
            position,
            load: Load {
                magnitude,
                direction: Direction::Positive,
            },
        })
    }

    /// Feeds events in order and collects every command emitted.
    fn run(events: &[Event], plan: &MotionPlan) -> (MotionState, Vec<MotionPhase>, Vec<Command>) {
        let mut state = MotionState::Idle;
        let mut phases = vec![state.phase()];
        let mut commands = Vec::new();
        for event in events {
            let (next, emitted) = transition(state, *event, plan);
            if next.phase() != state.phase() {
                phases.push(next.phase());
            }
            commands.extend(emitted);
            state = next;
        }
        (state, phases, commands)
    }

    #[test]
    fn sustained_overload_stalls_then_backs_off() {
        let plan = plan();
        let events = [
            Event::Start,
            sample(1030, 40),
            sample(1400, 120),
            sample(1700, 520),
            sample(1710, 610),
            sample(1712, 700),
            Event::Proceed,
            Event::Proceed,
        ];
        let (state, phases, commands) = run(&events, &plan);

        assert_eq!(
            phases,
            vec![
                MotionPhase::Idle,
                MotionPhase::SeekingSafeStart,
                MotionPhase::Moving,
                MotionPhase::Stalled,
                MotionPhase::Backoff,
                MotionPhase::Done,
            ]
        );
        assert_eq!(
            commands,
            vec![
                Command::Write {
                    position: 1024,
                    speed: 1000
                },
                Command::Write {
                    position: 2048,
                    speed: 1000
                },
                Command::Stop {
                    position: Some(1712)
                },
                Command::Write {
                    position: 1712 - 64,
                    speed: 1000
                },
            ]
        );
        assert!(matches!(
            state.outcome(),
            Some(Outcome::Stalled { position: 1712, .. })
        ));
    }

    #[test]
    fn reaches_target_without_stalling_when_load_stays_low() {
        let plan = plan();
        let events = [
            Event::Start,
            sample(1020, 30),
            sample(1500, 300),
            sample(1900, 480),
            sample(2040, 90),
        ];
        let (state, phases, commands) = run(&events, &plan);
        assert!(!phases.contains(&MotionPhase::Stalled));
        assert_eq!(state, MotionState::Done(Outcome::Reached { position: 2040 }));
        assert!(!commands.iter().any(|c| matches!(c, Command::Stop { .. })));
    }

    #[test]
    fn single_noisy_sample_does_not_stall() {
        let plan = plan();
        let mut state = MotionState::Moving {
            ticks: 0,
            over_threshold: 0,
        };
        for (position, load) in [(1100, 900), (1200, 100), (1300, 900), (1400, 900), (1500, 100)] {
            state = transition(state, sample(position, load), &plan).0;
        }
        assert_eq!(
            state,
            MotionState::Moving {
                ticks: 5,
                over_threshold: 0
            }
        );
    }

    #[test]
    fn safe_start_gives_up_waiting_after_bounded_ticks() {
        let plan = MotionPlan {
            safe_start_max_ticks: 2,
            ..plan()
        };
        let (state, _, commands) = run(&[Event::Start, sample(3000, 0), sample(2990, 0)], &plan);
        assert_eq!(state.phase(), MotionPhase::Moving);
        assert_eq!(commands.len(), 2);
    }

    #[test]
    fn negative_load_backs_off_upward_and_clamps() {
        let plan = MotionPlan {
            backoff_steps: 100,
            ..plan()
        };
        let load = Load {
            magnitude: 800,
            direction: Direction::Negative,
        };
        let (state, commands) = transition(
            MotionState::Stalled {
                position: 4050,
                load,
            },
            Event::Proceed,
            &plan,
        );
        assert_eq!(state.phase(), MotionPhase::Backoff);
        assert_eq!(
            commands,
            vec![Command::Write {
                position: POSITION_MAX,
                speed: 1000
            }]
        );
    }

    #[test]
    fn cancel_stops_active_move_and_is_quiet_when_idle() {
        let plan = plan();
        let (state, commands) = transition(
            MotionState::SeekingSafeStart { ticks: 3 },
            Event::Cancel { at: Some(900) },
            &plan,
        );
        assert_eq!(state, MotionState::Done(Outcome::Cancelled));
        assert_eq!(commands, vec![Command::Stop { position: Some(900) }]);

        let (state, commands) = transition(MotionState::Idle, Event::Cancel { at: None }, &plan);
        assert_eq!(state, MotionState::Done(Outcome::Cancelled));
        assert!(commands.is_empty());
    }

    #[test]
    fn link_loss_while_moving_faults_with_stop() {
        let plan = plan();
        let moving = MotionState::Moving {
            ticks: 4,
            over_threshold: 1,
        };
        let (state, commands) = transition(moving, Event::LinkLost { at: Some(1500) }, &plan);
        assert_eq!(state, MotionState::Done(Outcome::Faulted));
        assert_eq!(commands, vec![Command::Stop { position: Some(1500) }]);
    }

    #[test]
    fn moving_too_long_times_out() {
        let plan = MotionPlan {
            max_moving_ticks: 3,
            ..plan()
        };
        let mut state = MotionState::Moving {
            ticks: 0,
            over_threshold: 0,
        };
        let mut last = Vec::new();
        for position in [1100, 1101, 1102] {
            let (next, commands) = transition(state, sample(position, 10), &plan);
            state = next;
            last = commands;
        }
        assert_eq!(state, MotionState::Done(Outcome::TimedOut { position: 1102 }));
        assert_eq!(last, vec![Command::Stop { position: Some(1102) }]);
    }

    #[test]
    fn done_ignores_further_events() {
        let plan = plan();
        let done = MotionState::Done(Outcome::Reached { position: 2048 });
        for event in [Event::Start, sample(10, 999), Event::Proceed, Event::Cancel { at: None }] {
            assert_eq!(transition(done, event, &plan), (done, Vec::new()));
        }
    }

    #[test]
    fn plan_rejects_out_of_range_target() {
        let plan = MotionPlan {
            target: 5000,
            ..plan()
        };
        assert_eq!(plan.validate().expect_err("target").field, "target");
    }
}
