use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::config::MotionConfig;
use crate::control::stall::{self, Command, Event, MotionPhase, MotionPlan, MotionState, Outcome, Sample};
use crate::error::{MotionError, ServoError};
use crate::servo::protocol::port_handler::PortHandler;
use crate::servo::protocol::session::{Clock, SystemClock};
use crate::servo::sts::{Load, Sts};

/// Published on every poll tick and on every phase change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusEvent {
    /// Time on the controller's clock.
    pub timestamp: Duration,
    pub servo: u8,
    pub position: Option<u16>,
    pub load: Option<Load>,
    pub phase: MotionPhase,
}

/// Supervises single-target moves of one servo, stopping it when the load
/// says it has run into something.
pub struct MotionController<P: PortHandler, C: Clock = SystemClock> {
    sts: Sts<P, C>,
    config: MotionConfig,
    cancel: Arc<AtomicBool>,
    subscribers: Vec<Sender<StatusEvent>>,
    last_sample: Option<Sample>,
}

impl<P: PortHandler, C: Clock> MotionController<P, C> {
    pub fn new(mut sts: Sts<P, C>, config: MotionConfig) -> Self {
        sts.set_stop_attempts(config.stop_attempts);
        Self {
            sts,
            config,
            cancel: Arc::new(AtomicBool::new(false)),
            subscribers: Vec::new(),
            last_sample: None,
        }
    }

    pub fn config(&self) -> &MotionConfig {
        &self.config
    }

    pub fn sts(&self) -> &Sts<P, C> {
        &self.sts
    }

    pub fn sts_mut(&mut self) -> &mut Sts<P, C> {
        &mut self.sts
    }

    /// Shared flag; setting it cancels the running move before its next read.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Requests cancellation. If no move is running, the next one is
    /// cancelled as soon as it starts.
    pub fn stop(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn subscribe(&mut self) -> Receiver<StatusEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.push(tx);
        rx
    }

    /// Runs one move to completion. The safe-start position comes from the
    /// controller's configuration.
    pub fn run(&mut self, target: u16) -> Result<Outcome, MotionError> {
        let plan = self.config.plan(target);
        plan.validate()?;

        self.last_sample = None;
        let result = self.supervise(&plan);
        // a stop is consumed by the move it cancelled
        self.cancel.store(false, Ordering::SeqCst);

        match &result {
            Ok(outcome) => log::info!("servo {} move to {} finished: {:?}", self.config.servo_id, target, outcome),
            Err(err) => log::error!("servo {} move to {} failed: {}", self.config.servo_id, target, err),
        }
        result
    }

    fn supervise(&mut self, plan: &MotionPlan) -> Result<Outcome, MotionError> {
        let mut state = MotionState::Idle;

        if self.cancelled() {
            state = self.apply(state, Event::Cancel { at: None }, plan)?;
        } else {
            state = self.apply(state, Event::Start, plan)?;
        }

        while state.outcome().is_none() {
            self.sts.clock().sleep(self.config.tick);

            if self.cancelled() {
                state = self.apply(state, Event::Cancel { at: self.last_position() }, plan)?;
                break;
            }

            let sample = match self.sample() {
                Ok(sample) => sample,
                Err(err) => return Err(self.link_lost(state, err, plan)),
            };

            if self.cancelled() {
                state = self.apply(state, Event::Cancel { at: Some(sample.position) }, plan)?;
                break;
            }

            let before = state.phase();
            state = self.apply(state, Event::Sample(sample), plan)?;
            if state.phase() == before {
                self.publish(state.phase());
            }

            while matches!(state.phase(), MotionPhase::Stalled | MotionPhase::Backoff) {
                state = self.apply(state, Event::Proceed, plan)?;
            }
        }

        Ok(state.outcome().unwrap_or(Outcome::Cancelled))
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn last_position(&self) -> Option<u16> {
        self.last_sample.map(|sample| sample.position)
    }

    fn sample(&mut self) -> Result<Sample, ServoError> {
        let telemetry = self.sts.read_telemetry(self.config.servo_id)?;
        let sample = Sample {
            position: telemetry.position,
            load: telemetry.load,
        };
        log::debug!(
            "servo {} position {} load {}",
            self.config.servo_id,
            sample.position,
            sample.load.signed()
        );
        self.last_sample = Some(sample);
        Ok(sample)
    }

    /// Feeds one event through the state machine and carries out whatever it
    /// asks for. Commands issued while driving the servo forward must succeed;
    /// stops on the way out and the back-off write are best effort.
    fn apply(&mut self, state: MotionState, event: Event, plan: &MotionPlan) -> Result<MotionState, MotionError> {
        let (next, commands) = stall::transition(state, event, plan);
        if next.phase() != state.phase() {
            log::info!("servo {}: {} -> {}", self.config.servo_id, state.phase(), next.phase());
            self.publish(next.phase());
        }

        let must_succeed = matches!(event, Event::Start | Event::Sample(_));
        for command in commands {
            if let Err(err) = self.execute(command) {
                if must_succeed {
                    return Err(self.link_lost(next, err, plan));
                }
                log::warn!("servo {}: {:?} not confirmed: {}", self.config.servo_id, command, err);
            }
        }
        Ok(next)
    }

    fn execute(&mut self, command: Command) -> Result<(), ServoError> {
        let id = self.config.servo_id;
        match command {
            Command::Write { position, speed } => self.sts.write_position(id, position, speed),
            Command::Stop { position } => {
                let position = match position {
                    Some(position) => position,
                    None => self.sts.read_position(id)?,
                };
                log::info!("servo {}: holding at {}", id, position);
                self.sts.hold(id, position)
            }
        }
    }

    fn link_lost(&mut self, state: MotionState, source: ServoError, plan: &MotionPlan) -> MotionError {
        let phase = state.phase();
        let (next, commands) = stall::transition(state, Event::LinkLost { at: self.last_position() }, plan);
        for command in commands {
            if let Err(err) = self.execute(command) {
                log::error!("servo {}: stop after link loss failed: {}", self.config.servo_id, err);
            }
        }
        if next.phase() != phase {
            self.publish(next.phase());
        }
        MotionError::LinkLost { phase, source }
    }

    fn publish(&mut self, phase: MotionPhase) {
        let event = StatusEvent {
            timestamp: self.sts.clock().now(),
            servo: self.config.servo_id,
            position: self.last_sample.map(|s| s.position),
            load: self.last_sample.map(|s| s.load),
            phase,
        };
        self.subscribers.retain(|tx| tx.send(event).is_ok());
    }
}

enum WorkerCommand {
    Start(u16),
    Shutdown,
}

/// Runs a [`MotionController`] on its own thread, which becomes the only
/// owner of the bus. `stop` does not queue behind pending commands.
pub struct MotionWorker {
    commands: Sender<WorkerCommand>,
    results: Receiver<Result<Outcome, MotionError>>,
    cancel: Arc<AtomicBool>,
    join: Option<thread::JoinHandle<()>>,
}

impl MotionWorker {
    pub fn spawn<P, C>(mut controller: MotionController<P, C>) -> (Self, Receiver<StatusEvent>)
    where
        P: PortHandler + Send + 'static,
        C: Clock + Send + 'static,
    {
        let status = controller.subscribe();
        let cancel = controller.cancel_flag();
        let (commands_tx, commands_rx) = mpsc::channel::<WorkerCommand>();
        let (results_tx, results_rx) = mpsc::channel();

        let join = thread::spawn(move || {
            while let Ok(WorkerCommand::Start(target)) = commands_rx.recv() {
                let result = controller.run(target);
                if results_tx.send(result).is_err() {
                    break;
                }
            }
            log::debug!("motion worker for servo {} exiting", controller.config().servo_id);
        });

        let worker = Self {
            commands: commands_tx,
            results: results_rx,
            cancel,
            join: Some(join),
        };
        (worker, status)
    }

    /// Queues a move. A pending stop is left alone, so it still cancels the
    /// move that is running when it lands, or the next one if none is.
    pub fn start(&self, target: u16) -> Result<(), MotionError> {
        self.commands
            .send(WorkerCommand::Start(target))
            .map_err(|_| MotionError::WorkerGone)
    }

    pub fn stop(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Blocks until the oldest started move finishes.
    pub fn wait(&self) -> Result<Outcome, MotionError> {
        self.results.recv().map_err(|_| MotionError::WorkerGone)?
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<Outcome, MotionError>> {
        match self.results.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(mpsc::RecvTimeoutError::Timeout) => None,
            Err(mpsc::RecvTimeoutError::Disconnected) => Some(Err(MotionError::WorkerGone)),
        }
    }

    pub fn shutdown(&mut self) {
        self.stop();
        let _ = self.commands.send(WorkerCommand::Shutdown);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for MotionWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
