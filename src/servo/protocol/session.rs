use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{AttemptFailure, CommunicationError};
use crate::servo::protocol::packet::{self, Frame, FrameError};
use crate::servo::protocol::port_handler::PortHandler;
use crate::servo::protocol::stservo_def::*;

pub trait Clock {
    /// Monotonic time since the clock was created.
    fn now(&self) -> Duration;
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone)]
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Clock that only moves when something sleeps on it. Clones share the same
/// time line.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    elapsed_us: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, duration: Duration) {
        self.elapsed_us
            .fetch_add(duration.as_micros() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_micros(self.elapsed_us.load(Ordering::SeqCst))
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Reply deadline for one attempt.
    pub timeout: Duration,
    /// Total attempts per request, at least one.
    pub retries: u32,
    /// Turnaround pause between writing a frame and listening for the reply.
    pub inter_byte_delay: Duration,
    /// Pause between empty reads while waiting for a reply.
    pub poll_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            retries: DEFAULT_RETRIES,
            inter_byte_delay: DEFAULT_INTER_BYTE_DELAY,
            poll_interval: Duration::from_millis(1),
        }
    }
}

/// What happened on one attempt of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    pub id: u8,
    pub instruction: u8,
    pub attempt: u32,
    pub attempts: u32,
    pub failure: Option<AttemptFailure>,
}

pub type AttemptObserver = Box<dyn FnMut(&AttemptRecord) + Send>;

/// Owns the bus and keeps exactly one request in flight at a time.
pub struct TransportSession<P: PortHandler, C: Clock = SystemClock> {
    port: P,
    clock: C,
    config: SessionConfig,
    observer: Option<AttemptObserver>,
}

impl<P: PortHandler> TransportSession<P, SystemClock> {
    pub fn new(port: P, config: SessionConfig) -> Self {
        Self::with_clock(port, SystemClock::new(), config)
    }
}

impl<P: PortHandler, C: Clock> TransportSession<P, C> {
    pub fn with_clock(port: P, clock: C, config: SessionConfig) -> Self {
        Self {
            port,
            clock,
            config,
            observer: None,
        }
    }

    pub fn set_observer(&mut self, observer: impl FnMut(&AttemptRecord) + Send + 'static) {
        self.observer = Some(Box::new(observer));
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn set_attempts(&mut self, attempts: u32) {
        self.config.retries = attempts.max(1);
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Drains whatever is still pending on the line and hands the port back.
    pub fn close(mut self) -> P {
        if let Err(err) = self.port.clear_port() {
            log::warn!("failed to drain port on close: {}", err);
        }
        self.port
    }

    pub fn request(
        &mut self,
        id: u8,
        instruction: u8,
        params: &[u8],
    ) -> Result<Frame, CommunicationError> {
        self.request_with_attempts(id, instruction, params, None, self.config.retries)
    }

    /// Like [`request`](Self::request), but a reply that does not carry
    /// exactly `reply_len` parameter bytes counts as a failed attempt.
    pub fn request_expecting(
        &mut self,
        id: u8,
        instruction: u8,
        params: &[u8],
        reply_len: usize,
    ) -> Result<Frame, CommunicationError> {
        self.request_with_attempts(id, instruction, params, Some(reply_len), self.config.retries)
    }

    pub fn request_with_attempts(
        &mut self,
        id: u8,
        instruction: u8,
        params: &[u8],
        reply_len: Option<usize>,
        attempts: u32,
    ) -> Result<Frame, CommunicationError> {
        debug_assert!(id <= MAX_ID, "broadcast frames get no reply; use send()");

        let attempts = attempts.max(1);
        let packet = packet::encode(id, instruction, params);
        let mut last = AttemptFailure::Timeout(self.config.timeout);

        for attempt in 1..=attempts {
            log::debug!(
                "[serial tx] id={} instr=0x{:02X} attempt={}/{} bytes={}",
                id,
                instruction,
                attempt,
                attempts,
                packet::format_hex(&packet)
            );

            let outcome = self.attempt(id, &packet, reply_len);
            self.report(AttemptRecord {
                id,
                instruction,
                attempt,
                attempts,
                failure: outcome.as_ref().err().cloned(),
            });

            match outcome {
                Ok(frame) => {
                    log::debug!(
                        "[serial rx] id={} status=0x{:02X} params={}",
                        frame.id,
                        frame.code,
                        packet::format_hex(&frame.params)
                    );
                    if frame.code != 0 {
                        log::warn!(
                            "servo {} reports status 0x{:02X} ({})",
                            frame.id,
                            frame.code,
                            describe_status(frame.code)
                        );
                    }
                    return Ok(frame);
                }
                Err(failure) => {
                    log::warn!(
                        "id={} instr=0x{:02X} attempt {}/{} failed: {}",
                        id,
                        instruction,
                        attempt,
                        attempts,
                        failure
                    );
                    last = failure;
                }
            }
        }

        Err(CommunicationError { id, attempts, last })
    }

    /// Writes a frame without waiting for a reply, as broadcast requires.
    pub fn send(&mut self, id: u8, instruction: u8, params: &[u8]) -> Result<(), CommunicationError> {
        let packet = packet::encode(id, instruction, params);
        log::debug!(
            "[serial tx] id={} instr=0x{:02X} no-reply bytes={}",
            id,
            instruction,
            packet::format_hex(&packet)
        );
        self.write_frame(&packet).map_err(|failure| CommunicationError {
            id,
            attempts: 1,
            last: failure,
        })
    }

    fn report(&mut self, record: AttemptRecord) {
        if let Some(observer) = self.observer.as_mut() {
            observer(&record);
        }
    }

    fn write_frame(&mut self, packet: &[u8]) -> Result<(), AttemptFailure> {
        self.port.clear_port()?;
        let written = self.port.write_port(packet)?;
        if written != packet.len() {
            return Err(AttemptFailure::Io(io::ErrorKind::WriteZero));
        }
        Ok(())
    }

    fn attempt(
        &mut self,
        id: u8,
        packet: &[u8],
        reply_len: Option<usize>,
    ) -> Result<Frame, AttemptFailure> {
        self.write_frame(packet)?;
        if !self.config.inter_byte_delay.is_zero() {
            self.clock.sleep(self.config.inter_byte_delay);
        }
        self.await_reply(id, packet, reply_len)
    }

    fn await_reply(&mut self, id: u8, request: &[u8], reply_len: Option<usize>) -> Result<Frame, AttemptFailure> {
        let deadline = self.clock.now() + self.config.timeout;
        let mut buffer: Vec<u8> = Vec::new();

        loop {
            let chunk = self.port.read_port(RXPACKET_MAX_LEN)?;
            let idle = chunk.is_empty();
            buffer.extend_from_slice(&chunk);

            while !buffer.is_empty() {
                match packet::decode_prefix(&buffer) {
                    Ok((frame, consumed)) => {
                        buffer.drain(..consumed);
                        if frame.id != id {
                            log::debug!("dropping reply from id {} while waiting for {}", frame.id, id);
                            continue;
                        }
                        // half-duplex adapters loop our own request back
                        if frame.to_bytes() == request {
                            log::debug!("skipping echo of request to id {}", id);
                            continue;
                        }
                        if let Some(expected) = reply_len {
                            if frame.params.len() != expected {
                                return Err(AttemptFailure::UnexpectedLength {
                                    expected,
                                    actual: frame.params.len(),
                                });
                            }
                        }
                        return Ok(frame);
                    }
                    Err(err @ FrameError::Checksum { .. }) => return Err(err.into()),
                    Err(FrameError::BadLength(_)) => {
                        // step past the bogus marker and rescan
                        let skip = buffer
                            .windows(2)
                            .position(|pair| pair == HEADER)
                            .map_or(buffer.len(), |pos| pos + 1);
                        buffer.drain(..skip);
                    }
                    Err(_) => break,
                }
            }

            if self.clock.now() >= deadline {
                if buffer.is_empty() {
                    return Err(AttemptFailure::Timeout(self.config.timeout));
                }
                return Err(match packet::decode(&buffer) {
                    Err(err) => AttemptFailure::Framing(err),
                    Ok(_) => AttemptFailure::Timeout(self.config.timeout),
                });
            }
            if idle {
                self.clock.sleep(self.config.poll_interval);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Answers each write with the next scripted reply; an empty reply means
    /// the servo stays silent.
    #[derive(Default)]
    struct ScriptedPort {
        replies: VecDeque<Vec<u8>>,
        pending: VecDeque<u8>,
        writes: usize,
    }

    impl ScriptedPort {
        fn new(replies: Vec<Vec<u8>>) -> Self {
            Self {
                replies: replies.into(),
                ..Self::default()
            }
        }
    }

    impl PortHandler for ScriptedPort {
        fn clear_port(&mut self) -> io::Result<()> {
            self.pending.clear();
            Ok(())
        }

        fn read_port(&mut self, length: usize) -> io::Result<Vec<u8>> {
            let take = length.min(self.pending.len());
            Ok(self.pending.drain(..take).collect())
        }

        fn write_port(&mut self, packet: &[u8]) -> io::Result<usize> {
            self.writes += 1;
            if let Some(reply) = self.replies.pop_front() {
                self.pending.extend(reply);
            }
            Ok(packet.len())
        }

        fn get_bytes_available(&self) -> usize {
            self.pending.len()
        }

        fn get_baud_rate(&self) -> u32 {
            DEFAULT_BAUDRATE
        }
    }

    fn session(replies: Vec<Vec<u8>>) -> TransportSession<ScriptedPort, ManualClock> {
        TransportSession::with_clock(
            ScriptedPort::new(replies),
            ManualClock::new(),
            SessionConfig::default(),
        )
    }

    fn ack(id: u8) -> Vec<u8> {
        packet::encode(id, 0, &[])
    }

    #[test]
    fn timeout_retries_exactly_configured_attempts() {
        let mut session = session(Vec::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        session.set_observer(move |record| sink.lock().unwrap().push(record.clone()));

        let err = session.request(1, INST_PING, &[]).expect_err("silent servo");
        assert_eq!(err.id, 1);
        assert_eq!(err.attempts, 3);
        assert_eq!(err.kind(), FailureKind::Timeout);
        assert_eq!(session.port().writes, 3);

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 3);
        assert!(log.iter().all(|r| r.failure == Some(AttemptFailure::Timeout(DEFAULT_TIMEOUT))));
        assert!(session.clock().now() >= DEFAULT_TIMEOUT * 3);
    }

    #[test]
    fn first_attempt_success_sends_once() {
        let mut session = session(vec![ack(1)]);
        let frame = session.request(1, INST_PING, &[]).expect("ping");
        assert_eq!(frame.id, 1);
        assert_eq!(session.port().writes, 1);
    }

    #[test]
    fn corrupted_reply_is_retried_with_full_frame() {
        let mut bad = packet::encode(1, 0, &[0x00, 0x08]);
        let last = bad.len() - 1;
        bad[last] ^= 0x40;
        let good = packet::encode(1, 0, &[0x00, 0x08]);
        let mut session = session(vec![bad, good]);

        let frame = session
            .request_expecting(1, INST_READ, &[STS_PRESENT_POSITION_L, 2], 2)
            .expect("second attempt succeeds");
        assert_eq!(frame.params, vec![0x00, 0x08]);
        assert_eq!(session.port().writes, 2);
    }

    #[test]
    fn persistent_corruption_reports_checksum_kind() {
        let mut bad = ack(4);
        let last = bad.len() - 1;
        bad[last] ^= 0x01;
        let mut session = session(vec![bad.clone(), bad.clone(), bad]);
        let err = session.request(4, INST_PING, &[]).expect_err("all corrupted");
        assert_eq!(err.kind(), FailureKind::Checksum);
        assert_eq!(err.attempts, 3);
    }

    #[test]
    fn partial_reply_times_out_as_framing_failure() {
        let reply = packet::encode(2, 0, &[1, 2]);
        let mut session = session(vec![reply[..4].to_vec()]);
        session.config.retries = 1;
        let err = session.request(2, INST_PING, &[]).expect_err("truncated");
        assert_eq!(err.kind(), FailureKind::Framing);
    }

    #[test]
    fn replies_for_other_ids_and_noise_are_skipped() {
        let mut reply = vec![0x00, 0x37];
        reply.extend(ack(9));
        reply.extend(ack(5));
        let mut session = session(vec![reply]);
        let frame = session.request(5, INST_PING, &[]).expect("matching reply");
        assert_eq!(frame.id, 5);
        assert_eq!(session.port().writes, 1);
    }

    #[test]
    fn unexpected_reply_length_is_a_framing_failure() {
        let mut session = session(vec![ack(1)]);
        session.config.retries = 1;
        let err = session
            .request_expecting(1, INST_READ, &[STS_PRESENT_LOAD_L, 2], 2)
            .expect_err("empty reply to a read");
        assert_eq!(
            err.last,
            AttemptFailure::UnexpectedLength {
                expected: 2,
                actual: 0
            }
        );
    }

    #[test]
    fn attempt_override_bounds_stop_retries() {
        let mut session = session(Vec::new());
        let err = session
            .request_with_attempts(1, INST_WRITE, &[STS_GOAL_POSITION_L, 0, 0], None, 5)
            .expect_err("silent");
        assert_eq!(err.attempts, 5);
        assert_eq!(session.port().writes, 5);
    }
}
