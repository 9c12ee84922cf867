use std::sync::{Arc, Mutex};

use crate::config::DriverConfig;
use crate::error::{FailureKind, ServoError};
use crate::servo::protocol::packet;
use crate::servo::protocol::port_handler::{LineFault, SimPort};
use crate::servo::protocol::session::{ManualClock, TransportSession};
use crate::servo::protocol::stservo_def::*;
use crate::servo::sim::FeetechBusSim;
use crate::servo::sts::{Direction, Sts};

fn sts_on(sim: FeetechBusSim) -> Sts<SimPort, ManualClock> {
    let config = DriverConfig::default();
    let session = TransportSession::with_clock(SimPort::new(sim), ManualClock::new(), config.session());
    Sts::with_session(session, config.load_sign_bit)
}

fn single_servo(id: u8) -> Sts<SimPort, ManualClock> {
    let mut sim = FeetechBusSim::new();
    sim.add_servo(id);
    sts_on(sim)
}

#[test]
fn ping_tells_present_from_absent() {
    let mut sts = single_servo(1);
    assert!(sts.ping(1));
    assert!(!sts.ping(2));
    // the absent servo cost a full retry cycle
    assert_eq!(sts.session().port().written().len(), 1 + DEFAULT_RETRIES as usize);
}

#[test]
fn write_position_then_read_back() {
    let mut sts = single_servo(1);
    sts.session_mut().port_mut().sim_mut().set_position(1, 500);

    sts.write_position(1, 600, 0).expect("write goal");
    // five more frames at 10 ms each is plenty at full speed
    for _ in 0..5 {
        sts.read_moving(1).expect("poll");
    }
    assert_eq!(sts.read_position(1).expect("position"), 600);
    assert!(!sts.read_moving(1).expect("moving flag"));
}

#[test]
fn write_position_sends_goal_time_and_speed() {
    let mut sts = single_servo(1);
    sts.write_position(1, 2048, 1000).expect("write");

    let written = sts.session().port().written();
    let frame = packet::decode(&written[0]).expect("decode request");
    assert_eq!(frame.id, 1);
    assert_eq!(frame.code, INST_WRITE);
    assert_eq!(frame.params, vec![STS_GOAL_POSITION_L, 0x00, 0x08, 0x00, 0x00, 0xE8, 0x03]);
}

#[test]
fn out_of_range_position_writes_nothing() {
    let mut sts = single_servo(1);
    let err = sts.write_position(1, 4096, 100).expect_err("position 4096");
    assert!(matches!(err, ServoError::Value(ref v) if v.field == "position" && v.max == 4095));
    assert!(sts.session().port().written().is_empty());

    let broadcast = sts.write_position(MAX_ID + 1, 100, 100);
    assert!(broadcast.is_ok(), "254 is broadcast and needs no reply");
    let err = sts.read_position(BROADCAST_ID).expect_err("cannot read broadcast");
    assert!(matches!(err, ServoError::Value(_)));
}

#[test]
fn obstructed_servo_reports_signed_load() {
    let mut sim = FeetechBusSim::new();
    sim.add_servo(1);
    sim.set_position(1, 2000);
    sim.set_obstruction(1, Some(1900));
    let mut sts = sts_on(sim);

    sts.write_position(1, 1000, 2000).expect("drive into the stop");
    for _ in 0..10 {
        sts.read_position(1).expect("poll");
    }
    let telemetry = sts.read_telemetry(1).expect("telemetry");
    assert_eq!(telemetry.position, 1900);
    assert_eq!(telemetry.load.direction, Direction::Negative);
    assert_eq!(telemetry.load.magnitude, 1000);
    assert_eq!(telemetry.load.signed(), -1000);
}

#[test]
fn present_speed_carries_direction() {
    let mut sts = single_servo(1);
    sts.session_mut().port_mut().sim_mut().set_position(1, 3000);
    sts.write_position(1, 100, 800).expect("write");
    assert_eq!(sts.read_speed(1).expect("speed"), -800);
}

#[test]
fn corrupted_reply_is_retried_transparently() {
    let mut sts = single_servo(1);
    let attempts = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&attempts);
    sts.session_mut()
        .set_observer(move |record| sink.lock().unwrap().push(record.failure.clone()));

    sts.session_mut().port_mut().inject(LineFault::Corrupt);
    sts.read_position(1).expect("second attempt succeeds");

    let attempts = attempts.lock().unwrap();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].as_ref().map(|f| f.kind()), Some(FailureKind::Checksum));
    assert!(attempts[1].is_none());
}

#[test]
fn dropped_replies_exhaust_retries() {
    let mut sts = single_servo(1);
    for _ in 0..DEFAULT_RETRIES {
        sts.session_mut().port_mut().inject(LineFault::Drop);
    }
    match sts.read_load(1).expect_err("every reply dropped") {
        ServoError::Communication(err) => {
            assert_eq!(err.id, 1);
            assert_eq!(err.attempts, DEFAULT_RETRIES);
            assert_eq!(err.kind(), FailureKind::Timeout);
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn truncated_reply_counts_as_framing_then_recovers() {
    let mut sts = single_servo(1);
    sts.session_mut().port_mut().inject(LineFault::Truncate(4));
    sts.read_position(1).expect("retry gets a full reply");
    assert_eq!(sts.session().port().written().len(), 2);
}

#[test]
fn noise_before_reply_is_skipped() {
    let mut sts = single_servo(1);
    sts.session_mut()
        .port_mut()
        .inject(LineFault::Noise(vec![0x00, 0xFF, 0x13, 0xFF]));
    assert_eq!(sts.read_position(1).expect("position"), 2048);
    assert_eq!(sts.session().port().written().len(), 1);
}

#[test]
fn echoed_request_is_not_taken_for_the_reply() {
    let mut sim = FeetechBusSim::new();
    sim.add_servo(1);
    sim.set_position(1, 1234);
    let config = DriverConfig::default();
    let port = SimPort::new(sim).with_echo();
    let session = TransportSession::with_clock(port, ManualClock::new(), config.session());
    let mut sts = Sts::with_session(session, config.load_sign_bit);

    // READ of 2 bytes echoes back with 2 params, the same shape as the reply
    assert_eq!(sts.read_position(1).expect("position"), 1234);
    assert!(sts.ping(1));
    assert_eq!(sts.session().port().written().len(), 2);
}

#[test]
fn hold_uses_its_own_attempt_budget() {
    let mut sts = single_servo(1);
    sts.set_stop_attempts(5);
    sts.session_mut().port_mut().cut_line_after(0);

    let err = sts.hold(1, 1500).expect_err("line is dead");
    match err {
        ServoError::Communication(err) => assert_eq!(err.attempts, 5),
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(sts.session().port().written().len(), 5);

    sts.session_mut().port_mut().restore_line();
    sts.hold(1, 1500).expect("line is back");
    let target = sts.session().port().sim().servo_snapshots()[0].target_position;
    assert_eq!(target, 1500);
}

#[test]
fn torque_switch_reaches_every_servo_on_broadcast() {
    let mut sim = FeetechBusSim::new();
    sim.add_servo(1);
    sim.add_servo(2);
    let mut sts = sts_on(sim);

    sts.set_torque(BROADCAST_ID, false).expect("broadcast");
    let snapshots = sts.session().port().sim().servo_snapshots();
    assert!(snapshots.iter().all(|s| !s.torque_enabled));

    sts.set_torque(2, true).expect("unicast");
    let snapshots = sts.session().port().sim().servo_snapshots();
    assert!(!snapshots[0].torque_enabled);
    assert!(snapshots[1].torque_enabled);
}

#[test]
fn configured_sign_bit_is_used_for_load() {
    let mut sim = FeetechBusSim::new().with_load_sign_bit(15);
    sim.add_servo(1);
    sim.set_position(1, 2000);
    sim.set_obstruction(1, Some(1990));
    let session = TransportSession::with_clock(
        SimPort::new(sim),
        ManualClock::new(),
        DriverConfig::default().session(),
    );
    let mut sts = Sts::with_session(session, 15);
    assert_eq!(sts.load_sign_bit(), 15);

    sts.write_position(1, 1000, 1000).expect("write");
    let load = sts.read_load(1).expect("load");
    assert_eq!(load.direction, Direction::Negative);
    assert_eq!(load.magnitude, 1000);
}

#[cfg(unix)]
mod virtual_uart {
    use std::fs::OpenOptions;
    use std::io::{Read, Write};
    use std::os::unix::fs::OpenOptionsExt;
    use std::os::unix::io::AsRawFd;
    use std::time::{Duration, Instant};

    use crate::config::DriverConfig;
    use crate::servo::protocol::port_handler::PortHandler;
    use crate::servo::protocol::virtual_uart::VirtualUartPort;
    use crate::servo::sim::virtual_bus::{VirtualBus, VirtualBusConfig};
    use crate::servo::sts::Sts;

    fn read_until_len<P: PortHandler>(port: &mut P, len: usize) -> Vec<u8> {
        let start = Instant::now();
        let mut out = Vec::new();
        while out.len() < len && start.elapsed() < Duration::from_secs(1) {
            let chunk = port.read_port(len - out.len()).expect("read master");
            if chunk.is_empty() {
                std::thread::sleep(Duration::from_millis(5));
                continue;
            }
            out.extend(chunk);
        }
        out
    }

    fn set_raw(fd: i32) {
        unsafe {
            let mut term: libc::termios = std::mem::zeroed();
            if libc::tcgetattr(fd, &mut term) != 0 {
                return;
            }
            libc::cfmakeraw(&mut term);
            let _ = libc::tcsetattr(fd, libc::TCSANOW, &term);
        }
    }

    #[test]
    fn virtual_uart_transfers_bytes() {
        let mut port = VirtualUartPort::new().expect("create virtual uart");
        let slave_path = port.slave_path().to_string();

        let mut slave = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&slave_path)
            .expect("open slave");
        set_raw(slave.as_raw_fd());

        slave.write_all(b"hello").expect("write to slave");
        let read = read_until_len(&mut port, 5);
        assert_eq!(read, b"hello");

        let written = port.write_port(b"abc").expect("write master");
        assert_eq!(written, 3);

        let mut buf = [0u8; 3];
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(1) {
            match slave.read(&mut buf) {
                Ok(0) => std::thread::sleep(Duration::from_millis(5)),
                Ok(n) => {
                    assert_eq!(&buf[..n], b"abc");
                    return;
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(err) => panic!("read slave: {err}"),
            }
        }

        panic!("timed out reading from slave");
    }

    #[test]
    fn driver_talks_to_virtual_bus_over_pty() {
        let bus = VirtualBus::start(VirtualBusConfig {
            first_servo_id: 1,
            last_servo_id: 2,
            ..VirtualBusConfig::default()
        })
        .expect("start virtual bus");

        let config = DriverConfig {
            port: Some(bus.slave_path().to_string()),
            ..DriverConfig::default()
        };
        let mut sts = Sts::open(&config).expect("open pty");

        assert!(sts.ping(1));
        assert!(sts.ping(2));
        assert!(!sts.ping(3));
        assert_eq!(sts.read_position(2).expect("position"), 2048);
    }
}
