use crate::config::DriverConfig;
use crate::error::{ServoError, ValueError};
use crate::servo::protocol::port_handler::PortHandler;
use crate::servo::protocol::serial_port::{self, BusPort};
use crate::servo::protocol::session::{Clock, SystemClock, TransportSession};
use crate::servo::protocol::stservo_def::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Positive,
    Negative,
}

/// Present load: a magnitude plus the direction flagged by the sign bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Load {
    pub magnitude: u16,
    pub direction: Direction,
}

impl Load {
    pub const ZERO: Load = Load {
        magnitude: 0,
        direction: Direction::Positive,
    };

    pub fn decode(raw: u16, sign_bit: u8) -> Self {
        let mask = 1u16.checked_shl(sign_bit as u32).unwrap_or(0);
        if (raw & mask) != 0 {
            Load {
                magnitude: raw & !mask,
                direction: Direction::Negative,
            }
        } else {
            Load {
                magnitude: raw,
                direction: Direction::Positive,
            }
        }
    }

    pub fn encode(self, sign_bit: u8) -> u16 {
        let mask = 1u16.checked_shl(sign_bit as u32).unwrap_or(0);
        match self.direction {
            Direction::Positive => self.magnitude & !mask,
            Direction::Negative => (self.magnitude & !mask) | mask,
        }
    }

    pub fn signed(self) -> i32 {
        match self.direction {
            Direction::Positive => self.magnitude as i32,
            Direction::Negative => -(self.magnitude as i32),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Telemetry {
    pub position: u16,
    pub load: Load,
}

/// Register-level access to STS servos on one bus.
pub struct Sts<P: PortHandler, C: Clock = SystemClock> {
    session: TransportSession<P, C>,
    load_sign_bit: u8,
    stop_attempts: u32,
}

impl Sts<BusPort> {
    /// Opens the configured serial device, or the best detected one.
    pub fn open(config: &DriverConfig) -> Result<Self, ServoError> {
        config.validate()?;
        let port_name = match &config.port {
            Some(port) => port.clone(),
            None => {
                let detected = serial_port::detect_port(config.baudrate)?;
                log::info!("auto-selected serial port {}", detected);
                detected
            }
        };
        let port = serial_port::open_bus(&port_name, config.baudrate)?;
        Ok(Self::with_session(
            TransportSession::new(port, config.session()),
            config.load_sign_bit,
        ))
    }
}

impl<P: PortHandler> Sts<P> {
    pub fn new(port: P, config: &DriverConfig) -> Self {
        Self::with_session(
            TransportSession::new(port, config.session()),
            config.load_sign_bit,
        )
    }
}

impl<P: PortHandler, C: Clock> Sts<P, C> {
    pub fn with_session(session: TransportSession<P, C>, load_sign_bit: u8) -> Self {
        let stop_attempts = session.config().retries;
        Self {
            session,
            load_sign_bit,
            stop_attempts,
        }
    }

    pub fn session(&self) -> &TransportSession<P, C> {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut TransportSession<P, C> {
        &mut self.session
    }

    pub fn clock(&self) -> &C {
        self.session.clock()
    }

    pub fn load_sign_bit(&self) -> u8 {
        self.load_sign_bit
    }

    /// Attempt budget for [`hold`](Self::hold), independent of the normal
    /// request policy.
    pub fn set_stop_attempts(&mut self, attempts: u32) {
        self.stop_attempts = attempts.max(1);
    }

    pub fn close(self) -> P {
        self.session.close()
    }

    /// True when the servo answers. Silence is a normal outcome here.
    pub fn ping(&mut self, id: u8) -> bool {
        if id > MAX_ID {
            return false;
        }
        match self.session.request(id, INST_PING, &[]) {
            Ok(_) => true,
            Err(err) => {
                log::debug!("ping {}: {}", id, err);
                false
            }
        }
    }

    pub fn read_position(&mut self, id: u8) -> Result<u16, ServoError> {
        self.read_word(id, STS_PRESENT_POSITION_L)
    }

    pub fn read_speed(&mut self, id: u8) -> Result<i32, ServoError> {
        let raw = self.read_word(id, STS_PRESENT_SPEED_L)?;
        Ok(Load::decode(raw, SPEED_SIGN_BIT).signed())
    }

    pub fn read_load(&mut self, id: u8) -> Result<Load, ServoError> {
        let raw = self.read_word(id, STS_PRESENT_LOAD_L)?;
        Ok(Load::decode(raw, self.load_sign_bit))
    }

    pub fn read_telemetry(&mut self, id: u8) -> Result<Telemetry, ServoError> {
        let position = self.read_position(id)?;
        let load = self.read_load(id)?;
        Ok(Telemetry { position, load })
    }

    pub fn read_moving(&mut self, id: u8) -> Result<bool, ServoError> {
        check_unicast(id)?;
        let frame = self
            .session
            .request_expecting(id, INST_READ, &[STS_MOVING, 1], 1)?;
        Ok(frame.params[0] != 0)
    }

    pub fn write_position(&mut self, id: u8, position: u16, speed: u16) -> Result<(), ServoError> {
        self.write_position_timed(id, position, speed, 0)
    }

    /// Goal position, goal time and goal speed in one write. A zero time
    /// lets the speed field govern the move.
    pub fn write_position_timed(
        &mut self,
        id: u8,
        position: u16,
        speed: u16,
        time_ms: u16,
    ) -> Result<(), ServoError> {
        let params = goal_params(position, speed, time_ms)?;
        self.write_registers(id, &params, self.session.config().retries)
    }

    /// Stops by re-targeting `position`, retried on its own budget.
    pub fn hold(&mut self, id: u8, position: u16) -> Result<(), ServoError> {
        let params = goal_params(position, 0, 0)?;
        self.write_registers(id, &params, self.stop_attempts)
    }

    pub fn set_torque(&mut self, id: u8, enabled: bool) -> Result<(), ServoError> {
        self.write_registers(id, &[STS_TORQUE_ENABLE, enabled as u8], self.session.config().retries)
    }

    fn read_word(&mut self, id: u8, address: u8) -> Result<u16, ServoError> {
        check_unicast(id)?;
        let frame = self
            .session
            .request_expecting(id, INST_READ, &[address, 2], 2)?;
        Ok(u16::from_le_bytes([frame.params[0], frame.params[1]]))
    }

    fn write_registers(&mut self, id: u8, params: &[u8], attempts: u32) -> Result<(), ServoError> {
        if id == BROADCAST_ID {
            self.session.send(id, INST_WRITE, params)?;
            return Ok(());
        }
        check_unicast(id)?;
        self.session
            .request_with_attempts(id, INST_WRITE, params, Some(0), attempts)?;
        Ok(())
    }
}

fn check_unicast(id: u8) -> Result<(), ValueError> {
    ValueError::check("servo id", id as i64, 0, MAX_ID as i64)
}

fn goal_params(position: u16, speed: u16, time_ms: u16) -> Result<[u8; 7], ValueError> {
    ValueError::check("position", position as i64, 0, POSITION_MAX as i64)?;
    ValueError::check("speed", speed as i64, 0, SPEED_MAX as i64)?;

    let [pos_l, pos_h] = position.to_le_bytes();
    let [time_l, time_h] = time_ms.to_le_bytes();
    let [spd_l, spd_h] = speed.to_le_bytes();
    Ok([STS_GOAL_POSITION_L, pos_l, pos_h, time_l, time_h, spd_l, spd_h])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_with_sign_bit_set_is_negative_with_bit_masked() {
        let raw = (1 << 10) | 612;
        let load = Load::decode(raw, 10);
        assert_eq!(load.direction, Direction::Negative);
        assert_eq!(load.magnitude, 612);
        assert_eq!(load.signed(), -612);
    }

    #[test]
    fn load_with_sign_bit_clear_is_positive_same_magnitude() {
        let load = Load::decode(612, 10);
        assert_eq!(load.direction, Direction::Positive);
        assert_eq!(load.magnitude, 612);
        assert_eq!(load.signed(), 612);
    }

    #[test]
    fn load_sign_bit_is_configurable() {
        let load = Load::decode(0x8000 | 300, 15);
        assert_eq!(load.signed(), -300);
        // with bit 10 as the sign, 0x8000 is just part of the magnitude
        assert_eq!(Load::decode(0x8000 | 300, 10).signed(), 0x8000 | 300);
    }

    #[test]
    fn goal_params_pack_little_endian_fields() {
        let params = goal_params(2048, 1000, 0).expect("in range");
        assert_eq!(params, [STS_GOAL_POSITION_L, 0x00, 0x08, 0x00, 0x00, 0xE8, 0x03]);
    }

    #[test]
    fn goal_params_reject_out_of_range() {
        let err = goal_params(4096, 100, 0).expect_err("position too high");
        assert_eq!(err.field, "position");
        assert_eq!(err.value, 4096);
        let err = goal_params(100, 0x8000, 0).expect_err("speed too high");
        assert_eq!(err.field, "speed");
    }
}
