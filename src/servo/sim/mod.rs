use std::collections::HashMap;

#[cfg(unix)]
pub mod virtual_bus;

use crate::servo::protocol::packet::{self, Frame, FrameError};
use crate::servo::protocol::stservo_def::*;
use crate::servo::sts::{Direction, Load};

const REGISTER_COUNT: usize = 256;
const ERROR_RANGE: u8 = 0x10;

const REG_ID: usize = 0x05;
const REG_MIN_ANGLE: usize = 0x09;
const REG_MAX_ANGLE: usize = 0x0B;
const REG_TORQUE_SWITCH: usize = STS_TORQUE_ENABLE as usize;
const REG_ACCEL: usize = STS_ACC as usize;
const REG_TARGET_POS: usize = STS_GOAL_POSITION_L as usize;
const REG_TARGET_SPEED: usize = STS_GOAL_SPEED_L as usize;
const REG_PRESENT_POS: usize = STS_PRESENT_POSITION_L as usize;
const REG_PRESENT_SPEED: usize = STS_PRESENT_SPEED_L as usize;
const REG_PRESENT_LOAD: usize = STS_PRESENT_LOAD_L as usize;
const REG_PRESENT_VOLT: usize = 0x3E;
const REG_PRESENT_TEMP: usize = 0x3F;
const REG_MOVING: usize = STS_MOVING as usize;

// a goal speed of zero means "as fast as the servo goes"
const FULL_SPEED_STEPS_S: f32 = 3400.0;
const STALL_LOAD: f32 = 1000.0;
const FREE_RUN_BASE_LOAD: f32 = 60.0;

#[derive(Debug, Clone)]
struct FeetechServo {
    registers: [u8; REGISTER_COUNT],
    position_steps: f32,
    velocity_steps_s: f32,
    obstruction: Option<Obstruction>,
    blocked: bool,
}

/// Hard stop; the servo may not pass to the other side of `position`.
#[derive(Debug, Clone, Copy)]
struct Obstruction {
    position: f32,
    side: f32,
}

impl Obstruction {
    fn new(position: u16, current: f32) -> Self {
        let position = position as f32;
        let side = if current >= position { 1.0 } else { -1.0 };
        Self { position, side }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeetechServoSnapshot {
    pub id: u8,
    pub torque_enabled: bool,
    pub target_position: u16,
    pub present_position: u16,
    pub present_load: Load,
    pub moving: bool,
    pub blocked: bool,
}

impl FeetechServo {
    fn new(id: u8) -> Self {
        let mut servo = Self {
            registers: [0u8; REGISTER_COUNT],
            position_steps: 2048.0,
            velocity_steps_s: 0.0,
            obstruction: None,
            blocked: false,
        };
        servo.registers[REG_ID] = id;
        write_u16_le(&mut servo.registers, REG_MIN_ANGLE, 0);
        write_u16_le(&mut servo.registers, REG_MAX_ANGLE, POSITION_MAX);
        servo.registers[REG_TORQUE_SWITCH] = 1;
        write_u16_le(&mut servo.registers, REG_TARGET_POS, 2048);
        servo.registers[REG_PRESENT_VOLT] = 74;
        servo.registers[REG_PRESENT_TEMP] = 30;
        servo.publish(Load::ZERO, DEFAULT_LOAD_SIGN_BIT);
        servo
    }

    fn read(&self, address: u8, length: u8) -> Option<Vec<u8>> {
        let start = address as usize;
        let end = start + length as usize;
        self.registers.get(start..end).map(|regs| regs.to_vec())
    }

    fn write(&mut self, address: u8, data: &[u8]) -> bool {
        let start = address as usize;
        let end = start + data.len();
        match self.registers.get_mut(start..end) {
            Some(regs) => {
                regs.copy_from_slice(data);
                true
            }
            None => false,
        }
    }

    fn step(&mut self, dt: f32, sign_bit: u8) {
        if dt <= 0.0 {
            return;
        }

        if self.registers[REG_TORQUE_SWITCH] == 0 {
            self.velocity_steps_s = 0.0;
            self.blocked = false;
            self.publish(Load::ZERO, sign_bit);
            return;
        }

        let min_angle = read_u16_le(&self.registers, REG_MIN_ANGLE) as f32;
        let max_angle = read_u16_le(&self.registers, REG_MAX_ANGLE) as f32;
        let target = (read_u16_le(&self.registers, REG_TARGET_POS) as f32).clamp(min_angle, max_angle);

        let max_speed = match read_u16_le(&self.registers, REG_TARGET_SPEED) {
            0 => FULL_SPEED_STEPS_S,
            speed => speed as f32,
        };
        let delta = target - self.position_steps;
        let desired = if delta.abs() < 0.5 { 0.0 } else { delta.signum() * max_speed };

        self.velocity_steps_s = match self.registers[REG_ACCEL] {
            0 => desired,
            acc => {
                let accel = acc as f32 * 100.0;
                self.velocity_steps_s + (desired - self.velocity_steps_s).clamp(-accel * dt, accel * dt)
            }
        };

        let prev = self.position_steps;
        let mut next = prev + self.velocity_steps_s * dt;
        if (target - prev).signum() != (target - next).signum() {
            next = target;
            self.velocity_steps_s = 0.0;
        }

        self.blocked = false;
        if let Some(stop) = self.obstruction {
            let pushing_past = stop.side * (target - stop.position) < 0.0;
            if pushing_past && stop.side * (next - stop.position) <= 0.0 {
                next = stop.position;
                self.blocked = true;
            }
        }
        self.position_steps = next;

        let load = if self.blocked {
            Load {
                magnitude: STALL_LOAD as u16,
                direction: direction_of(target - self.position_steps),
            }
        } else if self.velocity_steps_s.abs() > 0.5 {
            let magnitude = (FREE_RUN_BASE_LOAD + self.velocity_steps_s.abs() * 0.1).min(STALL_LOAD);
            Load {
                magnitude: magnitude.round() as u16,
                direction: direction_of(self.velocity_steps_s),
            }
        } else {
            Load::ZERO
        };
        if self.blocked {
            self.velocity_steps_s = 0.0;
        }
        self.publish(load, sign_bit);
    }

    fn publish(&mut self, load: Load, sign_bit: u8) {
        let position = self.position_steps.round().clamp(0.0, POSITION_MAX as f32) as u16;
        write_u16_le(&mut self.registers, REG_PRESENT_POS, position);
        let speed = Load {
            magnitude: self.velocity_steps_s.abs().round().min(SPEED_MAX as f32) as u16,
            direction: direction_of(self.velocity_steps_s),
        };
        write_u16_le(&mut self.registers, REG_PRESENT_SPEED, speed.encode(SPEED_SIGN_BIT));
        write_u16_le(&mut self.registers, REG_PRESENT_LOAD, load.encode(sign_bit));
        self.registers[REG_MOVING] = (self.velocity_steps_s.abs() > 0.5) as u8;
    }
}

/// A bus of simulated STS servos answering ping, read and write frames.
#[derive(Debug)]
pub struct FeetechBusSim {
    servos: HashMap<u8, FeetechServo>,
    load_sign_bit: u8,
}

impl Default for FeetechBusSim {
    fn default() -> Self {
        Self::new()
    }
}

impl FeetechBusSim {
    pub fn new() -> Self {
        Self {
            servos: HashMap::new(),
            load_sign_bit: DEFAULT_LOAD_SIGN_BIT,
        }
    }

    pub fn with_load_sign_bit(mut self, sign_bit: u8) -> Self {
        self.load_sign_bit = sign_bit;
        self
    }

    pub fn add_servo(&mut self, id: u8) {
        self.servos.entry(id).or_insert_with(|| FeetechServo::new(id));
    }

    pub fn remove_servo(&mut self, id: u8) -> bool {
        self.servos.remove(&id).is_some()
    }

    /// Moves a servo without simulating the travel.
    pub fn set_position(&mut self, id: u8, position: u16) -> bool {
        let sign_bit = self.load_sign_bit;
        let Some(servo) = self.servos.get_mut(&id) else {
            return false;
        };
        servo.position_steps = position.min(POSITION_MAX) as f32;
        servo.velocity_steps_s = 0.0;
        if let Some(stop) = servo.obstruction {
            servo.obstruction = Some(Obstruction::new(stop.position as u16, servo.position_steps));
        }
        write_u16_le(&mut servo.registers, REG_TARGET_POS, position.min(POSITION_MAX));
        servo.publish(Load::ZERO, sign_bit);
        true
    }

    /// Places a hard stop at `position`; the servo stalls against it.
    pub fn set_obstruction(&mut self, id: u8, position: Option<u16>) -> bool {
        let Some(servo) = self.servos.get_mut(&id) else {
            return false;
        };
        servo.obstruction = position.map(|p| Obstruction::new(p, servo.position_steps));
        true
    }

    pub fn servo_snapshots(&self) -> Vec<FeetechServoSnapshot> {
        let mut ids: Vec<u8> = self.servos.keys().copied().collect();
        ids.sort_unstable();
        ids.into_iter()
            .filter_map(|id| {
                self.servos.get(&id).map(|servo| FeetechServoSnapshot {
                    id,
                    torque_enabled: servo.registers[REG_TORQUE_SWITCH] != 0,
                    target_position: read_u16_le(&servo.registers, REG_TARGET_POS),
                    present_position: read_u16_le(&servo.registers, REG_PRESENT_POS),
                    present_load: Load::decode(
                        read_u16_le(&servo.registers, REG_PRESENT_LOAD),
                        self.load_sign_bit,
                    ),
                    moving: servo.registers[REG_MOVING] != 0,
                    blocked: servo.blocked,
                })
            })
            .collect()
    }

    pub fn step(&mut self, dt: f32) {
        let sign_bit = self.load_sign_bit;
        for servo in self.servos.values_mut() {
            servo.step(dt, sign_bit);
        }
    }

    /// Applies one instruction frame and returns the encoded status reply,
    /// if the addressed servo exists and the frame asks for one.
    pub fn handle_frame(&mut self, frame: &[u8]) -> Result<Option<Vec<u8>>, FrameError> {
        let request = packet::decode(frame)?;

        if request.id == BROADCAST_ID {
            if request.code == INST_WRITE {
                for servo in self.servos.values_mut() {
                    apply_write(servo, &request.params);
                }
            }
            return Ok(None);
        }

        let Some(servo) = self.servos.get_mut(&request.id) else {
            return Ok(None);
        };

        let (status, params) = match request.code {
            INST_PING => (0, Vec::new()),
            INST_READ => match request.params.as_slice() {
                [address, length] => match servo.read(*address, *length) {
                    Some(data) => (0, data),
                    None => (ERROR_RANGE, vec![0u8; *length as usize]),
                },
                _ => return Ok(None),
            },
            INST_WRITE => {
                let ok = apply_write(servo, &request.params);
                (if ok { 0 } else { ERROR_RANGE }, Vec::new())
            }
            other => {
                log::debug!("sim servo {} ignores instruction 0x{:02X}", request.id, other);
                return Ok(None);
            }
        };

        Ok(Some(Frame::new(request.id, status, params).to_bytes()))
    }
}

fn apply_write(servo: &mut FeetechServo, params: &[u8]) -> bool {
    match params.split_first() {
        Some((address, data)) if !data.is_empty() => servo.write(*address, data),
        _ => false,
    }
}

fn direction_of(value: f32) -> Direction {
    if value < 0.0 {
        Direction::Negative
    } else {
        Direction::Positive
    }
}

fn read_u16_le(registers: &[u8; REGISTER_COUNT], address: usize) -> u16 {
    u16::from_le_bytes([registers[address], registers[address + 1]])
}

fn write_u16_le(registers: &mut [u8; REGISTER_COUNT], address: usize, value: u16) {
    registers[address..address + 2].copy_from_slice(&value.to_le_bytes());
}
