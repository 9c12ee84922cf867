use std::time::Duration;

pub const BROADCAST_ID: u8 = 0xFE;
pub const MAX_ID: u8 = 0xFD;
pub const DEFAULT_ID: u8 = 1;

pub const HEADER: [u8; 2] = [0xFF, 0xFF];

pub const INST_PING: u8 = 0x01;
pub const INST_READ: u8 = 0x02;
pub const INST_WRITE: u8 = 0x03;

pub const TXPACKET_MAX_LEN: usize = 250;
pub const RXPACKET_MAX_LEN: usize = 250;

pub const ERRBIT_VOLTAGE: u8 = 1;
pub const ERRBIT_ANGLE: u8 = 2;
pub const ERRBIT_OVERHEAT: u8 = 4;
pub const ERRBIT_OVERELE: u8 = 8;
pub const ERRBIT_OVERLOAD: u8 = 32;

pub const PKT_ID: usize = 2;
pub const PKT_LENGTH: usize = 3;
pub const PKT_INSTRUCTION: usize = 4;
pub const PKT_PARAMETER0: usize = 5;

/// Smallest complete frame: header, id, length, code, checksum.
pub const PKT_MIN_LEN: usize = 6;

pub const STS_TORQUE_ENABLE: u8 = 40;
pub const STS_ACC: u8 = 41;
pub const STS_GOAL_POSITION_L: u8 = 42;
pub const STS_GOAL_SPEED_L: u8 = 46;
pub const STS_PRESENT_POSITION_L: u8 = 56;
pub const STS_PRESENT_SPEED_L: u8 = 58;
pub const STS_PRESENT_LOAD_L: u8 = 60;
pub const STS_MOVING: u8 = 66;

pub const POSITION_MAX: u16 = 4095;
pub const SPEED_MAX: u16 = 0x7FFF;
pub const SPEED_SIGN_BIT: u8 = 15;

pub const DEFAULT_BAUDRATE: u32 = 1_000_000;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(200);
pub const DEFAULT_RETRIES: u32 = 3;
pub const DEFAULT_INTER_BYTE_DELAY: Duration = Duration::from_micros(50);
pub const DEFAULT_LOAD_SIGN_BIT: u8 = 10;

pub fn describe_status(error: u8) -> &'static str {
    if (error & ERRBIT_VOLTAGE) != 0 {
        return "input voltage error";
    }
    if (error & ERRBIT_ANGLE) != 0 {
        return "angle sensor error";
    }
    if (error & ERRBIT_OVERHEAT) != 0 {
        return "overheat";
    }
    if (error & ERRBIT_OVERELE) != 0 {
        return "over-current";
    }
    if (error & ERRBIT_OVERLOAD) != 0 {
        return "overload";
    }
    ""
}
