use std::time::Duration;

use crate::control::stall::MotionPlan;
use crate::error::ValueError;
use crate::servo::protocol::session::SessionConfig;
use crate::servo::protocol::stservo_def::*;

/// Everything needed to open the bus. Nothing in the driver hard-codes these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    /// Serial device; `None` picks the most likely adapter.
    pub port: Option<String>,
    pub baudrate: u32,
    pub timeout: Duration,
    pub retries: u32,
    pub inter_byte_delay: Duration,
    pub load_sign_bit: u8,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            port: None,
            baudrate: DEFAULT_BAUDRATE,
            timeout: DEFAULT_TIMEOUT,
            retries: DEFAULT_RETRIES,
            inter_byte_delay: DEFAULT_INTER_BYTE_DELAY,
            load_sign_bit: DEFAULT_LOAD_SIGN_BIT,
        }
    }
}

impl DriverConfig {
    pub fn validate(&self) -> Result<(), ValueError> {
        ValueError::check("retries", self.retries as i64, 1, u32::MAX as i64)?;
        ValueError::check("load sign bit", self.load_sign_bit as i64, 0, 15)?;
        ValueError::check("baud rate", self.baudrate as i64, 1, u32::MAX as i64)?;
        Ok(())
    }

    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            timeout: self.timeout,
            retries: self.retries.max(1),
            inter_byte_delay: self.inter_byte_delay,
            ..SessionConfig::default()
        }
    }
}

/// Tuning for the stall-aware move. The stall window and back-off distance
/// depend on the mechanism and are meant to be set per installation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MotionConfig {
    pub servo_id: u8,
    pub safe_start: u16,
    pub speed: u16,
    pub tolerance: u16,
    pub stall_threshold: u16,
    pub stall_confirm_ticks: u32,
    pub safe_start_max_ticks: u32,
    /// Ticks allowed in the moving phase; 0 waits indefinitely.
    pub max_moving_ticks: u32,
    pub backoff_steps: u16,
    pub tick: Duration,
    pub stop_attempts: u32,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            servo_id: DEFAULT_ID,
            safe_start: 1024,
            speed: 1000,
            tolerance: 20,
            stall_threshold: 500,
            stall_confirm_ticks: 3,
            safe_start_max_ticks: 40,
            max_moving_ticks: 200,
            backoff_steps: 64,
            tick: Duration::from_millis(50),
            stop_attempts: 5,
        }
    }
}

impl MotionConfig {
    pub fn plan(&self, target: u16) -> MotionPlan {
        MotionPlan {
            target,
            safe_start: self.safe_start,
            speed: self.speed,
            tolerance: self.tolerance,
            stall_threshold: self.stall_threshold,
            stall_confirm_ticks: self.stall_confirm_ticks,
            safe_start_max_ticks: self.safe_start_max_ticks,
            max_moving_ticks: self.max_moving_ticks,
            backoff_steps: self.backoff_steps,
        }
    }
}
