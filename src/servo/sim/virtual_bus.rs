use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::servo::protocol::packet;
use crate::servo::protocol::port_handler::PortHandler;
use crate::servo::protocol::virtual_uart::VirtualUartPort;
use crate::servo::sim::FeetechBusSim;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VirtualBusConfig {
    pub first_servo_id: u8,
    pub last_servo_id: u8,
    /// Hard stop applied to every simulated servo.
    pub obstruction: Option<u16>,
    pub load_sign_bit: u8,
    pub step_seconds: f32,
    pub idle_sleep_ms: u64,
}

impl Default for VirtualBusConfig {
    fn default() -> Self {
        Self {
            first_servo_id: 1,
            last_servo_id: 1,
            obstruction: None,
            load_sign_bit: crate::servo::protocol::stservo_def::DEFAULT_LOAD_SIGN_BIT,
            step_seconds: 0.005,
            idle_sleep_ms: 2,
        }
    }
}

impl VirtualBusConfig {
    fn validate(&self) -> io::Result<()> {
        if self.first_servo_id > self.last_servo_id {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "first servo id must be less than or equal to last servo id",
            ));
        }
        if self.step_seconds <= 0.0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "step seconds must be greater than 0",
            ));
        }
        Ok(())
    }

    fn build_sim(&self) -> FeetechBusSim {
        let mut sim = FeetechBusSim::new().with_load_sign_bit(self.load_sign_bit);
        for id in self.first_servo_id..=self.last_servo_id {
            sim.add_servo(id);
            sim.set_obstruction(id, self.obstruction);
        }
        sim
    }
}

/// Simulated servos served on a pseudo terminal from a background thread.
pub struct VirtualBus {
    stop: Arc<AtomicBool>,
    join: Option<thread::JoinHandle<()>>,
    slave_path: String,
}

impl VirtualBus {
    pub fn start(config: VirtualBusConfig) -> io::Result<Self> {
        config.validate()?;

        let port = VirtualUartPort::new()?;
        let slave_path = port.slave_path().to_string();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_in_thread = Arc::clone(&stop);

        let join = thread::spawn(move || {
            serve(port, config, &stop_in_thread);
        });

        log::info!(
            "virtual bus on {} (ids {}..={})",
            slave_path,
            config.first_servo_id,
            config.last_servo_id
        );
        Ok(Self {
            stop,
            join: Some(join),
            slave_path,
        })
    }

    pub fn slave_path(&self) -> &str {
        &self.slave_path
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for VirtualBus {
    fn drop(&mut self) {
        self.stop();
    }
}

fn serve(mut port: VirtualUartPort, config: VirtualBusConfig, stop: &AtomicBool) {
    let mut sim = config.build_sim();
    let mut buffer: Vec<u8> = Vec::new();
    let mut last_step = Instant::now();

    while !stop.load(Ordering::Relaxed) {
        let incoming = match port.read_port(512) {
            Ok(bytes) => bytes,
            Err(err) => {
                log::error!("virtual bus read failed: {}", err);
                break;
            }
        };
        let has_io = !incoming.is_empty();

        let now = Instant::now();
        let dt = (now - last_step).as_secs_f32();
        if dt >= config.step_seconds {
            sim.step(dt);
            last_step = now;
        }

        if has_io {
            buffer.extend_from_slice(&incoming);
            for frame in packet::drain_frames(&mut buffer) {
                match sim.handle_frame(&frame) {
                    Ok(Some(response)) => {
                        if let Err(err) = port.write_port(&response) {
                            log::warn!("virtual bus write failed: {}", err);
                        }
                    }
                    Ok(None) => {}
                    Err(err) => log::debug!("virtual bus dropped frame: {}", err),
                }
            }
        } else {
            thread::sleep(Duration::from_millis(config.idle_sleep_ms));
        }
    }
}
