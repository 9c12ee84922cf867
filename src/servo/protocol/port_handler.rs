use std::collections::VecDeque;
use std::io;

use crate::servo::protocol::stservo_def::DEFAULT_BAUDRATE;
use crate::servo::sim::FeetechBusSim;

/// Byte channel to the servo bus. Reads never block longer than the
/// implementation's own short poll timeout; an empty vector means nothing
/// has arrived yet.
pub trait PortHandler {
    fn clear_port(&mut self) -> io::Result<()>;
    fn read_port(&mut self, length: usize) -> io::Result<Vec<u8>>;
    fn write_port(&mut self, packet: &[u8]) -> io::Result<usize>;
    fn get_bytes_available(&self) -> usize;
    fn get_baud_rate(&self) -> u32;
}

impl<P: PortHandler + ?Sized> PortHandler for Box<P> {
    fn clear_port(&mut self) -> io::Result<()> {
        (**self).clear_port()
    }

    fn read_port(&mut self, length: usize) -> io::Result<Vec<u8>> {
        (**self).read_port(length)
    }

    fn write_port(&mut self, packet: &[u8]) -> io::Result<usize> {
        (**self).write_port(packet)
    }

    fn get_bytes_available(&self) -> usize {
        (**self).get_bytes_available()
    }

    fn get_baud_rate(&self) -> u32 {
        (**self).get_baud_rate()
    }
}

/// Disturbance applied to the next reply coming back from the simulated bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineFault {
    /// The reply never arrives.
    Drop,
    /// One bit of the reply's last byte is flipped.
    Corrupt,
    /// Only the first `n` bytes of the reply arrive.
    Truncate(usize),
    /// Extra bytes arrive ahead of the reply.
    Noise(Vec<u8>),
}

/// In-memory port wired straight into a [`FeetechBusSim`]. Every frame
/// written advances the simulation by `frame_dt` seconds.
#[derive(Debug)]
pub struct SimPort {
    sim: FeetechBusSim,
    rx_buffer: VecDeque<u8>,
    faults: VecDeque<LineFault>,
    written: Vec<Vec<u8>>,
    frame_dt: f32,
    baudrate: u32,
    cut_at: Option<usize>,
    echo: bool,
}

impl SimPort {
    pub fn new(sim: FeetechBusSim) -> Self {
        Self {
            sim,
            rx_buffer: VecDeque::new(),
            faults: VecDeque::new(),
            written: Vec::new(),
            frame_dt: 0.01,
            baudrate: DEFAULT_BAUDRATE,
            cut_at: None,
            echo: false,
        }
    }

    /// Loops every written frame back into the receive buffer ahead of the
    /// reply, like a half-duplex adapter without echo suppression.
    pub fn with_echo(mut self) -> Self {
        self.echo = true;
        self
    }

    pub fn with_frame_dt(mut self, frame_dt: f32) -> Self {
        self.frame_dt = frame_dt.max(0.0);
        self
    }

    pub fn sim(&self) -> &FeetechBusSim {
        &self.sim
    }

    pub fn sim_mut(&mut self) -> &mut FeetechBusSim {
        &mut self.sim
    }

    pub fn inject(&mut self, fault: LineFault) {
        self.faults.push_back(fault);
    }

    /// Lets `frames` more frames through, then the line goes dead in both
    /// directions: writes still succeed but never reach the bus.
    pub fn cut_line_after(&mut self, frames: usize) {
        self.cut_at = Some(self.written.len() + frames);
    }

    pub fn restore_line(&mut self) {
        self.cut_at = None;
    }

    /// Every frame written so far, oldest first.
    pub fn written(&self) -> &[Vec<u8>] {
        &self.written
    }

    fn deliver(&mut self, mut response: Vec<u8>) {
        match self.faults.pop_front() {
            None => {}
            Some(LineFault::Drop) => return,
            Some(LineFault::Corrupt) => {
                if let Some(last) = response.last_mut() {
                    *last ^= 0x01;
                }
            }
            Some(LineFault::Truncate(n)) => response.truncate(n),
            Some(LineFault::Noise(noise)) => self.rx_buffer.extend(noise),
        }
        self.rx_buffer.extend(response);
    }
}

impl PortHandler for SimPort {
    fn clear_port(&mut self) -> io::Result<()> {
        self.rx_buffer.clear();
        Ok(())
    }

    fn read_port(&mut self, length: usize) -> io::Result<Vec<u8>> {
        let take = length.min(self.rx_buffer.len());
        Ok(self.rx_buffer.drain(..take).collect())
    }

    fn write_port(&mut self, packet: &[u8]) -> io::Result<usize> {
        self.written.push(packet.to_vec());
        if self.echo {
            self.rx_buffer.extend(packet);
        }
        self.sim.step(self.frame_dt);
        if self.cut_at.is_some_and(|cut| self.written.len() > cut) {
            return Ok(packet.len());
        }
        if let Ok(Some(response)) = self.sim.handle_frame(packet) {
            self.deliver(response);
        }
        Ok(packet.len())
    }

    fn get_bytes_available(&self) -> usize {
        self.rx_buffer.len()
    }

    fn get_baud_rate(&self) -> u32 {
        self.baudrate
    }
}

impl Default for SimPort {
    fn default() -> Self {
        Self::new(FeetechBusSim::new())
    }
}
