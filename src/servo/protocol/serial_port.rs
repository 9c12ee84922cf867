use std::io::{self, Read, Write};
use std::time::Duration;

use serialport::{SerialPort, SerialPortInfo, SerialPortType};

use crate::servo::protocol::port_handler::PortHandler;
#[cfg(unix)]
use crate::servo::protocol::raw_tty::RawTtyPort;

const READ_POLL_TIMEOUT: Duration = Duration::from_millis(2);

pub struct SerialPortHandler {
    port: Box<dyn SerialPort>,
    baudrate: u32,
}

impl SerialPortHandler {
    pub fn open(port_name: &str, baudrate: u32) -> serialport::Result<Self> {
        let port = serialport::new(port_name, baudrate)
            .timeout(READ_POLL_TIMEOUT)
            .open()?;
        log::info!("opened {} @ {} baud", port_name, baudrate);
        Ok(Self::from_port(port, baudrate))
    }

    pub fn from_port(port: Box<dyn SerialPort>, baudrate: u32) -> Self {
        Self { port, baudrate }
    }
}

impl PortHandler for SerialPortHandler {
    fn clear_port(&mut self) -> io::Result<()> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(io::Error::from)
    }

    fn read_port(&mut self, length: usize) -> io::Result<Vec<u8>> {
        if length == 0 {
            return Ok(Vec::new());
        }

        let mut out = vec![0u8; length];
        match self.port.read(&mut out) {
            Ok(read_len) => {
                out.truncate(read_len);
                Ok(out)
            }
            Err(err)
                if err.kind() == io::ErrorKind::TimedOut
                    || err.kind() == io::ErrorKind::WouldBlock =>
            {
                Ok(Vec::new())
            }
            Err(err) => Err(err),
        }
    }

    fn write_port(&mut self, packet: &[u8]) -> io::Result<usize> {
        if packet.is_empty() {
            return Ok(0);
        }
        self.port.write_all(packet)?;
        self.port.flush()?;
        Ok(packet.len())
    }

    fn get_bytes_available(&self) -> usize {
        self.port.bytes_to_read().unwrap_or(0) as usize
    }

    fn get_baud_rate(&self) -> u32 {
        self.baudrate
    }
}

/// Whichever way a device path could be opened.
pub enum BusPort {
    Serial(SerialPortHandler),
    #[cfg(unix)]
    RawTty(RawTtyPort),
}

impl PortHandler for BusPort {
    fn clear_port(&mut self) -> io::Result<()> {
        match self {
            BusPort::Serial(p) => p.clear_port(),
            #[cfg(unix)]
            BusPort::RawTty(p) => p.clear_port(),
        }
    }

    fn read_port(&mut self, length: usize) -> io::Result<Vec<u8>> {
        match self {
            BusPort::Serial(p) => p.read_port(length),
            #[cfg(unix)]
            BusPort::RawTty(p) => p.read_port(length),
        }
    }

    fn write_port(&mut self, packet: &[u8]) -> io::Result<usize> {
        match self {
            BusPort::Serial(p) => p.write_port(packet),
            #[cfg(unix)]
            BusPort::RawTty(p) => p.write_port(packet),
        }
    }

    fn get_bytes_available(&self) -> usize {
        match self {
            BusPort::Serial(p) => p.get_bytes_available(),
            #[cfg(unix)]
            BusPort::RawTty(p) => p.get_bytes_available(),
        }
    }

    fn get_baud_rate(&self) -> u32 {
        match self {
            BusPort::Serial(p) => p.get_baud_rate(),
            #[cfg(unix)]
            BusPort::RawTty(p) => p.get_baud_rate(),
        }
    }
}

#[cfg(unix)]
fn is_unix_tty_path(path: &str) -> bool {
    path.starts_with("/dev/tty") || path.starts_with("/dev/cu") || is_pseudo_terminal(path)
}

#[cfg(unix)]
fn is_pseudo_terminal(path: &str) -> bool {
    path.starts_with("/dev/pts/")
}

/// Opens `path` as a serial port at `baudrate`. On unix, pseudo terminals go
/// through the raw libc port first; other tty devices go through serialport
/// and only fall back to the raw port when that fails.
pub fn open_bus(path: &str, baudrate: u32) -> serialport::Result<BusPort> {
    #[cfg(unix)]
    {
        if is_pseudo_terminal(path) {
            return match RawTtyPort::open(path, baudrate) {
                Ok(raw) => Ok(BusPort::RawTty(raw)),
                Err(raw_err) => SerialPortHandler::open(path, baudrate)
                    .map(BusPort::Serial)
                    .map_err(|serial_err| open_failed(path, raw_err, serial_err)),
            };
        }
        if is_unix_tty_path(path) {
            return match SerialPortHandler::open(path, baudrate) {
                Ok(serial) => Ok(BusPort::Serial(serial)),
                Err(serial_err) => RawTtyPort::open(path, baudrate)
                    .map(BusPort::RawTty)
                    .map_err(|raw_err| open_failed(path, raw_err, serial_err)),
            };
        }
    }

    SerialPortHandler::open(path, baudrate).map(BusPort::Serial)
}

#[cfg(unix)]
fn open_failed(path: &str, raw_err: std::io::Error, serial_err: serialport::Error) -> serialport::Error {
    serialport::Error::new(
        serialport::ErrorKind::NoDevice,
        format!(
            "failed to open {} as raw tty ({}) or serial ({})",
            path, raw_err, serial_err
        ),
    )
}

fn score_port(info: &SerialPortInfo) -> i32 {
    let name = info.port_name.to_ascii_lowercase();
    let mut score = match info.port_type {
        SerialPortType::UsbPort(_) => 40,
        SerialPortType::PciPort => 20,
        SerialPortType::Unknown => 10,
        SerialPortType::BluetoothPort => -30,
    };

    if name.contains("ttyusb")
        || name.contains("ttyacm")
        || name.contains("cu.usb")
        || name.starts_with("com")
    {
        score += 30;
    }
    // on-board UARTs used by Pi servo hats
    if name.contains("ttyama") || name.contains("serial0") {
        score += 20;
    }
    if name.contains("bluetooth") {
        score -= 50;
    }

    score
}

/// Picks the most likely servo adapter among the ports the OS reports,
/// preferring USB serial bridges, and checks that it can be opened.
pub fn detect_port(baudrate: u32) -> serialport::Result<String> {
    let mut ports = serialport::available_ports()?;
    if ports.is_empty() {
        return Err(serialport::Error::new(
            serialport::ErrorKind::NoDevice,
            "no serial ports detected; pass --port explicitly",
        ));
    }

    ports.sort_by(|a, b| {
        score_port(b)
            .cmp(&score_port(a))
            .then_with(|| a.port_name.cmp(&b.port_name))
    });

    let mut attempted = Vec::new();
    for info in ports {
        match serialport::new(&info.port_name, baudrate)
            .timeout(READ_POLL_TIMEOUT)
            .open()
        {
            Ok(_) => return Ok(info.port_name),
            Err(err) => attempted.push(format!("{}: {}", info.port_name, err)),
        }
    }

    Err(serialport::Error::new(
        serialport::ErrorKind::NoDevice,
        format!(
            "no usable serial port at {} baud; tried {}",
            baudrate,
            attempted.join("; ")
        ),
    ))
}
