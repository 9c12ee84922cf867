use std::ffi::CString;
use std::io;
use std::os::unix::io::RawFd;
use std::thread;
use std::time::{Duration, Instant};

use crate::servo::protocol::port_handler::PortHandler;

/// A tty opened straight through libc in raw, non-blocking mode. Used for
/// pseudo terminals, where serialport's baud handling gets in the way.
#[derive(Debug)]
pub struct RawTtyPort {
    fd: RawFd,
    baudrate: u32,
}

impl RawTtyPort {
    /// Opens `path` raw at `baudrate`. Fails when the rate has no termios
    /// constant on this platform or the tty refuses it.
    pub fn open(path: &str, baudrate: u32) -> io::Result<Self> {
        let c_path = CString::new(path.as_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid device path"))?;
        let speed = speed_constant(baudrate).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::Unsupported,
                format!("baud rate {} has no termios constant", baudrate),
            )
        })?;

        let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDWR | libc::O_NOCTTY | libc::O_NONBLOCK) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // owns the fd from here, so early returns close it
        let port = Self { fd, baudrate };

        unsafe {
            let mut term: libc::termios = std::mem::zeroed();
            if libc::tcgetattr(fd, &mut term) != 0 {
                return Err(io::Error::last_os_error());
            }
            libc::cfmakeraw(&mut term);
            term.c_cc[libc::VMIN] = 0;
            term.c_cc[libc::VTIME] = 0;
            if libc::cfsetispeed(&mut term, speed) != 0 || libc::cfsetospeed(&mut term, speed) != 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::tcsetattr(fd, libc::TCSANOW, &term) != 0 {
                return Err(io::Error::last_os_error());
            }
        }

        log::info!("opened {} as raw tty at {} baud", path, baudrate);
        Ok(port)
    }
}

fn speed_constant(baudrate: u32) -> Option<libc::speed_t> {
    let speed = match baudrate {
        9_600 => libc::B9600,
        19_200 => libc::B19200,
        38_400 => libc::B38400,
        57_600 => libc::B57600,
        115_200 => libc::B115200,
        230_400 => libc::B230400,
        #[cfg(any(target_os = "linux", target_os = "android"))]
        460_800 => libc::B460800,
        #[cfg(any(target_os = "linux", target_os = "android"))]
        500_000 => libc::B500000,
        #[cfg(any(target_os = "linux", target_os = "android"))]
        576_000 => libc::B576000,
        #[cfg(any(target_os = "linux", target_os = "android"))]
        921_600 => libc::B921600,
        #[cfg(any(target_os = "linux", target_os = "android"))]
        1_000_000 => libc::B1000000,
        _ => return None,
    };
    Some(speed)
}

impl Drop for RawTtyPort {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

impl PortHandler for RawTtyPort {
    fn clear_port(&mut self) -> io::Result<()> {
        let available = self.get_bytes_available();
        if available > 0 {
            self.read_port(available)?;
        }
        Ok(())
    }

    fn read_port(&mut self, length: usize) -> io::Result<Vec<u8>> {
        if length == 0 {
            return Ok(Vec::new());
        }
        let mut out = vec![0u8; length];
        let read_len = unsafe { libc::read(self.fd, out.as_mut_ptr() as *mut libc::c_void, length) };
        if read_len < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(Vec::new()),
                _ => Err(err),
            };
        }
        out.truncate(read_len as usize);
        Ok(out)
    }

    fn write_port(&mut self, packet: &[u8]) -> io::Result<usize> {
        let start = Instant::now();
        let mut total = 0usize;
        while total < packet.len() {
            let slice = &packet[total..];
            let written =
                unsafe { libc::write(self.fd, slice.as_ptr() as *const libc::c_void, slice.len()) };
            if written > 0 {
                total += written as usize;
                continue;
            }
            if written == 0 {
                break;
            }

            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    if start.elapsed() <= Duration::from_millis(200) =>
                {
                    thread::sleep(Duration::from_micros(200));
                }
                _ if total > 0 => break,
                _ => return Err(err),
            }
        }
        Ok(total)
    }

    fn get_bytes_available(&self) -> usize {
        let mut bytes: libc::c_int = 0;
        if unsafe { libc::ioctl(self.fd, libc::FIONREAD, &mut bytes) } == 0 {
            bytes.max(0) as usize
        } else {
            0
        }
    }

    fn get_baud_rate(&self) -> u32 {
        self.baudrate
    }
}
