use std::ffi::CStr;
use std::io;
use std::os::unix::io::RawFd;

use crate::servo::protocol::port_handler::PortHandler;
use crate::servo::protocol::stservo_def::DEFAULT_BAUDRATE;

/// Master side of a pseudo terminal. Anything that opens [`slave_path`]
/// as a serial device talks to whoever drives this port.
///
/// [`slave_path`]: VirtualUartPort::slave_path
#[derive(Debug)]
pub struct VirtualUartPort {
    master_fd: RawFd,
    slave_path: String,
}

impl VirtualUartPort {
    pub fn new() -> io::Result<Self> {
        unsafe {
            let fd = libc::posix_openpt(libc::O_RDWR | libc::O_NOCTTY);
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::grantpt(fd) != 0 || libc::unlockpt(fd) != 0 {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(err);
            }

            let name_ptr = libc::ptsname(fd);
            if name_ptr.is_null() {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(err);
            }
            let slave_path = CStr::from_ptr(name_ptr).to_string_lossy().into_owned();

            let flags = libc::fcntl(fd, libc::F_GETFL);
            if flags >= 0 {
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            }

            Ok(Self {
                master_fd: fd,
                slave_path,
            })
        }
    }

    pub fn slave_path(&self) -> &str {
        &self.slave_path
    }
}

impl Drop for VirtualUartPort {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.master_fd);
        }
    }
}

impl PortHandler for VirtualUartPort {
    fn clear_port(&mut self) -> io::Result<()> {
        let pending = self.get_bytes_available();
        if pending > 0 {
            self.read_port(pending)?;
        }
        Ok(())
    }

    fn read_port(&mut self, length: usize) -> io::Result<Vec<u8>> {
        if length == 0 {
            return Ok(Vec::new());
        }
        let mut out = vec![0u8; length];
        let read_len =
            unsafe { libc::read(self.master_fd, out.as_mut_ptr() as *mut libc::c_void, length) };
        if read_len < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(Vec::new()),
                // EIO until the slave side has been opened at least once
                _ if err.raw_os_error() == Some(libc::EIO) => Ok(Vec::new()),
                _ => Err(err),
            };
        }
        out.truncate(read_len as usize);
        Ok(out)
    }

    fn write_port(&mut self, packet: &[u8]) -> io::Result<usize> {
        if packet.is_empty() {
            return Ok(0);
        }
        let written = unsafe {
            libc::write(
                self.master_fd,
                packet.as_ptr() as *const libc::c_void,
                packet.len(),
            )
        };
        if written < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(written as usize)
    }

    fn get_bytes_available(&self) -> usize {
        let mut bytes: libc::c_int = 0;
        let ok = unsafe { libc::ioctl(self.master_fd, libc::FIONREAD, &mut bytes) } == 0;
        if ok {
            bytes.max(0) as usize
        } else {
            0
        }
    }

    fn get_baud_rate(&self) -> u32 {
        DEFAULT_BAUDRATE
    }
}
