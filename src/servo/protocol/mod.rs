pub mod packet;
pub mod port_handler;
#[cfg(unix)]
pub mod raw_tty;
pub mod serial_port;
pub mod session;
pub mod stservo_def;
#[cfg(unix)]
pub mod virtual_uart;
