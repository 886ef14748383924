// error.rs

use std::io;
use thiserror::Error;

/// Error types for the serial buffering layer
///
/// There is no timeout variant: every blocking call reports an expired
/// timeout as `false` or a zero count, never as an error.
#[derive(Debug, Error)]
pub enum SerialError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Serial port error: {0}")]
    SerialPort(#[from] mio_serial::Error),
    #[error("Invalid {0} buffer capacity: must be greater than zero")]
    InvalidCapacity(&'static str),
    #[error("Device error: the I/O pump has stopped")]
    DeviceDead,
    #[error("Serial port not open")]
    NotOpen,
    #[error("I/O pump not running")]
    NotRunning,
    #[error("I/O pump already running")]
    AlreadyRunning,
    #[error("Serial port has been closed")]
    Closed,
    #[error("A driver is already attached to this buffer")]
    DriverAttached,
}

pub type Result<T> = std::result::Result<T, SerialError>;
