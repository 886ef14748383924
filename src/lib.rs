//! Duplex serial buffering library
//!
//! This library provides timeout-aware byte and character streams over a
//! serial device. A native I/O pump thread moves data between the device and
//! a pair of ring buffers; the application reads and writes those rings with
//! bounded, cancellable waits.

pub mod decode_cache;
pub mod decoder;
pub mod duplex_buffer;
pub mod error;
pub mod events;
pub mod native;
pub mod pump;
pub mod ring_buffer;
mod timer;
pub mod uart;

// Re-export main types for convenience
pub use decoder::Encoding;
pub use duplex_buffer::{BufferConfig, ConsumerBuffer, DriverBuffer, DuplexBuffer};
pub use error::{Result, SerialError};
pub use events::SerialEvent;
pub use native::{CommErrors, IoEvents, ModemEvents, NativeDevice, PinChange};
pub use pump::{NativeSerial, PumpConfig};
pub use ring_buffer::RingBuffer;
pub use uart::UartDevice;
