// native.rs

use bitflags::bitflags;
use std::io;
use std::time::Duration;

bitflags! {
    /// Directions requested from, and reported by, a device wait.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct IoEvents: u8 {
        const READ = 0b001;
        const WRITE = 0b010;
        const ERROR = 0b100;
    }
}

bitflags! {
    /// Modem status lines watched by the pin-change thread.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ModemEvents: u8 {
        const CTS = 0b0001;
        const DSR = 0b0010;
        const CD = 0b0100;
        const RING = 0b1000;
    }
}

bitflags! {
    /// Pin transitions delivered to subscribers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PinChange: u8 {
        const CTS_CHANGED = 0b0001;
        const DSR_CHANGED = 0b0010;
        const CD_CHANGED = 0b0100;
        const RING = 0b1000;
        const BREAK = 0b1_0000;
    }
}

bitflags! {
    /// Line errors reported by the device.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CommErrors: u8 {
        const FRAME = 0b0_0001;
        const OVERRUN = 0b0_0010;
        const RX_OVER = 0b0_0100;
        const RX_PARITY = 0b0_1000;
        const TX_FULL = 0b1_0000;
    }
}

impl From<ModemEvents> for PinChange {
    fn from(events: ModemEvents) -> Self {
        PinChange::from_bits_truncate(events.bits())
    }
}

/// Primitive operations the I/O pump needs from an open serial device.
///
/// The pump calls `wait_for_event`, `read` and `write` from its data thread
/// and `wait_for_modem_event` from its pin thread; the abort methods are
/// called from any other thread. All methods therefore take `&self`.
pub trait NativeDevice: Send + Sync + 'static {
    /// Port name, used to prefix log messages.
    fn name(&self) -> &str;

    fn is_open(&self) -> bool;

    /// Block until one of the directions in `mask` is ready, the timeout
    /// passes or [`abort_wait_for_event`](Self::abort_wait_for_event) is
    /// called.
    ///
    /// # Returns
    /// The ready directions, which may be empty on timeout or abort.
    fn wait_for_event(&self, mask: IoEvents, timeout: Option<Duration>) -> io::Result<IoEvents>;

    /// Interrupt a current or upcoming `wait_for_event`. An abort that arrives
    /// before the wait starts must still make that wait return.
    fn abort_wait_for_event(&self);

    /// Non-blocking read. Returns `WouldBlock` when no data is available.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Non-blocking write. Returns `WouldBlock` when the device queue is full.
    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Block until one of the modem lines in `mask` changes.
    ///
    /// # Returns
    /// The lines that changed. Empty when aborted.
    fn wait_for_modem_event(&self, mask: ModemEvents) -> io::Result<ModemEvents>;

    fn abort_wait_for_modem_event(&self);

    /// Drop any bytes queued in the device but not yet sent.
    fn discard_output(&self) -> io::Result<()> {
        Ok(())
    }

    /// Line errors seen since the last call.
    fn comm_errors(&self) -> CommErrors {
        CommErrors::empty()
    }
}
