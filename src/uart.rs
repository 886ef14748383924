// uart.rs

use std::io::{self, Read, Write};
use std::time::Duration;

use mio::{Events, Interest, Poll, Token, Waker};
use mio_serial::{ClearBuffer, SerialPort, SerialStream};
use parking_lot::{Condvar, Mutex};

use crate::error::Result;
use crate::native::{IoEvents, ModemEvents, NativeDevice};

const PORT: Token = Token(0);
const WAKE: Token = Token(1);

/// How often modem lines are sampled while waiting for a pin change
const MODEM_POLL_INTERVAL: Duration = Duration::from_millis(10);

struct Poller {
    poll: Poll,
    events: Events,
}

/// A UART opened through `mio_serial` and driven by a `mio::Poll`.
///
/// The port is open for the lifetime of the value and closed on drop.
///
/// mio reports readiness edges only, so the last reported readiness is kept
/// until a read or write hits `WouldBlock`.
///
/// `mio_serial` has no blocking wait for modem line changes, so
/// [`wait_for_modem_event`](NativeDevice::wait_for_modem_event) polls the
/// CTS, DSR, CD and RING lines every 10 ms and reports the lines that
/// changed since the previous sample. A change shorter than one interval
/// can be missed.
pub struct UartDevice {
    port: Mutex<SerialStream>,
    poller: Mutex<Poller>,
    waker: Waker,
    ready: Mutex<IoEvents>,
    modem_last: Mutex<ModemEvents>,
    modem_abort: Mutex<bool>,
    modem_changed: Condvar,
    port_name: String,
    baud_rate: u32,
}

impl UartDevice {
    /// Open `port_name` at `baud_rate`, 8N1 without flow control.
    pub fn open(port_name: &str, baud_rate: u32) -> Result<Self> {
        log::debug!("UART: Opening {} at {} baud", port_name, baud_rate);

        let builder = mio_serial::new(port_name, baud_rate)
            .flow_control(mio_serial::FlowControl::None)
            .data_bits(mio_serial::DataBits::Eight)
            .parity(mio_serial::Parity::None)
            .stop_bits(mio_serial::StopBits::One);

        let mut stream = SerialStream::open(&builder)?;

        #[cfg(unix)]
        if let Err(e) = stream.set_exclusive(false) {
            log::error!("Failed to make mio serial stream non-exclusive: {}", e);
        }

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut stream, PORT, Interest::READABLE | Interest::WRITABLE)?;
        let waker = Waker::new(poll.registry(), WAKE)?;

        let modem_last = modem_lines(&mut stream)?;

        log::debug!("UART: Successfully opened {}", port_name);

        Ok(Self {
            port: Mutex::new(stream),
            poller: Mutex::new(Poller {
                poll,
                events: Events::with_capacity(8),
            }),
            waker,
            ready: Mutex::new(IoEvents::READ | IoEvents::WRITE),
            modem_last: Mutex::new(modem_last),
            modem_abort: Mutex::new(false),
            modem_changed: Condvar::new(),
            port_name: port_name.to_owned(),
            baud_rate,
        })
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    fn clear_ready(&self, flag: IoEvents) {
        self.ready.lock().remove(flag);
    }
}

/// Current state of the modem input lines
fn modem_lines(port: &mut SerialStream) -> io::Result<ModemEvents> {
    let mut lines = ModemEvents::empty();
    lines.set(ModemEvents::CTS, port.read_clear_to_send()?);
    lines.set(ModemEvents::DSR, port.read_data_set_ready()?);
    lines.set(ModemEvents::CD, port.read_carrier_detect()?);
    lines.set(ModemEvents::RING, port.read_ring_indicator()?);
    Ok(lines)
}

impl NativeDevice for UartDevice {
    fn name(&self) -> &str {
        &self.port_name
    }

    fn is_open(&self) -> bool {
        true
    }

    fn wait_for_event(&self, mask: IoEvents, timeout: Option<Duration>) -> io::Result<IoEvents> {
        let sticky = *self.ready.lock() & mask;
        if !sticky.is_empty() {
            return Ok(sticky);
        }

        let mut poller = self.poller.lock();
        let Poller { poll, events } = &mut *poller;
        match poll.poll(events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(IoEvents::empty()),
            Err(e) => return Err(e),
        }

        let mut ready = self.ready.lock();
        for event in events.iter().filter(|e| e.token() == PORT) {
            if event.is_readable() || event.is_read_closed() {
                ready.insert(IoEvents::READ);
            }
            if event.is_writable() {
                ready.insert(IoEvents::WRITE);
            }
            if event.is_error() {
                // The error itself surfaces from the next read
                ready.insert(IoEvents::READ | IoEvents::ERROR);
            }
        }
        let reported = *ready & (mask | IoEvents::ERROR);
        ready.remove(IoEvents::ERROR);
        Ok(reported)
    }

    fn abort_wait_for_event(&self) {
        if let Err(e) = self.waker.wake() {
            log::error!("{}: failed to wake poll: {}", self.port_name, e);
        }
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self.port.lock().read(buf) {
            Ok(0) => {
                self.clear_ready(IoEvents::READ);
                Ok(0)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.clear_ready(IoEvents::READ);
                Err(e)
            }
            other => other,
        }
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        match self.port.lock().write(buf) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.clear_ready(IoEvents::WRITE);
                Err(e)
            }
            other => other,
        }
    }

    fn wait_for_modem_event(&self, mask: ModemEvents) -> io::Result<ModemEvents> {
        loop {
            let current = modem_lines(&mut self.port.lock())?;
            let changed = {
                let mut last = self.modem_last.lock();
                let changed = (current ^ *last) & mask;
                *last = current;
                changed
            };
            if !changed.is_empty() {
                return Ok(changed);
            }

            let mut abort = self.modem_abort.lock();
            if !*abort {
                self.modem_changed.wait_for(&mut abort, MODEM_POLL_INTERVAL);
            }
            if *abort {
                *abort = false;
                return Ok(ModemEvents::empty());
            }
        }
    }

    fn abort_wait_for_modem_event(&self) {
        let mut abort = self.modem_abort.lock();
        *abort = true;
        self.modem_changed.notify_all();
    }

    fn discard_output(&self) -> io::Result<()> {
        self.port
            .lock()
            .clear(ClearBuffer::Output)
            .map_err(io::Error::from)
    }
}
