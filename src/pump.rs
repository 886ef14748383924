// pump.rs

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::duplex_buffer::{
    BufferConfig, ConsumerBuffer, DriverBuffer, DuplexBuffer, PumpRequest, Readiness,
};
use crate::error::{Result, SerialError};
use crate::events::{EventHub, SerialEvent};
use crate::native::{IoEvents, ModemEvents, NativeDevice};

/// Configuration for the native I/O pump
#[derive(Debug, Clone)]
pub struct PumpConfig {
    /// Longest single device wait before the pump re-checks its buffers
    pub wait_timeout: Duration,
    /// `DataReceived` is also raised when the receive ring grows past this
    pub received_bytes_threshold: usize,
    /// Modem lines that raise `PinChanged`. Empty disables the pin thread.
    pub modem_events: ModemEvents,
    /// How long each attempt to join the pin thread waits
    pub pin_join_timeout: Duration,
    pub pin_join_retries: u32,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            wait_timeout: Duration::from_millis(500),
            received_bytes_threshold: 1,
            modem_events: ModemEvents::all(),
            pin_join_timeout: Duration::from_millis(100),
            pin_join_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PumpState {
    Idle,
    Running,
    Stopped,
}

struct PinThread {
    handle: JoinHandle<()>,
    done: Receiver<()>,
}

struct Threads {
    state: PumpState,
    data: Option<JoinHandle<()>>,
    pins: Option<PinThread>,
}

/// Drives a [`DuplexBuffer`] against a [`NativeDevice`] on two OS threads.
///
/// The data thread moves bytes between the device and the rings. The pin
/// thread reports modem line changes. Both are started by
/// [`start`](Self::start) and torn down by [`stop`](Self::stop) or on drop;
/// a stopped pump cannot be restarted.
pub struct NativeSerial<D: NativeDevice> {
    device: Arc<D>,
    buffer: Arc<DuplexBuffer>,
    config: PumpConfig,
    events: EventHub,
    running: Arc<AtomicBool>,
    stop_pins: Arc<AtomicBool>,
    threads: Mutex<Threads>,
}

impl<D: NativeDevice> NativeSerial<D> {
    /// Create a pump for `device` with fresh buffers. Nothing runs until
    /// [`start`](Self::start).
    pub fn new(device: D, buffer_config: BufferConfig, config: PumpConfig) -> Result<Self> {
        Ok(Self {
            device: Arc::new(device),
            buffer: DuplexBuffer::new(buffer_config)?,
            config,
            events: EventHub::new(),
            running: Arc::new(AtomicBool::new(false)),
            stop_pins: Arc::new(AtomicBool::new(false)),
            threads: Mutex::new(Threads {
                state: PumpState::Idle,
                data: None,
                pins: None,
            }),
        })
    }

    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    /// Receive notifications raised by the pump threads.
    pub fn subscribe(&self) -> Receiver<SerialEvent> {
        let rx = self.events.subscribe();
        log::debug!(
            "{}: event subscriber added, subscribers={}",
            self.device.name(),
            self.events.subscriber_count()
        );
        rx
    }

    /// `true` while the data thread is in its loop. Cleared as soon as the
    /// thread exits, whether by `stop` or by a device error.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// The application's facade on the buffers.
    pub fn consumer(&self) -> Result<ConsumerBuffer> {
        match self.threads.lock().state {
            PumpState::Idle => Err(SerialError::NotRunning),
            _ => Ok(self.buffer.consumer()),
        }
    }

    /// Start the data and pin threads
    pub fn start(&self) -> Result<()> {
        let mut threads = self.threads.lock();
        match threads.state {
            PumpState::Running => return Err(SerialError::AlreadyRunning),
            PumpState::Stopped => return Err(SerialError::Closed),
            PumpState::Idle => {}
        }
        if !self.device.is_open() {
            return Err(SerialError::NotOpen);
        }

        let mut driver = self.buffer.driver()?;
        let device = Arc::clone(&self.device);
        driver.set_interrupt(Some(Arc::new(move || device.abort_wait_for_event())));

        self.running.store(true, Ordering::Release);
        match self.spawn_data_pump(driver) {
            Ok(handle) => threads.data = Some(handle),
            Err(e) => {
                // The unspawned pump was dropped and has already shut the buffers down
                threads.state = PumpState::Stopped;
                return Err(e.into());
            }
        }
        threads.state = PumpState::Running;

        if !self.config.modem_events.is_empty() {
            match self.spawn_pin_monitor() {
                Ok(pins) => threads.pins = Some(pins),
                Err(e) => log::warn!("{}: pin thread not started: {}", self.device.name(), e),
            }
        }

        log::debug!("{}: I/O pump started", self.device.name());
        Ok(())
    }

    /// Stop both threads and mark the buffers dead. Idempotent.
    pub fn stop(&self) {
        let (data, pins) = {
            let mut threads = self.threads.lock();
            let was_running = threads.state == PumpState::Running;
            threads.state = PumpState::Stopped;
            if !was_running {
                return;
            }
            (threads.data.take(), threads.pins.take())
        };
        let name = self.device.name();

        // Joined without the thread lock so callers of consumer() never stall
        log::debug!("{}: data pump: stopping", name);
        self.buffer.request_stop();
        self.device.abort_wait_for_event();
        if let Some(handle) = data {
            if handle.join().is_err() {
                log::error!("{}: data pump: thread panicked", name);
            }
        }
        log::debug!("{}: data pump: stopped", name);

        if let Some(pins) = pins {
            self.stop_pin_monitor(pins);
        }
    }

    fn stop_pin_monitor(&self, pins: PinThread) {
        let name = self.device.name();
        self.stop_pins.store(true, Ordering::Release);
        self.device.abort_wait_for_modem_event();

        for attempt in 1..=self.config.pin_join_retries {
            match pins.done.recv_timeout(self.config.pin_join_timeout) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    if pins.handle.join().is_err() {
                        log::error!("{}: pin thread: thread panicked", name);
                    }
                    log::debug!("{}: pin thread: stopped", name);
                    return;
                }
                Err(RecvTimeoutError::Timeout) => {
                    log::debug!("{}: pin thread: waiting for thread, attempt={}", name, attempt);
                    self.device.abort_wait_for_modem_event();
                }
            }
        }
        log::warn!("{}: pin thread: did not stop, detaching", name);
    }

    /// Data context: WAIT, DISPATCH, PERFORM-IO, UPDATE until stopped or the
    /// device fails.
    fn spawn_data_pump(&self, driver: DriverBuffer) -> io::Result<JoinHandle<()>> {
        let pump = DataPump {
            name: self.device.name().to_owned(),
            device: Arc::clone(&self.device),
            driver,
            events: self.events.clone(),
            running: Arc::clone(&self.running),
            wait_timeout: self.config.wait_timeout,
            threshold: self.config.received_bytes_threshold.max(1),
        };
        thread::Builder::new()
            .name(format!("{}-data", self.device.name()))
            .spawn(move || pump.run())
    }

    /// Pin context: blocks in the device's modem wait and publishes changes.
    fn spawn_pin_monitor(&self) -> io::Result<PinThread> {
        let device = Arc::clone(&self.device);
        let events = self.events.clone();
        let stop = Arc::clone(&self.stop_pins);
        let mask = self.config.modem_events;
        let (done_tx, done) = bounded(1);

        let handle = thread::Builder::new()
            .name(format!("{}-pins", self.device.name()))
            .spawn(move || monitor_pins(device.as_ref(), &events, mask, &stop, done_tx))?;
        Ok(PinThread { handle, done })
    }
}

impl<D: NativeDevice> Drop for NativeSerial<D> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

struct DataPump<D: NativeDevice> {
    name: String,
    device: Arc<D>,
    driver: DriverBuffer,
    events: EventHub,
    running: Arc<AtomicBool>,
    wait_timeout: Duration,
    threshold: usize,
}

impl<D: NativeDevice> DataPump<D> {
    fn run(mut self) {
        log::debug!("{}: data pump: running", self.name);
        loop {
            match self.driver.wait_for_work() {
                PumpRequest::Stop => {
                    log::debug!("{}: data pump: stop requested", self.name);
                    break;
                }
                PumpRequest::DiscardTransmit => {
                    if let Err(e) = self.device.discard_output() {
                        log::warn!("{}: data pump: discard output failed: {}", self.name, e);
                    }
                    self.driver.purge();
                    self.driver.complete_discard();
                }
                PumpRequest::Transfer(readiness) => {
                    if let Err(e) = self.transfer(readiness) {
                        log::error!("{}: data pump: {}", self.name, e);
                        break;
                    }
                }
            }
        }
        // Drop runs the shutdown
    }

    fn transfer(&mut self, readiness: Readiness) -> io::Result<()> {
        let mut mask = IoEvents::empty();
        if readiness.receive_not_full {
            mask |= IoEvents::READ;
        }
        if readiness.transmit_ready {
            mask |= IoEvents::WRITE;
        }

        let ready = match self.device.wait_for_event(mask, Some(self.wait_timeout)) {
            Ok(ready) => ready,
            Err(e) if is_transient(&e) => return Ok(()),
            Err(e) => return Err(e),
        };
        log::trace!(
            "{}: data pump: wait_for_event({:?}) == {:?}",
            self.name,
            mask,
            ready
        );

        if ready.contains(IoEvents::ERROR) {
            let errors = self.device.comm_errors();
            if !errors.is_empty() {
                log::warn!("{}: data pump: line errors {:?}", self.name, errors);
                self.events.publish(SerialEvent::ErrorReceived(errors));
            }
        }
        if ready.contains(IoEvents::READ) && mask.contains(IoEvents::READ) {
            self.receive()?;
        }
        if ready.contains(IoEvents::WRITE) && mask.contains(IoEvents::WRITE) {
            self.transmit()?;
        }
        self.driver.transmit_drained_check();
        Ok(())
    }

    fn receive(&mut self) -> io::Result<()> {
        let window = self.driver.receive_window();
        let length = window.len();
        let count = match self.device.read(window) {
            Ok(count) => count,
            Err(e) if is_transient(&e) => 0,
            Err(e) => return Err(e),
        };
        log::trace!("{}: data pump: read({}) == {}", self.name, length, count);
        if count == 0 {
            return Ok(());
        }

        let available = self.driver.receive_produce(count);
        let before = available - count;
        if before == 0 || (before < self.threshold && available >= self.threshold) {
            self.events.publish(SerialEvent::DataReceived {
                bytes: count,
                available,
            });
        }
        Ok(())
    }

    fn transmit(&mut self) -> io::Result<()> {
        let window = self.driver.transmit_window();
        let length = window.len();
        let count = match self.device.write(window) {
            Ok(count) => count,
            Err(e) if is_transient(&e) => 0,
            Err(e) => return Err(e),
        };
        log::trace!("{}: data pump: write({}) == {}", self.name, length, count);
        if count > 0 {
            self.driver.transmit_consume(count);
        }
        Ok(())
    }
}

impl<D: NativeDevice> Drop for DataPump<D> {
    fn drop(&mut self) {
        // Every exit path, a panic included, leaves the buffers dead so no
        // consumer wait can hang.
        self.driver.set_interrupt(None);
        self.driver.shutdown();
        self.running.store(false, Ordering::Release);
        log::debug!("{}: data pump: exited", self.name);
    }
}

fn monitor_pins<D: NativeDevice>(
    device: &D,
    events: &EventHub,
    mask: ModemEvents,
    stop: &AtomicBool,
    _done: Sender<()>,
) {
    let name = device.name();
    while !stop.load(Ordering::Acquire) {
        log::trace!("{}: pin thread: waiting", name);
        match device.wait_for_modem_event(mask) {
            Ok(changed) => {
                let changed = changed & mask;
                if !changed.is_empty() {
                    log::debug!("{}: pin thread: event received: {:?}", name, changed);
                    events.publish(SerialEvent::PinChanged(changed.into()));
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                log::error!("{}: pin thread: {}", name, e);
                break;
            }
        }
    }
    log::trace!("{}: pin thread: exiting", name);
}
