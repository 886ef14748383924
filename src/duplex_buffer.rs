// duplex_buffer.rs

use crate::decode_cache::DecodeCache;
use crate::decoder::Encoding;
use crate::error::{Result, SerialError};
use crate::ring_buffer::RingBuffer;
use crate::timer::{wait_deadline, Deadline};
use parking_lot::{Condvar, Mutex};
use std::slice;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Callback that cancels the pump's blocking device wait.
pub type InterruptHook = Arc<dyn Fn() + Send + Sync>;

/// Configuration for a [`DuplexBuffer`]
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Size of the receive ring in bytes
    pub receive_capacity: usize,
    /// Size of the transmit ring in bytes
    pub transmit_capacity: usize,
    /// Encoding for char, line and string operations
    pub encoding: Encoding,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            receive_capacity: 1024 * 1024,
            transmit_capacity: 128 * 1024,
            encoding: Encoding::Utf8,
        }
    }
}

struct ReceiveSide {
    ring: RingBuffer<u8>,
    cache: DecodeCache,
    dead: bool,
    dead_reported: bool,
}

struct TransmitSide {
    ring: RingBuffer<u8>,
    drained: bool,
    abort: bool,
    dead: bool,
}

#[derive(Default)]
struct Doorbell {
    pending: bool,
    stop: bool,
    discard_requested: bool,
    discard_generation: u64,
}

/// Which directions the pump can make progress in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub receive_not_full: bool,
    pub transmit_ready: bool,
}

/// Work handed to the pump by [`DriverBuffer::wait_for_work`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpRequest {
    Stop,
    /// The consumer asked for the transmit data to be thrown away.
    DiscardTransmit,
    Transfer(Readiness),
}

/// Receive and transmit rings shared between one native pump and one
/// application.
///
/// Each side has its own lock so a blocked reader never holds up a writer.
/// The pump reaches the rings through a [`DriverBuffer`] and the application
/// through a [`ConsumerBuffer`]; neither can call the other's operations.
///
/// Lock order is doorbell before either side. The consumer always releases
/// its side lock before ringing the doorbell.
pub struct DuplexBuffer {
    receive: Mutex<ReceiveSide>,
    receive_changed: Condvar,
    transmit: Mutex<TransmitSide>,
    transmit_changed: Condvar,
    doorbell: Mutex<Doorbell>,
    doorbell_rung: Condvar,
    interrupt: Mutex<Option<InterruptHook>>,
    driver_attached: AtomicBool,
    receive_capacity: usize,
    transmit_capacity: usize,
    encoding: Encoding,
}

impl DuplexBuffer {
    /// Create a buffer pair with the capacities in `config`.
    ///
    /// # Returns
    /// `InvalidCapacity` if either capacity is zero.
    pub fn new(config: BufferConfig) -> Result<Arc<Self>> {
        if config.receive_capacity == 0 {
            return Err(SerialError::InvalidCapacity("receive"));
        }
        if config.transmit_capacity == 0 {
            return Err(SerialError::InvalidCapacity("transmit"));
        }

        Ok(Arc::new(Self {
            receive: Mutex::new(ReceiveSide {
                ring: RingBuffer::new(config.receive_capacity),
                cache: DecodeCache::new(config.encoding),
                dead: false,
                dead_reported: false,
            }),
            receive_changed: Condvar::new(),
            transmit: Mutex::new(TransmitSide {
                ring: RingBuffer::new(config.transmit_capacity),
                drained: true,
                abort: false,
                dead: false,
            }),
            transmit_changed: Condvar::new(),
            doorbell: Mutex::new(Doorbell::default()),
            doorbell_rung: Condvar::new(),
            interrupt: Mutex::new(None),
            driver_attached: AtomicBool::new(false),
            receive_capacity: config.receive_capacity,
            transmit_capacity: config.transmit_capacity,
            encoding: config.encoding,
        }))
    }

    /// Attach the pump's facade. Only one driver may be attached at a time.
    pub fn driver(self: &Arc<Self>) -> Result<DriverBuffer> {
        if self
            .driver_attached
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SerialError::DriverAttached);
        }
        Ok(DriverBuffer {
            buffer: Arc::clone(self),
        })
    }

    pub fn consumer(self: &Arc<Self>) -> ConsumerBuffer {
        ConsumerBuffer {
            buffer: Arc::clone(self),
        }
    }

    pub fn receive_capacity(&self) -> usize {
        self.receive_capacity
    }

    pub fn transmit_capacity(&self) -> usize {
        self.transmit_capacity
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Ask the pump to leave its loop.
    pub(crate) fn request_stop(&self) {
        let mut bell = self.doorbell.lock();
        bell.stop = true;
        bell.pending = true;
        self.doorbell_rung.notify_all();
    }

    fn ring_doorbell(&self) {
        let mut bell = self.doorbell.lock();
        bell.pending = true;
        self.doorbell_rung.notify_all();
    }

    /// Cancel the pump's device wait, if a pump is attached.
    fn interrupt_pump(&self) {
        let hook = self.interrupt.lock().clone();
        if let Some(hook) = hook {
            hook();
        }
    }

    fn wake_pump(&self) {
        self.ring_doorbell();
        self.interrupt_pump();
    }
}

/// The pump's view of a [`DuplexBuffer`]: fills the receive ring and drains
/// the transmit ring.
pub struct DriverBuffer {
    buffer: Arc<DuplexBuffer>,
}

impl DriverBuffer {
    /// Contiguous free space of the receive ring.
    ///
    /// The slice is only valid until the next call on this driver, which
    /// covers one native read.
    pub fn receive_window(&mut self) -> &mut [u8] {
        let (ptr, len) = self.buffer.receive.lock().ring.write_window_raw();
        // SAFETY: the ring allocation never moves. The consumer only touches
        // the occupied region, and only this driver can grow it, so the free
        // region is ours until `receive_produce`.
        unsafe { slice::from_raw_parts_mut(ptr, len) }
    }

    /// Publish `count` bytes written into the receive window.
    ///
    /// # Returns
    /// The number of bytes now waiting in the receive ring.
    pub fn receive_produce(&mut self, count: usize) -> usize {
        let mut rx = self.buffer.receive.lock();
        rx.ring.produce(count);
        let len = rx.ring.len();
        self.buffer.receive_changed.notify_all();
        len
    }

    /// Contiguous occupied space of the transmit ring.
    pub fn transmit_window(&mut self) -> &[u8] {
        let (ptr, len) = self.buffer.transmit.lock().ring.read_window_raw();
        // SAFETY: as in `receive_window`; the consumer only appends into the
        // free region and only this driver can shrink the occupied one.
        unsafe { slice::from_raw_parts(ptr, len) }
    }

    /// Release `count` bytes the device accepted from the transmit window.
    pub fn transmit_consume(&mut self, count: usize) {
        let mut tx = self.buffer.transmit.lock();
        tx.ring.consume(count);
        self.buffer.transmit_changed.notify_all();
    }

    /// Mark the transmit side drained if its ring is empty.
    pub fn transmit_drained_check(&mut self) {
        let mut tx = self.buffer.transmit.lock();
        if tx.ring.is_empty() && !tx.drained {
            tx.drained = true;
            self.buffer.transmit_changed.notify_all();
        }
    }

    /// Throw away all pending transmit data.
    pub fn purge(&mut self) {
        let mut tx = self.buffer.transmit.lock();
        tx.ring.reset();
        tx.drained = true;
        self.buffer.transmit_changed.notify_all();
    }

    /// Permanently mark the buffer dead and wake every blocked consumer.
    pub fn device_dead(&mut self) {
        {
            let mut tx = self.buffer.transmit.lock();
            tx.dead = true;
            self.buffer.transmit_changed.notify_all();
        }
        self.mark_receive_dead();
    }

    /// Purge and mark dead in one step, so a flush woken by the purge
    /// already sees the dead state.
    pub fn shutdown(&mut self) {
        {
            let mut tx = self.buffer.transmit.lock();
            tx.ring.reset();
            tx.drained = true;
            tx.dead = true;
            self.buffer.transmit_changed.notify_all();
        }
        self.mark_receive_dead();
        // A pending discard request will never be acknowledged now
        let _bell = self.buffer.doorbell.lock();
        self.buffer.doorbell_rung.notify_all();
    }

    fn mark_receive_dead(&mut self) {
        let mut rx = self.buffer.receive.lock();
        rx.dead = true;
        self.buffer.receive_changed.notify_all();
    }

    pub fn is_receive_not_full(&self) -> bool {
        !self.buffer.receive.lock().ring.is_full()
    }

    pub fn is_transmit_ready(&self) -> bool {
        !self.buffer.transmit.lock().ring.is_empty()
    }

    /// Block until there is something for the pump to do.
    pub fn wait_for_work(&mut self) -> PumpRequest {
        let mut bell = self.buffer.doorbell.lock();
        loop {
            bell.pending = false;
            if bell.stop {
                return PumpRequest::Stop;
            }
            if bell.discard_requested {
                return PumpRequest::DiscardTransmit;
            }

            let readiness = Readiness {
                receive_not_full: self.is_receive_not_full(),
                transmit_ready: self.is_transmit_ready(),
            };
            if readiness.receive_not_full || readiness.transmit_ready {
                return PumpRequest::Transfer(readiness);
            }

            while !bell.pending {
                self.buffer.doorbell_rung.wait(&mut bell);
            }
        }
    }

    /// Acknowledge a [`PumpRequest::DiscardTransmit`] once it is done.
    pub fn complete_discard(&mut self) {
        let mut bell = self.buffer.doorbell.lock();
        bell.discard_requested = false;
        bell.discard_generation = bell.discard_generation.wrapping_add(1);
        self.buffer.doorbell_rung.notify_all();
    }

    /// Install the callback consumers use to cancel the pump's device wait.
    pub fn set_interrupt(&mut self, hook: Option<InterruptHook>) {
        *self.buffer.interrupt.lock() = hook;
    }
}

impl Drop for DriverBuffer {
    fn drop(&mut self) {
        self.buffer.driver_attached.store(false, Ordering::Release);
    }
}

/// The application's view of a [`DuplexBuffer`].
///
/// Cloning is allowed so reads and writes can come from different threads,
/// but there must be at most one reader and one writer at a time.
#[derive(Clone)]
pub struct ConsumerBuffer {
    buffer: Arc<DuplexBuffer>,
}

impl ConsumerBuffer {
    pub fn encoding(&self) -> Encoding {
        self.buffer.encoding
    }

    pub fn receive_capacity(&self) -> usize {
        self.buffer.receive_capacity
    }

    pub fn transmit_capacity(&self) -> usize {
        self.buffer.transmit_capacity
    }

    /// Bytes waiting in the receive ring
    pub fn bytes_to_read(&self) -> usize {
        self.buffer.receive.lock().ring.len()
    }

    /// Bytes not yet taken by the pump
    pub fn bytes_to_write(&self) -> usize {
        self.buffer.transmit.lock().ring.len()
    }

    pub fn is_dead(&self) -> bool {
        self.buffer.receive.lock().dead
    }

    /// Run `f` on the receive side and wake the pump if `f` made room in a
    /// ring the pump had found full.
    fn with_receive<R>(&self, f: impl FnOnce(&mut ReceiveSide) -> R) -> R {
        let (result, freed_full) = {
            let mut rx = self.buffer.receive.lock();
            let was_full = rx.ring.is_full();
            let result = f(&mut *rx);
            (result, was_full && !rx.ring.is_full())
        };
        if freed_full {
            self.buffer.wake_pump();
        }
        result
    }

    /// Wait until `ready` holds for the receive side.
    ///
    /// Returns `false` on timeout or once the device is dead.
    fn wait_receive(
        &self,
        timeout: Option<Duration>,
        ready: impl Fn(&ReceiveSide) -> bool,
    ) -> bool {
        let deadline = Deadline::after(timeout);
        let mut rx = self.buffer.receive.lock();
        loop {
            if ready(&*rx) {
                return true;
            }
            if rx.dead {
                return false;
            }
            if wait_deadline(&self.buffer.receive_changed, &mut rx, &deadline) {
                return ready(&*rx);
            }
        }
    }

    /// Copy received bytes into `buf` without blocking.
    ///
    /// # Returns
    /// Number of bytes copied, possibly zero.
    pub fn read(&self, buf: &mut [u8]) -> usize {
        self.with_receive(|rx| {
            let count = rx.ring.move_to(buf);
            if count > 0 {
                rx.cache.reset(false);
            }
            count
        })
    }

    pub fn read_byte(&self) -> Option<u8> {
        self.with_receive(|rx| {
            let byte = rx.ring.pop();
            if byte.is_some() {
                rx.cache.reset(false);
            }
            byte
        })
    }

    /// Wait up to `timeout` for data, then read what is there.
    ///
    /// # Returns
    /// The number of bytes read, zero on timeout. After the device dies and
    /// the ring runs empty, the first call returns `Ok(0)` and every later
    /// call fails with `DeviceDead`.
    pub fn read_timeout(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let deadline = Deadline::after(timeout);
        let (result, freed_full) = {
            let mut rx = self.buffer.receive.lock();
            loop {
                if !rx.ring.is_empty() {
                    let was_full = rx.ring.is_full();
                    let count = rx.ring.move_to(buf);
                    rx.cache.reset(false);
                    break (Ok(count), was_full);
                }
                if rx.dead {
                    if rx.dead_reported {
                        break (Err(SerialError::DeviceDead), false);
                    }
                    rx.dead_reported = true;
                    break (Ok(0), false);
                }
                if wait_deadline(&self.buffer.receive_changed, &mut rx, &deadline)
                    && rx.ring.is_empty()
                    && !rx.dead
                {
                    break (Ok(0), false);
                }
            }
        };
        if freed_full {
            self.buffer.wake_pump();
        }
        result
    }

    /// Decode up to `count` chars into `out` without blocking.
    pub fn read_chars(&self, out: &mut String, count: usize) -> usize {
        self.with_receive(|rx| {
            let ReceiveSide { ring, cache, .. } = rx;
            cache.read_chars(ring, out, count)
        })
    }

    pub fn read_char(&self) -> Option<char> {
        self.with_receive(|rx| {
            let ReceiveSide { ring, cache, .. } = rx;
            cache.read_char(ring)
        })
    }

    /// Every char that can be decoded right now.
    pub fn read_existing(&self) -> String {
        self.with_receive(|rx| {
            let ReceiveSide { ring, cache, .. } = rx;
            cache.read_existing(ring)
        })
    }

    /// Block until `delimiter` arrives and return the text before it.
    ///
    /// # Returns
    /// `Ok(None)` on timeout, with the data left in place for a later call.
    /// `DeviceDead` if the device died before the delimiter was seen.
    pub fn read_to(&self, delimiter: &str, timeout: Option<Duration>) -> Result<Option<String>> {
        let deadline = Deadline::after(timeout);
        let (result, freed_full) = {
            let mut rx = self.buffer.receive.lock();
            loop {
                let side = &mut *rx;
                let was_full = side.ring.is_full();
                if let Some(line) = side.cache.read_to(&mut side.ring, delimiter) {
                    break (Ok(Some(line)), was_full);
                }
                if delimiter.is_empty() {
                    break (Ok(None), false);
                }
                if side.dead {
                    break (Err(SerialError::DeviceDead), false);
                }
                if wait_deadline(&self.buffer.receive_changed, &mut rx, &deadline)
                    && rx.ring.len() <= rx.cache.scanned()
                {
                    break (Ok(None), false);
                }
            }
        };
        if freed_full {
            self.buffer.wake_pump();
        }
        result
    }

    /// [`read_to`](Self::read_to) with a `\n` delimiter.
    pub fn read_line(&self, timeout: Option<Duration>) -> Result<Option<String>> {
        self.read_to("\n", timeout)
    }

    /// Wait until the receive ring is non-empty.
    pub fn wait_for_receive(&self, timeout: Option<Duration>) -> bool {
        self.wait_receive(timeout, |rx| !rx.ring.is_empty())
    }

    /// Wait until at least `count` bytes are waiting.
    ///
    /// Returns `false` at once if `count` exceeds the receive capacity.
    pub fn wait_for_receive_count(&self, count: usize, timeout: Option<Duration>) -> bool {
        if count == 0 {
            return true;
        }
        if count > self.buffer.receive_capacity {
            return false;
        }
        self.wait_receive(timeout, |rx| rx.ring.len() >= count)
    }

    /// Wait for at least one byte past those the char decoder has scanned.
    pub fn wait_for_char(&self, timeout: Option<Duration>) -> bool {
        self.wait_receive(timeout, |rx| rx.ring.len() > rx.cache.scanned())
    }

    /// Throw away everything in the receive ring.
    pub fn discard_in_buffer(&self) {
        self.with_receive(|rx| {
            let len = rx.ring.len();
            // Consume rather than reset: the pump may hold the free window
            rx.ring.consume(len);
            rx.cache.reset(false);
        });
    }

    /// Append as much of `src` as fits and wake the pump.
    ///
    /// # Returns
    /// Number of bytes queued. Zero once the device is dead.
    pub fn write(&self, src: &[u8]) -> usize {
        let count = {
            let mut tx = self.buffer.transmit.lock();
            if tx.dead {
                return 0;
            }
            let count = tx.ring.append(src);
            if count > 0 {
                tx.drained = false;
            }
            count
        };
        if count > 0 {
            self.buffer.wake_pump();
        }
        count
    }

    /// Write all of `src`, waiting for space as needed.
    ///
    /// # Returns
    /// The number of bytes queued, which is short of `src.len()` only if the
    /// timeout passed or the wait was aborted.
    pub fn write_timeout(&self, src: &[u8], timeout: Option<Duration>) -> Result<usize> {
        let deadline = Deadline::after(timeout);
        let mut written = 0;
        while written < src.len() {
            let chunk = (src.len() - written).min(self.buffer.transmit_capacity);
            if !self.wait_transmit_space(chunk, &deadline) {
                if self.buffer.transmit.lock().dead {
                    return Err(SerialError::DeviceDead);
                }
                break;
            }
            written += self.write(&src[written..written + chunk]);
        }
        if written == 0 && !src.is_empty() && self.buffer.transmit.lock().dead {
            return Err(SerialError::DeviceDead);
        }
        Ok(written)
    }

    /// Encode `s` with the buffer's encoding and write it.
    pub fn write_str(&self, s: &str, timeout: Option<Duration>) -> Result<usize> {
        let bytes = self.buffer.encoding.encode(s);
        self.write_timeout(&bytes, timeout)
    }

    /// Wait until `count` bytes of transmit space are free.
    ///
    /// Returns `false` on timeout, on abort, once the device is dead, or at
    /// once if `count` exceeds the transmit capacity.
    pub fn wait_for_transmit_space(&self, count: usize, timeout: Option<Duration>) -> bool {
        self.wait_transmit_space(count, &Deadline::after(timeout))
    }

    fn wait_transmit_space(&self, count: usize, deadline: &Deadline) -> bool {
        if count > self.buffer.transmit_capacity {
            return false;
        }
        if count == 0 {
            return true;
        }
        let mut tx = self.buffer.transmit.lock();
        loop {
            if tx.abort {
                tx.abort = false;
                return false;
            }
            if tx.dead {
                return false;
            }
            if tx.ring.free() >= count {
                return true;
            }
            if wait_deadline(&self.buffer.transmit_changed, &mut tx, deadline) {
                return !tx.abort && !tx.dead && tx.ring.free() >= count;
            }
        }
    }

    /// Release one blocked [`wait_for_transmit_space`](Self::wait_for_transmit_space)
    /// or [`flush`](Self::flush). The abort stays latched until a wait sees it.
    pub fn abort_wait_for_transmit_space(&self) {
        let mut tx = self.buffer.transmit.lock();
        tx.abort = true;
        self.buffer.transmit_changed.notify_all();
    }

    /// Wait until the pump has handed every queued byte to the device.
    pub fn flush(&self, timeout: Option<Duration>) -> bool {
        let deadline = Deadline::after(timeout);
        let mut tx = self.buffer.transmit.lock();
        loop {
            if tx.abort {
                tx.abort = false;
                return false;
            }
            if tx.dead {
                return false;
            }
            if tx.drained {
                return true;
            }
            if wait_deadline(&self.buffer.transmit_changed, &mut tx, &deadline) {
                return !tx.abort && !tx.dead && tx.drained;
            }
        }
    }

    /// Ask the pump to drop the transmit ring and the device's output queue.
    ///
    /// # Returns
    /// `true` once the pump has done so, `false` on timeout.
    pub fn discard_out_buffer(&self, timeout: Option<Duration>) -> bool {
        let deadline = Deadline::after(timeout);
        {
            let mut tx = self.buffer.transmit.lock();
            if tx.dead {
                tx.ring.reset();
                tx.drained = true;
                return true;
            }
        }

        let generation = {
            let mut bell = self.buffer.doorbell.lock();
            bell.discard_requested = true;
            bell.pending = true;
            self.buffer.doorbell_rung.notify_all();
            bell.discard_generation
        };
        self.buffer.interrupt_pump();

        let mut bell = self.buffer.doorbell.lock();
        loop {
            if bell.discard_generation != generation {
                return true;
            }
            if self.buffer.transmit.lock().dead {
                return true;
            }
            if wait_deadline(&self.buffer.doorbell_rung, &mut bell, &deadline) {
                return bell.discard_generation != generation;
            }
        }
    }
}
