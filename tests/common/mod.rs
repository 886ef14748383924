// Shared in-memory device for the pump tests
#![allow(dead_code)]

use parking_lot::{Condvar, Mutex};
use serial_duplex_io::{CommErrors, IoEvents, ModemEvents, NativeDevice};
use std::collections::VecDeque;
use std::io;
use std::time::{Duration, Instant};

struct MockState {
    open: bool,
    inbox: VecDeque<u8>,
    sent: Vec<u8>,
    write_blocked: bool,
    write_limit: Option<usize>,
    fail: Option<io::ErrorKind>,
    read_panics: bool,
    errors: CommErrors,
    event_abort: bool,
    event_aborts: usize,
    modem_queue: VecDeque<ModemEvents>,
    modem_abort: bool,
    ignore_modem_abort: bool,
    discards: usize,
}

/// A serial device backed by byte queues.
///
/// Input pushed by the test becomes readable by the pump; bytes the pump
/// writes are collected in `sent`.
pub struct MockDevice {
    name: String,
    state: Mutex<MockState>,
    changed: Condvar,
}

impl MockDevice {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(MockState {
                open: true,
                inbox: VecDeque::new(),
                sent: Vec::new(),
                write_blocked: false,
                write_limit: None,
                fail: None,
                read_panics: false,
                errors: CommErrors::empty(),
                event_abort: false,
                event_aborts: 0,
                modem_queue: VecDeque::new(),
                modem_abort: false,
                ignore_modem_abort: false,
                discards: 0,
            }),
            changed: Condvar::new(),
        }
    }

    fn update(&self, f: impl FnOnce(&mut MockState)) {
        let mut state = self.state.lock();
        f(&mut state);
        self.changed.notify_all();
    }

    pub fn set_open(&self, open: bool) {
        self.update(|s| s.open = open);
    }

    pub fn push_input(&self, data: &[u8]) {
        self.update(|s| s.inbox.extend(data));
    }

    pub fn push_modem_event(&self, event: ModemEvents) {
        self.update(|s| s.modem_queue.push_back(event));
    }

    /// Make the next device call fail with `kind`.
    pub fn fail_next(&self, kind: io::ErrorKind) {
        self.update(|s| s.fail = Some(kind));
    }

    /// Make every read panic, like a driver fault inside the pump.
    pub fn set_read_panics(&self) {
        self.update(|s| s.read_panics = true);
    }

    pub fn set_comm_errors(&self, errors: CommErrors) {
        self.update(|s| s.errors = errors);
    }

    /// While blocked the device never reports write readiness.
    pub fn set_write_blocked(&self, blocked: bool) {
        self.update(|s| s.write_blocked = blocked);
    }

    /// Accept at most `limit` bytes per write call.
    pub fn set_write_limit(&self, limit: usize) {
        self.update(|s| s.write_limit = Some(limit));
    }

    /// Make the modem wait deaf to aborts, like a stuck driver call.
    pub fn ignore_modem_abort(&self) {
        self.update(|s| s.ignore_modem_abort = true);
    }

    pub fn sent(&self) -> Vec<u8> {
        self.state.lock().sent.clone()
    }

    pub fn event_aborts(&self) -> usize {
        self.state.lock().event_aborts
    }

    pub fn discards(&self) -> usize {
        self.state.lock().discards
    }

    /// Wait until at least `len` bytes have been written by the pump.
    pub fn wait_for_sent(&self, len: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.sent.len() < len {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return state.sent.len() >= len;
            }
        }
        true
    }
}

impl NativeDevice for MockDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_open(&self) -> bool {
        self.state.lock().open
    }

    fn wait_for_event(&self, mask: IoEvents, timeout: Option<Duration>) -> io::Result<IoEvents> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        loop {
            if let Some(kind) = state.fail.take() {
                return Err(io::Error::new(kind, "injected failure"));
            }
            if state.event_abort {
                state.event_abort = false;
                return Ok(IoEvents::empty());
            }

            let mut ready = IoEvents::empty();
            if mask.contains(IoEvents::READ) && !state.inbox.is_empty() {
                ready |= IoEvents::READ;
            }
            if mask.contains(IoEvents::WRITE) && !state.write_blocked {
                ready |= IoEvents::WRITE;
            }
            if !state.errors.is_empty() {
                ready |= IoEvents::ERROR;
            }
            if !ready.is_empty() {
                return Ok(ready);
            }

            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(&mut state, deadline).timed_out() {
                        return Ok(IoEvents::empty());
                    }
                }
                None => self.changed.wait(&mut state),
            }
        }
    }

    fn abort_wait_for_event(&self) {
        self.update(|s| {
            s.event_abort = true;
            s.event_aborts += 1;
        });
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        if state.read_panics {
            drop(state);
            panic!("{}: driver fault during read", self.name);
        }
        if let Some(kind) = state.fail.take() {
            return Err(io::Error::new(kind, "injected failure"));
        }
        if state.inbox.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let count = buf.len().min(state.inbox.len());
        for (slot, byte) in buf.iter_mut().zip(state.inbox.drain(..count)) {
            *slot = byte;
        }
        Ok(count)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        if state.write_blocked {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let count = buf.len().min(state.write_limit.unwrap_or(usize::MAX));
        state.sent.extend_from_slice(&buf[..count]);
        self.changed.notify_all();
        Ok(count)
    }

    fn wait_for_modem_event(&self, mask: ModemEvents) -> io::Result<ModemEvents> {
        let mut state = self.state.lock();
        loop {
            if state.modem_abort && !state.ignore_modem_abort {
                state.modem_abort = false;
                return Ok(ModemEvents::empty());
            }
            if let Some(event) = state.modem_queue.pop_front() {
                return Ok(event & mask);
            }
            self.changed.wait(&mut state);
        }
    }

    fn abort_wait_for_modem_event(&self) {
        self.update(|s| s.modem_abort = true);
    }

    fn discard_output(&self) -> io::Result<()> {
        self.update(|s| s.discards += 1);
        Ok(())
    }

    fn comm_errors(&self) -> CommErrors {
        let mut state = self.state.lock();
        std::mem::replace(&mut state.errors, CommErrors::empty())
    }
}
