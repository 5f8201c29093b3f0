//! Shared mocks for the unit tests: a scripted serial port and a
//! hand-advanced millisecond clock. Both are cheap clones over shared
//! state so a test keeps a handle after the modem takes ownership.

use core::cell::{Cell, RefCell};
use core::convert::Infallible;
use std::collections::VecDeque;
use std::rc::Rc;

use embedded_hal::delay::DelayNs;
use embedded_time::clock::Error as ClockError;
use embedded_time::fraction::Fraction;
use embedded_time::{Clock, Instant};

use crate::config::{Config, NoPin};
use crate::modem::Modem;

/// In-memory serial port. Tests either queue modem output directly with
/// [`feed`], or script request/reply pairs with [`expect`] so a reply only
/// becomes readable once the driver has actually written the command.
/// Scripted replies are matched in FIFO order; an unscripted command gets
/// no reply, which exercises the timeout paths.
///
/// [`feed`]: MockSerial::feed
/// [`expect`]: MockSerial::expect
#[derive(Clone, Default)]
pub struct MockSerial {
    inner: Rc<RefCell<SerialInner>>,
}

enum Trigger {
    /// A complete command line (without CRLF).
    Line(String),
    /// A raw byte suffix, for payload phases that are not line-framed.
    Raw(Vec<u8>),
}

struct ScriptEntry {
    trigger: Trigger,
    reply: Vec<u8>,
}

#[derive(Default)]
struct SerialInner {
    rx: VecDeque<u8>,
    tx: Vec<u8>,
    /// Bytes written since the last trigger, for script matching.
    pending: Vec<u8>,
    script: VecDeque<ScriptEntry>,
}

impl MockSerial {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues bytes the driver will see on its next reads.
    pub fn feed(&self, bytes: &[u8]) {
        self.inner.borrow_mut().rx.extend(bytes.iter().copied());
    }

    /// Scripts: when `cmd` (one line, no CRLF) is written, feed its echo
    /// followed by `reply`.
    pub fn expect(&self, cmd: &str, reply: &[u8]) {
        self.inner.borrow_mut().script.push_back(ScriptEntry {
            trigger: Trigger::Line(cmd.to_owned()),
            reply: reply.to_vec(),
        });
    }

    /// Scripts: when the written bytes end with `suffix`, feed `reply`
    /// (no echo). Used after `>` prompts.
    pub fn expect_raw(&self, suffix: &[u8], reply: &[u8]) {
        self.inner.borrow_mut().script.push_back(ScriptEntry {
            trigger: Trigger::Raw(suffix.to_vec()),
            reply: reply.to_vec(),
        });
    }

    pub fn script_consumed(&self) -> bool {
        self.inner.borrow().script.is_empty()
    }

    pub fn written(&self) -> Vec<u8> {
        self.inner.borrow().tx.clone()
    }

    pub fn written_string(&self) -> String {
        String::from_utf8_lossy(&self.inner.borrow().tx).into_owned()
    }
}

impl SerialInner {
    fn match_script(&mut self) {
        let fired = match self.script.front() {
            Some(ScriptEntry {
                trigger: Trigger::Line(cmd),
                ..
            }) => {
                if self.pending.ends_with(b"\r\n") {
                    let line = String::from_utf8_lossy(&self.pending).into_owned();
                    let hit = line.trim_end() == cmd.as_str();
                    self.pending.clear();
                    if hit {
                        // Command echo precedes the scripted reply.
                        self.rx.extend(cmd.bytes());
                        self.rx.extend(*b"\r\n");
                    }
                    hit
                } else {
                    false
                }
            }
            Some(ScriptEntry {
                trigger: Trigger::Raw(suffix),
                ..
            }) => {
                if self.pending.ends_with(suffix) {
                    self.pending.clear();
                    true
                } else {
                    false
                }
            }
            None => {
                if self.pending.ends_with(b"\r\n") {
                    self.pending.clear();
                }
                false
            }
        };

        if fired {
            if let Some(entry) = self.script.pop_front() {
                self.rx.extend(entry.reply.iter().copied());
            }
        }
    }
}

impl embedded_io::ErrorType for MockSerial {
    type Error = Infallible;
}

impl embedded_io::Read for MockSerial {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Infallible> {
        let mut inner = self.inner.borrow_mut();
        let mut n = 0;
        while n < buf.len() {
            match inner.rx.pop_front() {
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }
}

impl embedded_io::ReadReady for MockSerial {
    fn read_ready(&mut self) -> Result<bool, Infallible> {
        Ok(!self.inner.borrow().rx.is_empty())
    }
}

impl embedded_io::Write for MockSerial {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Infallible> {
        let mut inner = self.inner.borrow_mut();
        for &byte in buf {
            inner.tx.push(byte);
            inner.pending.push(byte);
            inner.match_script();
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Infallible> {
        Ok(())
    }
}

/// Millisecond clock that only moves when a test (or [`MockDelay`])
/// advances it, so timeout assertions are exact.
#[derive(Clone, Default)]
pub struct MockClock {
    now_ms: Rc<Cell<u32>>,
}

impl MockClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance_ms(&self, ms: u32) {
        self.now_ms.set(self.now_ms.get() + ms);
    }

    pub fn elapsed_ms(&self) -> u32 {
        self.now_ms.get()
    }
}

impl Clock for MockClock {
    type T = u32;
    const SCALING_FACTOR: Fraction = Fraction::new(1, 1000);

    fn try_now(&self) -> Result<Instant<Self>, ClockError> {
        Ok(Instant::new(self.now_ms.get()))
    }
}

/// Delay provider that advances the shared [`MockClock`] instead of
/// sleeping, so bounded wait loops run to their deadline instantly.
#[derive(Clone)]
pub struct MockDelay {
    clock: MockClock,
}

impl MockDelay {
    pub fn new(clock: MockClock) -> Self {
        Self { clock }
    }
}

impl DelayNs for MockDelay {
    fn delay_ns(&mut self, ns: u32) {
        // Round sub-millisecond sleeps up so polling loops make progress.
        self.clock.advance_ms(ns.div_ceil(1_000_000).max(1));
    }
}

pub struct MockModem<'sub> {
    pub modem: Modem<'sub, MockSerial, MockClock, MockDelay, NoPin>,
    pub serial: MockSerial,
    pub clock: MockClock,
}

/// Builds a modem over fresh mocks and hands back the test-side handles.
pub fn modem<'sub>() -> MockModem<'sub> {
    let serial = MockSerial::new();
    let clock = MockClock::new();
    let delay = MockDelay::new(clock.clone());
    let modem = Modem::new(serial.clone(), clock.clone(), delay, Config::new());
    MockModem {
        modem,
        serial,
        clock,
    }
}
