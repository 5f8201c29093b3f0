//! AT transport: the single authority over the serial link.
//!
//! [`Modem`] frames incoming bytes into logical lines and classifies each as
//! command echo, response data, a response terminator (`OK`, `ERROR`,
//! `NO CARRIER`) or an unsolicited result code. One command may be in flight
//! at a time; services cooperate by checking [`Modem::ready`] before sending.
//! URCs are delivered synchronously, in wire order, to every registered
//! [`UrcHandler`] from within the [`Modem::poll`] call that framed them.
//!
//! Framing relies on the module's command echo being enabled (the power-on
//! default); [`Modem::init`] deliberately never sends `ATE0`.

use core::cell::{Cell, RefCell};
use core::convert::TryInto;
use core::fmt::Write as _;

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;
use embedded_io::{Read, ReadReady, Write};
use embedded_time::duration::{Generic, Milliseconds};
use embedded_time::{Clock, Instant};
use heapless::String;

use crate::config::Config;
use crate::error::Error;

/// URC handler slots: one per socket, plus GPRS, location and voice.
pub const MAX_URC_HANDLERS: usize = 10;

/// Accumulator / capture capacity. Sized for the largest solicited payload,
/// a 512 byte socket read returned as quoted hex.
pub(crate) const BUFFER_LEN: usize = 2048;

/// Scratch capacity for formatted commands (`AT+USOWR` with a full chunk).
pub(crate) const COMMAND_LEN: usize = 1088;

const URC_LINE_LEN: usize = 256;

const WAKE_DELAY_MS: u32 = 5;
const QUIET_INTERVAL_MS: u32 = 20;
const POLL_INTERVAL_MS: u32 = 1;

/// Receiver of unsolicited result codes.
///
/// Implementations get every URC line, trimmed, and must ignore prefixes they
/// do not recognize. Handlers take `&self` and update through `Cell`-style
/// state; they hold no transport reference, so issuing a command from inside
/// a handler is not representable.
pub trait UrcHandler {
    fn handle_urc(&self, line: &str);
}

/// Terminal outcome of one AT command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ResponseCode {
    /// `OK`
    Ok,
    /// `ERROR`
    Error,
    /// `NO CARRIER`
    NoCarrier,
}

impl ResponseCode {
    /// Map a non-`OK` outcome to the matching error.
    pub fn check(self) -> Result<(), Error> {
        match self {
            ResponseCode::Ok => Ok(()),
            ResponseCode::Error => Err(Error::Command),
            ResponseCode::NoCarrier => Err(Error::NoCarrier),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AtState {
    /// Between commands: completed lines are URCs, except the echo of a
    /// freshly sent command.
    Idle,
    /// Echo seen; accumulating response data until a terminator line.
    Receiving,
}

struct Framer {
    buf: String<BUFFER_LEN>,
    /// Byte offset where the current (incomplete) line begins.
    line_start: usize,
    state: AtState,
    /// Single-slot response sink, armed for exactly one command.
    capture: bool,
    has_response: bool,
    response: String<BUFFER_LEN>,
}

impl Framer {
    fn new() -> Self {
        Self {
            buf: String::new(),
            line_start: 0,
            state: AtState::Idle,
            capture: false,
            has_response: false,
            response: String::new(),
        }
    }

    fn reset_line(&mut self) {
        self.buf.clear();
        self.line_start = 0;
    }
}

fn trim_copy<const N: usize>(s: &str) -> String<N> {
    let mut out = String::new();
    for c in s.trim().chars() {
        if out.push(c).is_err() {
            warn!("URC line truncated to {} bytes", N);
            break;
        }
    }
    out
}

/// The modem transport. Shared by reference between all services; interior
/// mutability keeps every method `&self`.
///
/// `'sub` is the lifetime of registered URC handlers, `S` the serial link,
/// `CLK` the monotonic clock behind all deadlines, `D` the delay used by
/// blocking waits and `DTR` the optional power-saving handshake line.
pub struct Modem<'sub, S, CLK, D, DTR>
where
    CLK: Clock,
{
    serial: RefCell<S>,
    clock: CLK,
    delay: RefCell<D>,
    dtr: RefCell<Option<DTR>>,
    low_power: Cell<bool>,
    framer: RefCell<Framer>,
    status: Cell<Option<ResponseCode>>,
    /// Arrival time of the last response terminator or URC, for the
    /// inter-command quiet interval.
    last_line: RefCell<Option<Instant<CLK>>>,
    urc_handlers: RefCell<[Option<&'sub dyn UrcHandler>; MAX_URC_HANDLERS]>,
}

impl<'sub, S, CLK, D, DTR> Modem<'sub, S, CLK, D, DTR>
where
    S: Read + Write + ReadReady,
    CLK: Clock,
    Generic<CLK::T>: TryInto<Milliseconds>,
    D: DelayNs,
    DTR: OutputPin,
{
    pub fn new(serial: S, clock: CLK, delay: D, config: Config<DTR>) -> Self {
        Self {
            serial: RefCell::new(serial),
            clock,
            delay: RefCell::new(delay),
            dtr: RefCell::new(config.dtr_pin),
            low_power: Cell::new(false),
            framer: RefCell::new(Framer::new()),
            // Matches the power-on state: no command in flight, last one "succeeded".
            status: Cell::new(Some(ResponseCode::Ok)),
            last_line: RefCell::new(None),
            urc_handlers: RefCell::new([None; MAX_URC_HANDLERS]),
        }
    }

    /// Probe the module with `AT` until it answers `OK`.
    pub fn init(&self, timeout: Milliseconds) -> Result<(), Error> {
        let start = self.now()?;
        loop {
            self.send("AT")?;
            if matches!(
                self.wait_for_response(Milliseconds(100)),
                Ok(ResponseCode::Ok)
            ) {
                return Ok(());
            }
            if self.elapsed_since(&start)? >= timeout {
                return Err(Error::Timeout);
            }
            self.delay_ms(100);
        }
    }

    /// Write one command line (CRLF appended) and mark it in flight.
    ///
    /// Wakes the module over DTR when in low-power mode and spaces commands
    /// at least 20 ms after the last received line, so a command cannot
    /// collide with asynchronous modem output.
    pub fn send(&self, cmd: &str) -> Result<(), Error> {
        self.prepare_send()?;

        trace!("-> {}", cmd);
        {
            let mut serial = self.serial.borrow_mut();
            serial.write_all(cmd.as_bytes()).map_err(|_| Error::Serial)?;
            serial.write_all(b"\r\n").map_err(|_| Error::Serial)?;
            serial.flush().map_err(|_| Error::Serial)?;
        }

        let mut f = self.framer.borrow_mut();
        f.reset_line();
        f.state = AtState::Idle;
        f.has_response = false;
        drop(f);
        self.status.set(None);
        Ok(())
    }

    /// `send` with inline formatting, for command lines built from arguments.
    pub fn send_fmt(&self, args: core::fmt::Arguments<'_>) -> Result<(), Error> {
        let mut cmd: String<COMMAND_LEN> = String::new();
        cmd.write_fmt(args).map_err(|_| Error::Overflow)?;
        self.send(&cmd)
    }

    /// Drain all currently available serial bytes through the framer.
    pub fn poll(&self) -> Result<(), Error> {
        loop {
            let byte = {
                let mut serial = self.serial.borrow_mut();
                match serial.read_ready() {
                    Ok(true) => {}
                    Ok(false) => return Ok(()),
                    Err(_) => return Err(Error::Serial),
                }
                let mut b = [0u8; 1];
                match serial.read(&mut b).map_err(|_| Error::Serial)? {
                    0 => return Ok(()),
                    _ => b[0],
                }
            };
            self.ingest(byte)?;
        }
    }

    /// Poll, then report the in-flight command: the terminal code, or
    /// `WouldBlock` while no terminator has been seen.
    pub fn ready(&self) -> nb::Result<ResponseCode, Error> {
        self.poll().map_err(nb::Error::Other)?;
        match self.status.get() {
            Some(code) => Ok(code),
            None => Err(nb::Error::WouldBlock),
        }
    }

    /// Block until the in-flight command terminates. On deadline expiry the
    /// partial accumulation and any armed sink are discarded and
    /// [`Error::Timeout`] is returned, distinct from the modem's `ERROR`.
    pub fn wait_for_response(&self, timeout: Milliseconds) -> Result<ResponseCode, Error> {
        let start = self.now()?;
        loop {
            match self.ready() {
                Ok(code) => return Ok(code),
                Err(nb::Error::Other(e)) => return Err(e),
                Err(nb::Error::WouldBlock) => {}
            }
            if self.elapsed_since(&start)? >= timeout {
                self.abort_command();
                return Err(Error::Timeout);
            }
            self.delay_ms(POLL_INTERVAL_MS);
        }
    }

    /// [`Modem::wait_for_response`] with payload capture: arms the sink,
    /// waits, and copies the captured text (response minus terminator,
    /// trimmed) into `storage`. The sink is cleared on every exit path.
    pub fn wait_for_response_into<const N: usize>(
        &self,
        timeout: Milliseconds,
        storage: &mut String<N>,
    ) -> Result<ResponseCode, Error> {
        self.capture_response();
        match self.wait_for_response(timeout) {
            Ok(code) => {
                self.take_response(storage);
                Ok(code)
            }
            Err(e) => {
                self.clear_capture();
                Err(e)
            }
        }
    }

    /// Arm the single-slot response sink for the next (or current) command.
    pub fn capture_response(&self) {
        let mut f = self.framer.borrow_mut();
        f.capture = true;
        f.has_response = false;
        f.response.clear();
    }

    /// Consume the captured payload into `storage`. Returns `false` when no
    /// capture completed. The slot is empty afterwards either way.
    pub fn take_response<const N: usize>(&self, storage: &mut String<N>) -> bool {
        let mut f = self.framer.borrow_mut();
        storage.clear();
        if !f.has_response {
            return false;
        }
        for c in f.response.as_str().chars() {
            if storage.push(c).is_err() {
                warn!("captured response truncated to {} bytes", N);
                break;
            }
        }
        f.has_response = false;
        f.response.clear();
        true
    }

    /// Wait for the literal `>` prompt that precedes a raw payload phase
    /// (SMS body, file and FTP uploads). The prompt is not line-terminated
    /// and the module sends it as `> `, so this watches the raw accumulator
    /// instead of completed lines.
    pub fn wait_for_prompt(&self, timeout: Milliseconds) -> Result<(), Error> {
        let start = self.now()?;
        loop {
            self.poll()?;
            {
                let mut f = self.framer.borrow_mut();
                if f.buf.as_str().trim_end().ends_with('>') {
                    f.reset_line();
                    return Ok(());
                }
            }
            if self.elapsed_since(&start)? >= timeout {
                self.abort_command();
                return Err(Error::Timeout);
            }
            self.delay_ms(POLL_INTERVAL_MS);
        }
    }

    /// Raw passthrough for payload phases following a prompt.
    pub fn write_bytes(&self, data: &[u8]) -> Result<(), Error> {
        let mut serial = self.serial.borrow_mut();
        serial.write_all(data).map_err(|_| Error::Serial)?;
        serial.flush().map_err(|_| Error::Serial)
    }

    /// Put the module to sleep by releasing DTR. No-op without a DTR pin.
    pub fn low_power_mode(&self) {
        if let Some(dtr) = self.dtr.borrow_mut().as_mut() {
            dtr.set_high().ok();
            self.low_power.set(true);
        }
    }

    pub fn no_low_power_mode(&self) {
        if let Some(dtr) = self.dtr.borrow_mut().as_mut() {
            dtr.set_low().ok();
            self.low_power.set(false);
        }
    }

    /// Spin a non-blocking step function until terminal, sleeping `interval_ms`
    /// between polls, bounded by `timeout`. A timeout abandons the in-flight
    /// exchange like [`Modem::wait_for_response`] does.
    pub fn spin<T>(
        &self,
        timeout: Milliseconds,
        interval_ms: u32,
        mut step: impl FnMut() -> nb::Result<T, Error>,
    ) -> Result<T, Error> {
        let start = self.now()?;
        loop {
            match step() {
                Ok(v) => return Ok(v),
                Err(nb::Error::Other(e)) => return Err(e),
                Err(nb::Error::WouldBlock) => {}
            }
            if self.elapsed_since(&start)? >= timeout {
                self.abort_command();
                return Err(Error::Timeout);
            }
            self.delay_ms(interval_ms);
        }
    }

    pub(crate) fn delay_ms(&self, ms: u32) {
        self.delay.borrow_mut().delay_ms(ms);
    }

    pub(crate) fn now(&self) -> Result<Instant<CLK>, Error> {
        self.clock.try_now().map_err(|_| Error::Clock)
    }

    pub(crate) fn elapsed_since(&self, start: &Instant<CLK>) -> Result<Milliseconds, Error> {
        let now = self.now()?;
        now.checked_duration_since(start)
            .and_then(|dur| dur.try_into().ok())
            .ok_or(Error::Clock)
    }

    fn prepare_send(&self) -> Result<(), Error> {
        if self.low_power.get() {
            if let Some(dtr) = self.dtr.borrow_mut().as_mut() {
                dtr.set_low().ok();
            }
            self.delay_ms(WAKE_DELAY_MS);
        }

        // Keep clear of asynchronous output still in progress: hold off until
        // the line has been quiet since the last response or URC.
        loop {
            let last = self.last_line.borrow().clone();
            match last {
                None => break,
                Some(t) => {
                    if self.elapsed_since(&t)? >= Milliseconds(QUIET_INTERVAL_MS) {
                        break;
                    }
                    self.poll()?;
                    self.delay_ms(POLL_INTERVAL_MS);
                }
            }
        }
        Ok(())
    }

    fn abort_command(&self) {
        let mut f = self.framer.borrow_mut();
        f.reset_line();
        f.state = AtState::Idle;
        f.capture = false;
        f.has_response = false;
        f.response.clear();
    }

    fn clear_capture(&self) {
        let mut f = self.framer.borrow_mut();
        f.capture = false;
        f.has_response = false;
        f.response.clear();
    }

    fn note_line_time(&self) {
        if let Ok(t) = self.clock.try_now() {
            self.last_line.borrow_mut().replace(t);
        }
    }

    fn ingest(&self, byte: u8) -> Result<(), Error> {
        let mut urc: Option<String<URC_LINE_LEN>> = None;

        {
            let mut f = self.framer.borrow_mut();

            if f.buf.push(byte as char).is_err() {
                warn!("rx overflow, dropping {} buffered bytes", f.buf.len());
                f.reset_line();
                return Ok(());
            }

            if byte == b'\n' {
                match f.state {
                    AtState::Idle => {
                        if f.buf.starts_with("AT") {
                            // Command echo; the response follows.
                            f.reset_line();
                            f.state = AtState::Receiving;
                        } else {
                            let line = trim_copy(f.buf.as_str());
                            f.reset_line();
                            self.note_line_time();
                            if !line.is_empty() {
                                urc = Some(line);
                            }
                        }
                    }
                    AtState::Receiving => {
                        let line_start = f.line_start;
                        let code = match f.buf.as_str()[line_start..].trim() {
                            "OK" => Some(ResponseCode::Ok),
                            "ERROR" => Some(ResponseCode::Error),
                            "NO CARRIER" => Some(ResponseCode::NoCarrier),
                            _ => None,
                        };

                        if let Some(code) = code {
                            {
                                let Framer {
                                    buf,
                                    capture,
                                    has_response,
                                    response,
                                    ..
                                } = &mut *f;
                                if *capture {
                                    response.clear();
                                    for c in buf.as_str()[..line_start].trim().chars() {
                                        if response.push(c).is_err() {
                                            break;
                                        }
                                    }
                                    *capture = false;
                                    *has_response = true;
                                }
                            }
                            f.reset_line();
                            f.state = AtState::Idle;
                            self.status.set(Some(code));
                            self.note_line_time();
                        } else if f.buf.as_str()[line_start..].trim_start().starts_with("+UU") {
                            // Unsolicited line interleaved with a response
                            // (e.g. SSL teardown during a socket read):
                            // divert it instead of absorbing it as data.
                            let line = trim_copy(&f.buf.as_str()[line_start..]);
                            f.buf.truncate(line_start);
                            self.note_line_time();
                            if !line.is_empty() {
                                urc = Some(line);
                            }
                        } else {
                            f.line_start = f.buf.len();
                        }
                    }
                }
            }
        }

        if let Some(line) = urc {
            self.dispatch_urc(&line);
        }
        Ok(())
    }

    fn dispatch_urc(&self, line: &str) {
        trace!("<- URC {}", line);
        for slot in self.urc_handlers.borrow().iter() {
            if let Some(handler) = slot {
                handler.handle_urc(line);
            }
        }
    }
}

/// The registry only touches the handler table, so it is available without
/// the serial and delay bounds. Service `Drop` impls rely on that.
impl<'sub, S, CLK, D, DTR> Modem<'sub, S, CLK, D, DTR>
where
    CLK: Clock,
{
    /// Register a URC subscriber in the first free slot.
    ///
    /// A full table is a composition mistake, reported loudly as
    /// [`Error::UrcCapacity`] instead of silently dropping the subscriber.
    pub fn register_urc_handler(&self, handler: &'sub dyn UrcHandler) -> Result<(), Error> {
        let mut slots = self.urc_handlers.borrow_mut();
        for slot in slots.iter_mut() {
            if slot.is_none() {
                *slot = Some(handler);
                return Ok(());
            }
        }
        error!("URC handler table full");
        Err(Error::UrcCapacity)
    }

    /// Null the slot holding `handler` (pointer identity).
    pub fn unregister_urc_handler(&self, handler: &dyn UrcHandler) {
        let mut slots = self.urc_handlers.borrow_mut();
        for slot in slots.iter_mut() {
            if let Some(h) = slot {
                if core::ptr::eq(
                    *h as *const dyn UrcHandler as *const (),
                    handler as *const dyn UrcHandler as *const (),
                ) {
                    *slot = None;
                }
            }
        }
    }
}
