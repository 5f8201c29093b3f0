//! TCP client over a module socket.

use core::cell::Cell;
use core::convert::TryInto;
use core::fmt::Write as _;

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;
use embedded_io::{Read, ReadReady, Write};
use embedded_time::duration::{Generic, Milliseconds};
use embedded_time::Clock;
use heapless::String;

use crate::error::Error;
use crate::hex;
use crate::modem::{Modem, ResponseCode, UrcHandler, COMMAND_LEN};
use crate::services::parse;
use crate::services::socket::buffer::{SocketBuffer, SOCKET_BUFFER_LEN};
use crate::services::socket::{SocketHandle, NUM_SOCKETS, SOCKET_IO_TIMEOUT_MS};
use crate::state::SERVICE_POLL_MS;

/// Asynchronous socket closures, one bit per socket id.
///
/// The module reports a peer or network close with `+UUSOCL: <id>`; a secure
/// socket torn down by the TLS layer instead reports a read-notification
/// with the sentinel length `4294967295`. Both mark the id closed here; the
/// owning client notices on its next operation.
#[derive(Default)]
pub struct SocketEvents {
    closed: Cell<u8>,
}

impl SocketEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn is_closed(&self, socket: SocketHandle) -> bool {
        self.closed.get() & (1 << socket.0) != 0
    }

    pub(crate) fn clear(&self, socket: SocketHandle) {
        self.closed.set(self.closed.get() & !(1 << socket.0));
    }

    fn mark_closed(&self, socket: SocketHandle) {
        self.closed.set(self.closed.get() | (1 << socket.0));
    }
}

impl UrcHandler for SocketEvents {
    fn handle_urc(&self, line: &str) {
        if let Some(rest) = parse::after_prefix(line, "+UUSOCL: ") {
            if let Some(socket) = super::socket_from_field(rest) {
                self.mark_closed(socket);
            }
        } else if let Some(rest) = parse::after_prefix(line, "+UUSORD: ") {
            if parse::last_field(rest) == "4294967295" {
                if let Some(socket) = super::socket_from_field(rest) {
                    self.mark_closed(socket);
                }
            }
        }
    }
}

enum ConnectState {
    AwaitCreate,
    AwaitSecure,
    AwaitConnect,
    /// Close command sent after a failed step; surfaces the original error
    /// once the close terminates.
    Cleanup(Error),
}

/// A TCP connection. Also the data face of connections accepted by
/// [`TcpServer`](crate::services::socket::server::TcpServer), via
/// [`TcpClient::attach`].
pub struct TcpClient<'a, 'sub, S, CLK, D, DTR>
where
    CLK: Clock,
{
    modem: &'a Modem<'sub, S, CLK, D, DTR>,
    events: &'sub SocketEvents,
    socket: Option<SocketHandle>,
    secure: bool,
    cache: SocketBuffer,
}

impl<'a, 'sub, S, CLK, D, DTR> TcpClient<'a, 'sub, S, CLK, D, DTR>
where
    CLK: Clock,
{
    /// Registers `events` with the transport. Use one events value per
    /// client; it is unregistered again on drop.
    pub fn new(
        modem: &'a Modem<'sub, S, CLK, D, DTR>,
        events: &'sub SocketEvents,
    ) -> Result<Self, Error> {
        modem.register_urc_handler(events)?;
        Ok(Self {
            modem,
            events,
            socket: None,
            secure: false,
            cache: SocketBuffer::new(),
        })
    }

    /// Like [`TcpClient::new`], but `connect` will enable TLS on the socket
    /// before connecting.
    pub fn new_secure(
        modem: &'a Modem<'sub, S, CLK, D, DTR>,
        events: &'sub SocketEvents,
    ) -> Result<Self, Error> {
        let mut client = Self::new(modem, events)?;
        client.secure = true;
        Ok(client)
    }

    /// Wraps an already-created socket, typically one accepted by a
    /// listener.
    pub fn attach(
        modem: &'a Modem<'sub, S, CLK, D, DTR>,
        events: &'sub SocketEvents,
        socket: SocketHandle,
    ) -> Result<Self, Error> {
        let mut client = Self::new(modem, events)?;
        events.clear(socket);
        client.socket = Some(socket);
        Ok(client)
    }

    pub fn socket(&self) -> Option<SocketHandle> {
        self.socket
    }
}

impl<'a, 'sub, S, CLK, D, DTR> Drop for TcpClient<'a, 'sub, S, CLK, D, DTR>
where
    CLK: Clock,
{
    fn drop(&mut self) {
        self.modem.unregister_urc_handler(self.events);
    }
}

impl<'a, 'sub, S, CLK, D, DTR> TcpClient<'a, 'sub, S, CLK, D, DTR>
where
    S: Read + Write + ReadReady,
    CLK: Clock,
    Generic<CLK::T>: TryInto<Milliseconds>,
    D: DelayNs,
    DTR: OutputPin,
{
    /// Creates a socket and connects it, all within `timeout`.
    ///
    /// A failure after socket creation closes the socket again before the
    /// original error is returned, so a failed connect never leaks a
    /// module-side socket.
    pub fn connect(&mut self, host: &str, port: u16, timeout: Milliseconds) -> Result<(), Error> {
        if self.socket.is_some() {
            self.stop()?;
        }
        self.cache.reset();

        self.modem.capture_response();
        self.modem.send("AT+USOCR=6")?;
        let mut state = ConnectState::AwaitCreate;

        let modem = self.modem;
        let result = modem.spin(timeout, SERVICE_POLL_MS, || {
            self.connect_step(&mut state, host, port)
        });
        if let Err(e) = result {
            self.socket = None;
            self.cache.reset();
            return Err(e);
        }
        Ok(())
    }

    fn connect_step(
        &mut self,
        state: &mut ConnectState,
        host: &str,
        port: u16,
    ) -> nb::Result<(), Error> {
        let code = self.modem.ready()?;
        match *state {
            ConnectState::AwaitCreate => {
                code.check()?;
                let mut reply: String<32> = String::new();
                if !self.modem.take_response(&mut reply)
                    || parse::after_prefix(reply.as_str(), "+USOCR: ").is_none()
                {
                    return Err(nb::Error::Other(Error::InvalidResponse));
                }
                let id = parse::last_digit(reply.as_str()).ok_or(Error::InvalidResponse)?;
                if usize::from(id) >= NUM_SOCKETS {
                    return Err(nb::Error::Other(Error::InvalidResponse));
                }
                let handle = SocketHandle(id);
                self.socket = Some(handle);
                self.events.clear(handle);

                if self.secure {
                    self.modem
                        .send_fmt(format_args!("AT+USOSEC={},1", handle.0))?;
                    *state = ConnectState::AwaitSecure;
                } else {
                    self.send_connect(handle, host, port)?;
                    *state = ConnectState::AwaitConnect;
                }
                Err(nb::Error::WouldBlock)
            }
            ConnectState::AwaitSecure => {
                match code.check() {
                    Ok(()) => {
                        let handle = self.socket.ok_or(Error::InvalidSocket)?;
                        self.send_connect(handle, host, port)?;
                        *state = ConnectState::AwaitConnect;
                    }
                    Err(e) => self.start_cleanup(state, e)?,
                }
                Err(nb::Error::WouldBlock)
            }
            ConnectState::AwaitConnect => match code.check() {
                Ok(()) => {
                    if let Some(handle) = self.socket {
                        debug!("socket {} connected", handle.0);
                    }
                    Ok(())
                }
                Err(e) => {
                    self.start_cleanup(state, e)?;
                    Err(nb::Error::WouldBlock)
                }
            },
            ConnectState::Cleanup(err) => {
                self.socket = None;
                self.cache.reset();
                Err(nb::Error::Other(err))
            }
        }
    }

    fn send_connect(&self, socket: SocketHandle, host: &str, port: u16) -> Result<(), Error> {
        self.modem
            .send_fmt(format_args!("AT+USOCO={},\"{}\",{}", socket.0, host, port))
    }

    fn start_cleanup(&mut self, state: &mut ConnectState, err: Error) -> Result<(), Error> {
        match self.socket {
            Some(handle) => {
                warn!("connect step failed, closing socket {}", handle.0);
                self.modem
                    .send_fmt(format_args!("AT+USOCL={}", handle.0))?;
                *state = ConnectState::Cleanup(err);
                Ok(())
            }
            None => Err(err),
        }
    }

    /// Whether the handle still refers to a live socket. Polls, so a close
    /// reported by the module is observed here.
    pub fn connected(&mut self) -> Result<bool, Error> {
        self.modem.poll()?;
        self.revalidate();
        Ok(self.socket.is_some())
    }

    /// Sends `data`, split into 512 byte chunks as the module requires.
    pub fn write(&mut self, data: &[u8]) -> Result<usize, Error> {
        self.modem.poll()?;
        self.revalidate();
        let handle = self.socket.ok_or(Error::SocketClosed)?;

        for chunk in data.chunks(SOCKET_BUFFER_LEN) {
            let mut cmd: String<COMMAND_LEN> = String::new();
            write!(&mut cmd, "AT+USOWR={},{},\"", handle.0, chunk.len())
                .map_err(|_| Error::Overflow)?;
            hex::append_hex(&mut cmd, chunk)?;
            cmd.push('"').map_err(|_| Error::Overflow)?;

            self.modem.send(&cmd)?;
            self.modem
                .wait_for_response(Milliseconds(SOCKET_IO_TIMEOUT_MS))?
                .check()?;
        }
        Ok(data.len())
    }

    /// Bytes that can be read without blocking on the link.
    pub fn available(&mut self) -> Result<usize, Error> {
        let handle = self.live_socket()?;
        self.guard(|s| s.cache.available(s.modem, handle))
    }

    pub fn read(&mut self, dest: &mut [u8]) -> Result<usize, Error> {
        let handle = self.live_socket()?;
        self.guard(|s| s.cache.read(s.modem, handle, dest))
    }

    pub fn peek(&mut self) -> Result<Option<u8>, Error> {
        let handle = self.live_socket()?;
        self.guard(|s| s.cache.peek(s.modem, handle))
    }

    /// Closes the socket. A module-side rejection still invalidates the
    /// handle; the socket was unusable either way.
    pub fn stop(&mut self) -> Result<(), Error> {
        if let Some(handle) = self.socket {
            self.modem
                .send_fmt(format_args!("AT+USOCL={}", handle.0))?;
            let code = self
                .modem
                .wait_for_response(Milliseconds(SOCKET_IO_TIMEOUT_MS))?;
            if code != ResponseCode::Ok {
                debug!("close of socket {} rejected", handle.0);
            }
            self.invalidate();
        }
        Ok(())
    }

    fn live_socket(&mut self) -> Result<SocketHandle, Error> {
        self.modem.poll()?;
        self.revalidate();
        self.socket.ok_or(Error::SocketClosed)
    }

    fn guard<T>(
        &mut self,
        op: impl FnOnce(&mut Self) -> Result<T, Error>,
    ) -> Result<T, Error> {
        match op(self) {
            Err(Error::SocketClosed) => {
                self.invalidate();
                Err(Error::SocketClosed)
            }
            other => other,
        }
    }

    fn revalidate(&mut self) {
        if let Some(handle) = self.socket {
            if self.events.is_closed(handle) {
                debug!("socket {} closed by the module", handle.0);
                self.events.clear(handle);
                self.invalidate();
            }
        }
    }

    fn invalidate(&mut self) {
        self.socket = None;
        self.cache.reset();
    }
}
