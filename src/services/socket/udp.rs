//! UDP over a module socket: staged outgoing packets, one staged incoming
//! datagram.

use core::convert::TryInto;
use core::fmt::Write as _;
use core::str::FromStr;

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;
use embedded_io::{Read, ReadReady, Write};
use embedded_time::duration::{Generic, Milliseconds};
use embedded_time::Clock;
use heapless::{String, Vec};
use no_std_net::IpAddr;

use crate::error::Error;
use crate::hex;
use crate::modem::{Modem, ResponseCode, COMMAND_LEN};
use crate::services::parse;
use crate::services::socket::buffer::{SocketBuffer, SOCKET_BUFFER_LEN};
use crate::services::socket::tcp::SocketEvents;
use crate::services::socket::{SocketHandle, NUM_SOCKETS, SOCKET_IO_TIMEOUT_MS};

const HOST_LEN: usize = 64;
const RECV_REPLY_LEN: usize = 2 * SOCKET_BUFFER_LEN + 96;

/// Connectionless socket. Outgoing data is staged between `begin_packet`
/// and `end_packet`; `parse_packet` stages one received datagram for
/// byte-wise consumption.
pub struct UdpSocket<'a, 'sub, S, CLK, D, DTR>
where
    CLK: Clock,
{
    modem: &'a Modem<'sub, S, CLK, D, DTR>,
    events: &'sub SocketEvents,
    socket: Option<SocketHandle>,
    tx_target: Option<(String<HOST_LEN>, u16)>,
    tx: Vec<u8, SOCKET_BUFFER_LEN>,
    rx: SocketBuffer,
    remote_ip: Option<IpAddr>,
    remote_port: Option<u16>,
}

impl<'a, 'sub, S, CLK, D, DTR> UdpSocket<'a, 'sub, S, CLK, D, DTR>
where
    CLK: Clock,
{
    /// Registers `events` with the transport; one events value per socket.
    pub fn new(
        modem: &'a Modem<'sub, S, CLK, D, DTR>,
        events: &'sub SocketEvents,
    ) -> Result<Self, Error> {
        modem.register_urc_handler(events)?;
        Ok(Self {
            modem,
            events,
            socket: None,
            tx_target: None,
            tx: Vec::new(),
            rx: SocketBuffer::new(),
            remote_ip: None,
            remote_port: None,
        })
    }

    pub fn socket(&self) -> Option<SocketHandle> {
        self.socket
    }

    /// Sender address of the currently staged datagram.
    pub fn remote_ip(&self) -> Option<IpAddr> {
        self.remote_ip
    }

    pub fn remote_port(&self) -> Option<u16> {
        self.remote_port
    }

    /// Staged incoming bytes not yet read.
    pub fn available(&self) -> usize {
        self.rx.cached()
    }

    pub fn read(&mut self, dest: &mut [u8]) -> usize {
        self.rx.take(dest)
    }

    pub fn peek(&self) -> Option<u8> {
        self.rx.peek_byte()
    }
}

impl<'a, 'sub, S, CLK, D, DTR> Drop for UdpSocket<'a, 'sub, S, CLK, D, DTR>
where
    CLK: Clock,
{
    fn drop(&mut self) {
        self.modem.unregister_urc_handler(self.events);
    }
}

impl<'a, 'sub, S, CLK, D, DTR> UdpSocket<'a, 'sub, S, CLK, D, DTR>
where
    S: Read + Write + ReadReady,
    CLK: Clock,
    Generic<CLK::T>: TryInto<Milliseconds>,
    D: DelayNs,
    DTR: OutputPin,
{
    /// Creates the socket and binds the local `port` for receiving.
    /// `timeout` bounds each of the two commands.
    pub fn begin(&mut self, port: u16, timeout: Milliseconds) -> Result<(), Error> {
        self.modem.capture_response();
        self.modem.send("AT+USOCR=17")?;
        self.modem.wait_for_response(timeout)?.check()?;

        let mut reply: String<32> = String::new();
        if !self.modem.take_response(&mut reply)
            || parse::after_prefix(reply.as_str(), "+USOCR: ").is_none()
        {
            return Err(Error::InvalidResponse);
        }
        let id = parse::last_digit(reply.as_str()).ok_or(Error::InvalidResponse)?;
        if usize::from(id) >= NUM_SOCKETS {
            return Err(Error::InvalidResponse);
        }
        let handle = SocketHandle(id);
        self.socket = Some(handle);
        self.events.clear(handle);

        self.modem
            .send_fmt(format_args!("AT+USOLI={},{}", handle.0, port))?;
        match self.modem.wait_for_response(timeout)?.check() {
            Ok(()) => Ok(()),
            Err(e) => {
                self.modem
                    .send_fmt(format_args!("AT+USOCL={}", handle.0))?;
                self.modem.wait_for_response(timeout).ok();
                self.invalidate();
                Err(e)
            }
        }
    }

    /// Stages an outgoing datagram to `host:port`; bytes follow via
    /// [`UdpSocket::write`].
    pub fn begin_packet(&mut self, host: &str, port: u16) -> Result<(), Error> {
        self.socket.ok_or(Error::SocketClosed)?;
        let mut target: String<HOST_LEN> = String::new();
        target.push_str(host).map_err(|_| Error::Overflow)?;
        self.tx_target = Some((target, port));
        self.tx.clear();
        Ok(())
    }

    /// Appends to the staged datagram. A datagram is limited to one module
    /// chunk (512 bytes).
    pub fn write(&mut self, data: &[u8]) -> Result<usize, Error> {
        self.tx
            .extend_from_slice(data)
            .map_err(|()| Error::Overflow)?;
        Ok(data.len())
    }

    /// Sends the staged datagram.
    pub fn end_packet(&mut self) -> Result<(), Error> {
        let handle = self.socket.ok_or(Error::SocketClosed)?;
        let (host, port) = self.tx_target.as_ref().ok_or(Error::InvalidSocket)?;

        let mut cmd: String<COMMAND_LEN> = String::new();
        write!(
            &mut cmd,
            "AT+USOST={},\"{}\",{},{},\"",
            handle.0,
            host.as_str(),
            port,
            self.tx.len()
        )
        .map_err(|_| Error::Overflow)?;
        hex::append_hex(&mut cmd, &self.tx)?;
        cmd.push('"').map_err(|_| Error::Overflow)?;

        self.modem.send(&cmd)?;
        self.tx.clear();
        self.modem
            .wait_for_response(Milliseconds(SOCKET_IO_TIMEOUT_MS))?
            .check()
    }

    /// Fetches the next received datagram into the staging buffer,
    /// replacing any unread remainder of the previous one. Returns its
    /// size, 0 when nothing is waiting.
    pub fn parse_packet(&mut self) -> Result<usize, Error> {
        self.modem.poll()?;
        self.revalidate();
        let handle = self.socket.ok_or(Error::SocketClosed)?;

        self.rx.reset();
        self.remote_ip = None;
        self.remote_port = None;

        self.modem.send_fmt(format_args!(
            "AT+USORF={},{}",
            handle.0, SOCKET_BUFFER_LEN
        ))?;
        let mut reply: String<RECV_REPLY_LEN> = String::new();
        let code = self
            .modem
            .wait_for_response_into(Milliseconds(SOCKET_IO_TIMEOUT_MS), &mut reply)?;
        if code != ResponseCode::Ok {
            self.invalidate();
            return Err(Error::SocketClosed);
        }

        let rest = match parse::after_prefix(reply.as_str(), "+USORF: ") {
            Some(rest) => rest,
            None => return Ok(0),
        };

        // <id>,"<ip>",<port>,<len>,"<hex>"
        let mut fields = rest.split(',');
        let _id = fields.next();
        let ip = fields.next().map(|f| f.trim_matches('"'));
        let port = fields.next().and_then(|f| f.trim().parse::<u16>().ok());
        let len = fields.next().and_then(|f| f.trim().parse::<usize>().ok());
        let (ip, port) = match (ip, port, len) {
            (Some(ip), Some(port), Some(len)) if len > 0 => (ip, port),
            _ => return Ok(0),
        };
        let hex = parse::last_quoted(rest).ok_or(Error::InvalidResponse)?;

        self.remote_ip = Some(IpAddr::from_str(ip).map_err(|_| Error::InvalidResponse)?);
        self.remote_port = Some(port);
        self.rx.store_hex(hex)
    }

    /// Closes the socket.
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

    fn revalidate(&mut self) {
        if let Some(handle) = self.socket {
            if self.events.is_closed(handle) {
                self.events.clear(handle);
                self.invalidate();
            }
        }
    }

    fn invalidate(&mut self) {
        self.socket = None;
        self.tx_target = None;
        self.tx.clear();
        self.rx.reset();
    }
}
