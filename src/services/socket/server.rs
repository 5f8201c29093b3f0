//! TCP listener: accepts module-side incoming connections.

use core::cell::RefCell;
use core::convert::TryInto;

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;
use embedded_io::{Read, ReadReady, Write};
use embedded_time::duration::{Generic, Milliseconds};
use embedded_time::Clock;
use heapless::{Deque, String};

use crate::error::Error;
use crate::modem::{Modem, UrcHandler};
use crate::services::parse;
use crate::services::socket::{SocketHandle, NUM_SOCKETS};

/// Accepted-but-not-yet-claimed child sockets, in arrival order.
///
/// `+UUSOLI: <id>,…` announces a new connection on a listening socket;
/// `+UUSOCL: <id>` for a still-queued id means the peer went away before
/// [`TcpServer::accept`] got to it.
#[derive(Default)]
pub struct ListenerEvents {
    pending: RefCell<Deque<SocketHandle, NUM_SOCKETS>>,
}

impl ListenerEvents {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, socket: SocketHandle) {
        let mut pending = self.pending.borrow_mut();
        if pending.iter().any(|s| *s == socket) {
            return;
        }
        if pending.push_back(socket).is_err() {
            warn!("accept queue full, dropping socket {}", socket.0);
        }
    }

    fn remove(&self, socket: SocketHandle) {
        let mut pending = self.pending.borrow_mut();
        for _ in 0..pending.len() {
            if let Some(s) = pending.pop_front() {
                if s != socket {
                    // Capacity cannot be exceeded while rotating.
                    pending.push_back(s).ok();
                }
            }
        }
    }

    fn pop(&self) -> Option<SocketHandle> {
        self.pending.borrow_mut().pop_front()
    }
}

impl UrcHandler for ListenerEvents {
    fn handle_urc(&self, line: &str) {
        if let Some(rest) = parse::after_prefix(line, "+UUSOLI: ") {
            if let Some(socket) = super::socket_from_field(rest) {
                self.push(socket);
            }
        } else if let Some(rest) = parse::after_prefix(line, "+UUSOCL: ") {
            if let Some(socket) = super::socket_from_field(rest) {
                self.remove(socket);
            }
        }
    }
}

/// Listening socket. Accepted connections are claimed with
/// [`TcpServer::accept`] and wrapped via
/// [`TcpClient::attach`](crate::services::socket::tcp::TcpClient::attach).
pub struct TcpServer<'a, 'sub, S, CLK, D, DTR>
where
    CLK: Clock,
{
    modem: &'a Modem<'sub, S, CLK, D, DTR>,
    events: &'sub ListenerEvents,
    socket: Option<SocketHandle>,
}

impl<'a, 'sub, S, CLK, D, DTR> TcpServer<'a, 'sub, S, CLK, D, DTR>
where
    CLK: Clock,
{
    pub fn new(
        modem: &'a Modem<'sub, S, CLK, D, DTR>,
        events: &'sub ListenerEvents,
    ) -> Result<Self, Error> {
        modem.register_urc_handler(events)?;
        Ok(Self {
            modem,
            events,
            socket: None,
        })
    }

    pub fn socket(&self) -> Option<SocketHandle> {
        self.socket
    }
}

impl<'a, 'sub, S, CLK, D, DTR> Drop for TcpServer<'a, 'sub, S, CLK, D, DTR>
where
    CLK: Clock,
{
    fn drop(&mut self) {
        self.modem.unregister_urc_handler(self.events);
    }
}

impl<'a, 'sub, S, CLK, D, DTR> TcpServer<'a, 'sub, S, CLK, D, DTR>
where
    S: Read + Write + ReadReady,
    CLK: Clock,
    Generic<CLK::T>: TryInto<Milliseconds>,
    D: DelayNs,
    DTR: OutputPin,
{
    /// Creates a socket and puts it into listening mode on `port`.
    /// `timeout` bounds each of the two commands.
    pub fn begin(&mut self, port: u16, timeout: Milliseconds) -> Result<(), Error> {
        self.modem.capture_response();
        self.modem.send("AT+USOCR=6")?;
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

        self.modem
            .send_fmt(format_args!("AT+USOLI={},{}", handle.0, port))?;
        match self.modem.wait_for_response(timeout)?.check() {
            Ok(()) => {
                info!("listening on port {} (socket {})", port, handle.0);
                Ok(())
            }
            Err(e) => {
                // Do not leak the socket when listen setup fails.
                self.close_listener(timeout);
                Err(e)
            }
        }
    }

    /// Claims the oldest pending connection, or `WouldBlock`.
    pub fn accept(&mut self) -> nb::Result<SocketHandle, Error> {
        self.modem.poll().map_err(nb::Error::Other)?;
        self.events.pop().ok_or(nb::Error::WouldBlock)
    }

    /// Stops listening. Already-accepted connections are unaffected.
    pub fn end(&mut self, timeout: Milliseconds) -> Result<(), Error> {
        if self.socket.is_some() {
            self.close_listener(timeout);
        }
        Ok(())
    }

    fn close_listener(&mut self, timeout: Milliseconds) {
        if let Some(handle) = self.socket.take() {
            if self
                .modem
                .send_fmt(format_args!("AT+USOCL={}", handle.0))
                .and_then(|()| self.modem.wait_for_response(timeout))
                .is_err()
            {
                warn!("failed to close listening socket {}", handle.0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::socket::tcp::{SocketEvents, TcpClient};
    use crate::test_helpers::modem;

    #[test]
    fn begin_listens_and_accept_yields_children_in_order() {
        let events = ListenerEvents::new();
        let m = modem();
        let mut server = TcpServer::new(&m.modem, &events).unwrap();

        m.serial
            .expect("AT+USOCR=6", b"\r\n+USOCR: 0\r\n\r\nOK\r\n");
        m.serial.expect("AT+USOLI=0,80", b"\r\nOK\r\n");
        server.begin(80, Milliseconds(10_000)).unwrap();
        assert_eq!(server.socket(), Some(SocketHandle(0)));

        assert!(matches!(server.accept(), Err(nb::Error::WouldBlock)));

        m.serial
            .feed(b"+UUSOLI: 1,\"152.66.0.1\",47508,0,\"10.0.0.2\",80\r\n");
        m.serial
            .feed(b"+UUSOLI: 2,\"152.66.0.3\",47509,0,\"10.0.0.2\",80\r\n");
        assert_eq!(server.accept(), Ok(SocketHandle(1)));
        assert_eq!(server.accept(), Ok(SocketHandle(2)));
        assert!(matches!(server.accept(), Err(nb::Error::WouldBlock)));
    }

    #[test]
    fn child_closed_before_accept_is_dropped() {
        let events = ListenerEvents::new();
        let m = modem();
        let mut server = TcpServer::new(&m.modem, &events).unwrap();

        m.serial
            .expect("AT+USOCR=6", b"\r\n+USOCR: 0\r\n\r\nOK\r\n");
        m.serial.expect("AT+USOLI=0,8080", b"\r\nOK\r\n");
        server.begin(8080, Milliseconds(10_000)).unwrap();

        m.serial
            .feed(b"+UUSOLI: 3,\"152.66.0.1\",47508,0,\"10.0.0.2\",8080\r\n");
        m.serial.feed(b"+UUSOCL: 3\r\n");
        assert!(matches!(server.accept(), Err(nb::Error::WouldBlock)));
    }

    #[test]
    fn accepted_child_reads_through_an_attached_client() {
        let listener_events = ListenerEvents::new();
        let child_events = SocketEvents::new();
        let m = modem();
        let mut server = TcpServer::new(&m.modem, &listener_events).unwrap();

        m.serial
            .expect("AT+USOCR=6", b"\r\n+USOCR: 0\r\n\r\nOK\r\n");
        m.serial.expect("AT+USOLI=0,80", b"\r\nOK\r\n");
        server.begin(80, Milliseconds(10_000)).unwrap();

        m.serial
            .feed(b"+UUSOLI: 4,\"152.66.0.1\",47508,0,\"10.0.0.2\",80\r\n");
        let child = server.accept().unwrap();

        let mut client = TcpClient::attach(&m.modem, &child_events, child).unwrap();
        m.serial.expect(
            "AT+USORD=4,512",
            b"\r\n+USORD: 4,3,\"484559\"\r\n\r\nOK\r\n",
        );
        let mut dest = [0u8; 8];
        assert_eq!(client.read(&mut dest).unwrap(), 3);
        assert_eq!(&dest[..3], b"HEY");
    }

    #[test]
    fn failed_listen_setup_closes_the_socket() {
        let events = ListenerEvents::new();
        let m = modem();
        let mut server = TcpServer::new(&m.modem, &events).unwrap();

        m.serial
            .expect("AT+USOCR=6", b"\r\n+USOCR: 6\r\n\r\nOK\r\n");
        m.serial.expect("AT+USOLI=6,80", b"\r\nERROR\r\n");
        m.serial.expect("AT+USOCL=6", b"\r\nOK\r\n");

        assert_eq!(server.begin(80, Milliseconds(10_000)), Err(Error::Command));
        assert_eq!(server.socket(), None);
        assert!(m.serial.script_consumed());
    }
}
