//! Per-socket staging buffer for received data.
//!
//! A read command returns up to 512 bytes as quoted hex; decoding once into
//! an owned buffer lets callers consume it byte-wise without another
//! command until the staged data is exhausted. Every socket-owning object
//! embeds its own buffer, which dies (or is reset) with the socket.

use core::convert::TryInto;

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;
use embedded_io::{Read, ReadReady, Write};
use embedded_time::duration::{Generic, Milliseconds};
use embedded_time::Clock;
use heapless::String;

use crate::error::Error;
use crate::hex;
use crate::modem::{Modem, ResponseCode};
use crate::services::parse;
use crate::services::socket::{SocketHandle, SOCKET_IO_TIMEOUT_MS};

/// Largest chunk the module moves per read or write command.
pub(crate) const SOCKET_BUFFER_LEN: usize = 512;

/// A full chunk as hex plus the response prefix fields.
const REPLY_LEN: usize = 2 * SOCKET_BUFFER_LEN + 64;

pub(crate) struct SocketBuffer {
    data: [u8; SOCKET_BUFFER_LEN],
    head: usize,
    len: usize,
}

impl SocketBuffer {
    pub const fn new() -> Self {
        Self {
            data: [0; SOCKET_BUFFER_LEN],
            head: 0,
            len: 0,
        }
    }

    /// Discards staged data. Called whenever the socket stops being usable.
    pub fn reset(&mut self) {
        self.head = 0;
        self.len = 0;
    }

    pub fn cached(&self) -> usize {
        self.len - self.head
    }

    /// Decodes `hex` into the staging area, replacing any previous content.
    pub fn store_hex(&mut self, hex: &str) -> Result<usize, Error> {
        self.head = 0;
        self.len = hex::decode_to_slice(hex, &mut self.data)?;
        Ok(self.len)
    }

    /// Copies staged bytes into `dest` and advances the cursor.
    pub fn take(&mut self, dest: &mut [u8]) -> usize {
        let n = self.cached().min(dest.len());
        dest[..n].copy_from_slice(&self.data[self.head..self.head + n]);
        self.head += n;
        if self.head == self.len {
            self.reset();
        }
        n
    }

    pub fn peek_byte(&self) -> Option<u8> {
        if self.head < self.len {
            Some(self.data[self.head])
        } else {
            None
        }
    }

    /// Staged byte count, fetching a fresh chunk from the module only when
    /// the buffer is empty. A rejected read command means the module no
    /// longer considers the socket usable.
    pub fn available<'sub, S, CLK, D, DTR>(
        &mut self,
        modem: &Modem<'sub, S, CLK, D, DTR>,
        socket: SocketHandle,
    ) -> Result<usize, Error>
    where
        S: Read + Write + ReadReady,
        CLK: Clock,
        Generic<CLK::T>: TryInto<Milliseconds>,
        D: DelayNs,
        DTR: OutputPin,
    {
        if self.cached() > 0 {
            return Ok(self.cached());
        }

        self.reset();
        modem.send_fmt(format_args!(
            "AT+USORD={},{}",
            socket.0, SOCKET_BUFFER_LEN
        ))?;
        let mut reply: String<REPLY_LEN> = String::new();
        let code =
            modem.wait_for_response_into(Milliseconds(SOCKET_IO_TIMEOUT_MS), &mut reply)?;
        if code != ResponseCode::Ok {
            debug!("read on socket {} rejected, treating as closed", socket.0);
            return Err(Error::SocketClosed);
        }

        let rest = match parse::after_prefix(reply.as_str(), "+USORD: ") {
            Some(rest) => rest,
            None => return Ok(0),
        };
        match parse::quoted(rest) {
            Some(hex) => self.store_hex(hex),
            None => Ok(0),
        }
    }

    pub fn read<'sub, S, CLK, D, DTR>(
        &mut self,
        modem: &Modem<'sub, S, CLK, D, DTR>,
        socket: SocketHandle,
        dest: &mut [u8],
    ) -> Result<usize, Error>
    where
        S: Read + Write + ReadReady,
        CLK: Clock,
        Generic<CLK::T>: TryInto<Milliseconds>,
        D: DelayNs,
        DTR: OutputPin,
    {
        self.available(modem, socket)?;
        Ok(self.take(dest))
    }

    pub fn peek<'sub, S, CLK, D, DTR>(
        &mut self,
        modem: &Modem<'sub, S, CLK, D, DTR>,
        socket: SocketHandle,
    ) -> Result<Option<u8>, Error>
    where
        S: Read + Write + ReadReady,
        CLK: Clock,
        Generic<CLK::T>: TryInto<Milliseconds>,
        D: DelayNs,
        DTR: OutputPin,
    {
        self.available(modem, socket)?;
        Ok(self.peek_byte())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::modem;

    #[test]
    fn sub_reads_consume_one_fetch() {
        let m = modem();
        let mut buf = SocketBuffer::new();
        m.serial.expect(
            "AT+USORD=0,512",
            b"\r\n+USORD: 0,4,\"DEADBEEF\"\r\n\r\nOK\r\n",
        );

        assert_eq!(buf.available(&m.modem, SocketHandle(0)).unwrap(), 4);

        let mut dest = [0u8; 2];
        assert_eq!(buf.read(&m.modem, SocketHandle(0), &mut dest).unwrap(), 2);
        assert_eq!(dest, [0xDE, 0xAD]);
        assert_eq!(buf.peek(&m.modem, SocketHandle(0)).unwrap(), Some(0xBE));
        assert_eq!(buf.read(&m.modem, SocketHandle(0), &mut dest).unwrap(), 2);
        assert_eq!(dest, [0xBE, 0xEF]);

        assert_eq!(
            m.serial.written_string().matches("AT+USORD").count(),
            1,
            "sub-reads must not re-issue the read command"
        );

        // Exhausted: the next access fetches exactly once more.
        m.serial
            .expect("AT+USORD=0,512", b"\r\n+USORD: 0,0,\"\"\r\n\r\nOK\r\n");
        assert_eq!(buf.available(&m.modem, SocketHandle(0)).unwrap(), 0);
        assert_eq!(m.serial.written_string().matches("AT+USORD").count(), 2);
    }

    #[test]
    fn rejected_read_maps_to_socket_closed() {
        let m = modem();
        let mut buf = SocketBuffer::new();
        m.serial.expect("AT+USORD=1,512", b"\r\nERROR\r\n");

        assert_eq!(
            buf.available(&m.modem, SocketHandle(1)),
            Err(Error::SocketClosed)
        );
    }

    #[test]
    fn reply_without_read_prefix_counts_as_empty() {
        let m = modem();
        let mut buf = SocketBuffer::new();
        m.serial.expect("AT+USORD=0,512", b"\r\nOK\r\n");

        assert_eq!(buf.available(&m.modem, SocketHandle(0)).unwrap(), 0);
    }

    #[test]
    fn reset_discards_staged_bytes() {
        let mut buf = SocketBuffer::new();
        buf.store_hex("00FF10").unwrap();
        assert_eq!(buf.cached(), 3);
        buf.reset();
        assert_eq!(buf.cached(), 0);
        assert_eq!(buf.peek_byte(), None);
    }
}
