//! Text-mode SMS: sending with the `>` prompt flow, polling unread
//! messages via `AT+CMGL` and deleting by storage index.

use core::convert::TryInto;

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;
use embedded_io::{Read, ReadReady, Write};
use embedded_time::duration::{Generic, Milliseconds};
use embedded_time::Clock;
use heapless::String;

use crate::error::Error;
use crate::modem::Modem;

const PROMPT_TIMEOUT_MS: u32 = 10_000;
const CTRL_Z: u8 = 0x1A;

/// Text-mode SMS access. Messages are read by polling the unread list,
/// the way the module stores them; there is no incoming-message URC in
/// text mode.
pub struct Sms<'a, 'sub, S, CLK, D, DTR>
where
    CLK: Clock,
{
    modem: &'a Modem<'sub, S, CLK, D, DTR>,
}

impl<'a, 'sub, S, CLK, D, DTR> Sms<'a, 'sub, S, CLK, D, DTR>
where
    CLK: Clock,
{
    pub fn new(modem: &'a Modem<'sub, S, CLK, D, DTR>) -> Self {
        Self { modem }
    }
}

impl<'a, 'sub, S, CLK, D, DTR> Sms<'a, 'sub, S, CLK, D, DTR>
where
    S: Read + Write + ReadReady,
    CLK: Clock,
    Generic<CLK::T>: TryInto<Milliseconds>,
    D: DelayNs,
    DTR: OutputPin,
{
    /// Opens an outgoing message to `to` and waits for the module's `>`
    /// payload prompt. Dropping the returned writer without calling
    /// [`OutgoingMessage::end`] leaves the module waiting for payload;
    /// the next command on the channel will fail.
    pub fn begin_message(
        &self,
        to: &str,
    ) -> Result<OutgoingMessage<'a, 'sub, S, CLK, D, DTR>, Error> {
        self.modem.send_fmt(format_args!("AT+CMGS=\"{}\"", to))?;
        self.modem
            .wait_for_prompt(Milliseconds(PROMPT_TIMEOUT_MS))?;
        Ok(OutgoingMessage { modem: self.modem })
    }

    /// Lists unread messages into `storage` and returns an iterator of
    /// borrowed views into it.
    pub fn unread<'s, const N: usize>(
        &self,
        storage: &'s mut String<N>,
        timeout: Milliseconds,
    ) -> Result<Messages<'s>, Error> {
        self.modem.send("AT+CMGL=\"REC UNREAD\"")?;
        self.modem
            .wait_for_response_into(timeout, storage)?
            .check()?;
        Ok(Messages {
            rest: storage.as_str(),
        })
    }

    /// Deletes the message at `index` from module storage. The module can
    /// take tens of seconds for this; size `timeout` accordingly.
    pub fn delete(&self, index: u32, timeout: Milliseconds) -> Result<(), Error> {
        self.modem.send_fmt(format_args!("AT+CMGD={}", index))?;
        self.modem.wait_for_response(timeout)?.check()
    }
}

/// In-flight outgoing message: the module has shown its payload prompt
/// and raw body bytes pass through until Ctrl-Z.
pub struct OutgoingMessage<'a, 'sub, S, CLK, D, DTR>
where
    CLK: Clock,
{
    modem: &'a Modem<'sub, S, CLK, D, DTR>,
}

impl<'a, 'sub, S, CLK, D, DTR> OutgoingMessage<'a, 'sub, S, CLK, D, DTR>
where
    S: Read + Write + ReadReady,
    CLK: Clock,
    Generic<CLK::T>: TryInto<Milliseconds>,
    D: DelayNs,
    DTR: OutputPin,
{
    pub fn write(&self, body: &[u8]) -> Result<(), Error> {
        self.modem.write_bytes(body)
    }

    /// Terminates the body with Ctrl-Z and waits for the send report.
    pub fn end(self, timeout: Milliseconds) -> Result<(), Error> {
        self.modem.write_bytes(&[CTRL_Z])?;
        self.modem.wait_for_response(timeout)?.check()
    }
}

/// One entry of an `AT+CMGL` listing, borrowed from the caller's
/// capture buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message<'s> {
    pub index: u32,
    pub sender: &'s str,
    pub body: &'s str,
}

/// Iterator over `+CMGL:` entries in a listing capture.
pub struct Messages<'s> {
    rest: &'s str,
}

const SENDER_PATTERN: &str = "\"REC UNREAD\",\"";

impl<'s> Iterator for Messages<'s> {
    type Item = Message<'s>;

    fn next(&mut self) -> Option<Self::Item> {
        let rest = self.rest.trim_start().strip_prefix("+CMGL: ")?;
        let (header, after_header) = match rest.split_once('\n') {
            Some(pair) => pair,
            None => (rest, ""),
        };

        let index = header.split(',').next()?.trim().parse().ok()?;
        let tail = &header[header.find(SENDER_PATTERN)? + SENDER_PATTERN.len()..];
        let sender = &tail[..tail.find('"')?];

        let body;
        match after_header.find("\r\n+CMGL: ") {
            Some(end) => {
                body = &after_header[..end];
                self.rest = &after_header[end + 2..];
            }
            None => {
                body = after_header.trim_end();
                self.rest = "";
            }
        }

        Some(Message {
            index,
            sender,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::modem;

    #[test]
    fn sending_goes_through_the_payload_prompt() {
        let m = modem();
        let sms = Sms::new(&m.modem);

        m.serial.expect("AT+CMGS=\"+4512345678\"", b"\r\n> ");
        m.serial
            .expect_raw(b"\x1a", b"\r\n+CMGS: 5\r\n\r\nOK\r\n");

        let message = sms.begin_message("+4512345678").unwrap();
        message.write(b"Hello from the rooftop").unwrap();
        message.end(Milliseconds(30_000u32)).unwrap();

        let written = m.serial.written();
        let body_start = written
            .windows(22)
            .position(|w| w == b"Hello from the rooftop")
            .unwrap();
        assert_eq!(written[body_start + 22], CTRL_Z);
        assert!(m.serial.script_consumed());
    }

    #[test]
    fn unread_listing_yields_each_message() {
        let m = modem();
        let sms = Sms::new(&m.modem);

        m.serial.expect(
            "AT+CMGL=\"REC UNREAD\"",
            b"\r\n+CMGL: 3,\"REC UNREAD\",\"+4512345678\",,\"25/08/20,09:41:00+08\"\r\n\
              First body\r\n\
              +CMGL: 7,\"REC UNREAD\",\"+4587654321\",,\"25/08/20,09:55:10+08\"\r\n\
              Second body line one\r\nand two\r\n\
              \r\nOK\r\n",
        );

        let mut storage: String<512> = String::new();
        let mut unread = sms.unread(&mut storage, Milliseconds(5_000u32)).unwrap();

        let first = unread.next().unwrap();
        assert_eq!(first.index, 3);
        assert_eq!(first.sender, "+4512345678");
        assert_eq!(first.body, "First body");

        let second = unread.next().unwrap();
        assert_eq!(second.index, 7);
        assert_eq!(second.sender, "+4587654321");
        assert_eq!(second.body, "Second body line one\r\nand two");

        assert!(unread.next().is_none());
    }

    #[test]
    fn an_empty_listing_yields_nothing() {
        let m = modem();
        let sms = Sms::new(&m.modem);

        m.serial.expect("AT+CMGL=\"REC UNREAD\"", b"\r\nOK\r\n");

        let mut storage: String<512> = String::new();
        let mut unread = sms.unread(&mut storage, Milliseconds(5_000u32)).unwrap();
        assert!(unread.next().is_none());
    }

    #[test]
    fn delete_targets_the_storage_index() {
        let m = modem();
        let sms = Sms::new(&m.modem);

        m.serial.expect("AT+CMGD=3", b"\r\nOK\r\n");
        sms.delete(3, Milliseconds(55_000u32)).unwrap();
        assert!(m.serial.script_consumed());
    }
}
