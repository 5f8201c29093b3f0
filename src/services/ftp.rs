//! FTP client over the module's embedded stack.
//!
//! Session parameters go through chained `AT+UFTP` writes; every file
//! operation is then a single `AT+UFTPC=<op>` whose outcome arrives later
//! as a `+UUFTPCR: <op>,<result>` URC. Directory listings additionally
//! stream their lines after a `+UUFTPCD: 13,` header.

use core::cell::{Cell, RefCell};
use core::convert::TryInto;
use core::fmt;

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;
use embedded_io::{Read, ReadReady, Write};
use embedded_time::duration::{Generic, Milliseconds};
use embedded_time::Clock;
use heapless::String;

use crate::error::Error;
use crate::modem::{Modem, UrcHandler};
use crate::services::parse;
use crate::state::{UrcFlag, UrcOperation, SERVICE_POLL_MS};

const SETUP_TIMEOUT_MS: u32 = 1_000;
const LISTING_LEN: usize = 1024;

const OP_DISCONNECT: u8 = 0;
const OP_CONNECT: u8 = 1;
const OP_REMOVE: u8 = 2;
const OP_RENAME: u8 = 3;
const OP_DOWNLOAD: u8 = 4;
const OP_UPLOAD: u8 = 5;
const OP_CHANGE_DIR: u8 = 8;
const OP_MAKE_DIR: u8 = 10;
const OP_REMOVE_DIR: u8 = 11;
const OP_LIST: u8 = 13;

/// URC state shared between the modem dispatcher and an [`FtpClient`].
#[derive(Default)]
pub struct FtpEvents {
    flag: Cell<UrcFlag>,
    expected: Cell<u8>,
    listing: RefCell<String<LISTING_LEN>>,
    collecting: Cell<bool>,
}

impl FtpEvents {
    pub fn new() -> Self {
        Self::default()
    }
}

impl UrcHandler for FtpEvents {
    fn handle_urc(&self, line: &str) {
        if let Some(rest) = parse::after_prefix(line, "+UUFTPCR: ") {
            let (op, result) = match rest.split_once(',') {
                Some(pair) => pair,
                None => return,
            };
            if op.trim().parse() != Ok(self.expected.get()) {
                return;
            }
            self.flag.set(if result.trim() == "1" {
                UrcFlag::Succeeded
            } else {
                UrcFlag::Failed
            });
        } else if let Some(rest) = parse::after_prefix(line, "+UUFTPCD: 13,") {
            // The first listing entry rides on the header line after the
            // opening quote; the stream closes with a lone quote line.
            let mut listing = self.listing.borrow_mut();
            listing.clear();
            match rest.find('"') {
                Some(quote) => {
                    self.collecting.set(true);
                    let entry = &rest[quote + 1..];
                    if !entry.is_empty() {
                        push_entry(&mut listing, entry);
                    }
                }
                None => self.collecting.set(false),
            }
        } else if self.collecting.get() {
            if line.trim() == "\"" {
                self.collecting.set(false);
            } else {
                push_entry(&mut self.listing.borrow_mut(), line);
            }
        }
    }
}

fn push_entry(listing: &mut String<LISTING_LEN>, entry: &str) {
    if listing.push_str(entry).is_err() || listing.push('\n').is_err() {
        warn!("FTP listing truncated at {} bytes", LISTING_LEN);
    }
}

/// FTP session driver. One session per modem; operations run one at a
/// time over the shared command channel.
pub struct FtpClient<'a, 'sub, S, CLK, D, DTR>
where
    CLK: Clock,
{
    modem: &'a Modem<'sub, S, CLK, D, DTR>,
    events: &'sub FtpEvents,
    connected: bool,
}

impl<'a, 'sub, S, CLK, D, DTR> FtpClient<'a, 'sub, S, CLK, D, DTR>
where
    CLK: Clock,
{
    pub fn new(
        modem: &'a Modem<'sub, S, CLK, D, DTR>,
        events: &'sub FtpEvents,
    ) -> Result<Self, Error> {
        modem.register_urc_handler(events)?;
        Ok(Self {
            modem,
            events,
            connected: false,
        })
    }

    pub fn connected(&self) -> bool {
        self.connected
    }
}

impl<'a, 'sub, S, CLK, D, DTR> Drop for FtpClient<'a, 'sub, S, CLK, D, DTR>
where
    CLK: Clock,
{
    fn drop(&mut self) {
        self.modem.unregister_urc_handler(self.events);
    }
}

impl<'a, 'sub, S, CLK, D, DTR> FtpClient<'a, 'sub, S, CLK, D, DTR>
where
    S: Read + Write + ReadReady,
    CLK: Clock,
    Generic<CLK::T>: TryInto<Milliseconds>,
    D: DelayNs,
    DTR: OutputPin,
{
    /// Opens a session: host, credentials and passive mode, then the
    /// login operation. Login is re-issued on a failed completion until
    /// `timeout` runs out.
    pub fn connect(
        &mut self,
        host: &str,
        user: &str,
        password: &str,
        timeout: Milliseconds,
    ) -> Result<(), Error> {
        self.setting(format_args!("AT+UFTP=1,\"{}\"", host))?;
        self.setting(format_args!("AT+UFTP=2,\"{}\"", user))?;
        self.setting(format_args!("AT+UFTP=3,\"{}\"", password))?;
        self.setting(format_args!("AT+UFTP=6,0"))?;
        self.operation(OP_CONNECT, true, timeout, format_args!("AT+UFTPC=1"))?;
        self.connected = true;
        info!("FTP session open");
        Ok(())
    }

    pub fn disconnect(&mut self, timeout: Milliseconds) -> Result<(), Error> {
        self.operation(OP_DISCONNECT, true, timeout, format_args!("AT+UFTPC=0"))?;
        self.connected = false;
        Ok(())
    }

    pub fn remove(&self, name: &str, timeout: Milliseconds) -> Result<(), Error> {
        self.operation(
            OP_REMOVE,
            false,
            timeout,
            format_args!("AT+UFTPC=2,\"{}\"", name),
        )
    }

    pub fn rename(&self, from: &str, to: &str, timeout: Milliseconds) -> Result<(), Error> {
        self.operation(
            OP_RENAME,
            false,
            timeout,
            format_args!("AT+UFTPC=3,\"{}\",\"{}\"", from, to),
        )
    }

    /// Fetches `remote` into the module file system as `local`. Failed
    /// transfers are re-issued until `timeout` runs out.
    pub fn download(&self, remote: &str, local: &str, timeout: Milliseconds) -> Result<(), Error> {
        self.operation(
            OP_DOWNLOAD,
            true,
            timeout,
            format_args!("AT+UFTPC=4,\"{}\",\"{}\"", remote, local),
        )
    }

    /// Sends the module file `local` to the server as `remote`. Failed
    /// transfers are re-issued until `timeout` runs out.
    pub fn upload(&self, local: &str, remote: &str, timeout: Milliseconds) -> Result<(), Error> {
        self.operation(
            OP_UPLOAD,
            true,
            timeout,
            format_args!("AT+UFTPC=5,\"{}\",\"{}\"", local, remote),
        )
    }

    pub fn cd(&self, name: &str, timeout: Milliseconds) -> Result<(), Error> {
        self.operation(
            OP_CHANGE_DIR,
            false,
            timeout,
            format_args!("AT+UFTPC=8,\"{}\"", name),
        )
    }

    pub fn mkdir(&self, name: &str, timeout: Milliseconds) -> Result<(), Error> {
        self.operation(
            OP_MAKE_DIR,
            false,
            timeout,
            format_args!("AT+UFTPC=10,\"{}\"", name),
        )
    }

    pub fn rmdir(&self, name: &str, timeout: Milliseconds) -> Result<(), Error> {
        self.operation(
            OP_REMOVE_DIR,
            false,
            timeout,
            format_args!("AT+UFTPC=11,\"{}\"", name),
        )
    }

    /// Lists the working directory into `out`, one entry per line.
    pub fn ls<const N: usize>(
        &self,
        out: &mut String<N>,
        timeout: Milliseconds,
    ) -> Result<(), Error> {
        self.events.listing.borrow_mut().clear();
        self.events.collecting.set(false);
        self.operation(OP_LIST, false, timeout, format_args!("AT+UFTPC=13"))?;
        out.clear();
        out.push_str(self.events.listing.borrow().as_str())
            .map_err(|_| Error::Overflow)
    }

    fn setting(&self, command: fmt::Arguments<'_>) -> Result<(), Error> {
        self.modem.send_fmt(command)?;
        self.modem
            .wait_for_response(Milliseconds(SETUP_TIMEOUT_MS))?
            .check()
    }

    fn operation(
        &self,
        op: u8,
        retry: bool,
        timeout: Milliseconds,
        command: fmt::Arguments<'_>,
    ) -> Result<(), Error> {
        self.events.expected.set(op);
        let mut operation = if retry {
            UrcOperation::with_retry()
        } else {
            UrcOperation::new()
        };
        let modem = self.modem;
        let outcome = modem.spin(timeout, SERVICE_POLL_MS, || {
            operation.advance(modem, &self.events.flag, || modem.send_fmt(command))
        })?;
        match outcome {
            UrcFlag::Succeeded => Ok(()),
            _ => Err(Error::Command),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::modem;

    const TIMEOUT: Milliseconds = Milliseconds(30_000u32);

    #[test]
    fn connect_opens_a_session_and_disconnect_closes_it() {
        let events = FtpEvents::new();
        let m = modem();
        let mut ftp = FtpClient::new(&m.modem, &events).unwrap();

        m.serial
            .expect("AT+UFTP=1,\"ftp.example.com\"", b"\r\nOK\r\n");
        m.serial.expect("AT+UFTP=2,\"anonymous\"", b"\r\nOK\r\n");
        m.serial.expect("AT+UFTP=3,\"guest\"", b"\r\nOK\r\n");
        m.serial.expect("AT+UFTP=6,0", b"\r\nOK\r\n");
        m.serial
            .expect("AT+UFTPC=1", b"\r\nOK\r\n+UUFTPCR: 1,1\r\n");

        ftp.connect("ftp.example.com", "anonymous", "guest", TIMEOUT)
            .unwrap();
        assert!(ftp.connected());

        m.serial
            .expect("AT+UFTPC=0", b"\r\nOK\r\n+UUFTPCR: 0,1\r\n");
        ftp.disconnect(TIMEOUT).unwrap();
        assert!(!ftp.connected());
        assert!(m.serial.script_consumed());
    }

    #[test]
    fn download_is_retried_after_a_failed_transfer() {
        let events = FtpEvents::new();
        let m = modem();
        let ftp = FtpClient::new(&m.modem, &events).unwrap();

        m.serial.expect(
            "AT+UFTPC=4,\"remote.bin\",\"local.bin\"",
            b"\r\nOK\r\n+UUFTPCR: 4,0\r\n",
        );
        m.serial.expect(
            "AT+UFTPC=4,\"remote.bin\",\"local.bin\"",
            b"\r\nOK\r\n+UUFTPCR: 4,1\r\n",
        );

        ftp.download("remote.bin", "local.bin", TIMEOUT).unwrap();
        assert_eq!(m.serial.written_string().matches("AT+UFTPC=4").count(), 2);
    }

    #[test]
    fn a_failed_directory_create_surfaces_an_error() {
        let events = FtpEvents::new();
        let m = modem();
        let ftp = FtpClient::new(&m.modem, &events).unwrap();

        m.serial
            .expect("AT+UFTPC=10,\"logs\"", b"\r\nOK\r\n+UUFTPCR: 10,0\r\n");

        assert_eq!(ftp.mkdir("logs", TIMEOUT), Err(Error::Command));
    }

    #[test]
    fn completion_reports_for_other_operations_are_ignored() {
        let events = FtpEvents::new();
        let m = modem();
        let ftp = FtpClient::new(&m.modem, &events).unwrap();

        // A stale download completion must not satisfy the remove.
        m.serial.expect(
            "AT+UFTPC=2,\"old.txt\"",
            b"\r\nOK\r\n+UUFTPCR: 4,1\r\n+UUFTPCR: 2,1\r\n",
        );

        ftp.remove("old.txt", TIMEOUT).unwrap();
    }

    #[test]
    fn ls_collects_a_multi_line_listing() {
        let events = FtpEvents::new();
        let m = modem();
        let ftp = FtpClient::new(&m.modem, &events).unwrap();

        m.serial.expect(
            "AT+UFTPC=13",
            b"\r\nOK\r\n\
              +UUFTPCD: 13,80,\"drw-r--r-- 1 user group 0 Jan 1 data\r\n\
              -rw-r--r-- 1 user group 42 Jan 2 notes.txt\r\n\
              \"\r\n\
              +UUFTPCR: 13,1\r\n",
        );

        let mut listing: String<256> = String::new();
        ftp.ls(&mut listing, TIMEOUT).unwrap();
        assert_eq!(
            listing.as_str(),
            "drw-r--r-- 1 user group 0 Jan 1 data\n-rw-r--r-- 1 user group 42 Jan 2 notes.txt\n"
        );
    }
}
