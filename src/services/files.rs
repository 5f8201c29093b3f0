//! Module flash file system. Payloads are stored hex-encoded, two digits
//! per byte, so binary data survives the text-mode AT channel; sizes
//! reported by the module are the stored length, twice the payload.

use core::convert::TryInto;

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;
use embedded_io::{Read, ReadReady, Write};
use embedded_time::duration::{Generic, Milliseconds};
use embedded_time::Clock;
use heapless::String;

use crate::error::Error;
use crate::hex;
use crate::modem::Modem;
use crate::services::parse;

const PROMPT_TIMEOUT_MS: u32 = 20_000;
const IO_TIMEOUT_MS: u32 = 10_000;
const QUERY_TIMEOUT_MS: u32 = 1_000;
const LIST_TIMEOUT_MS: u32 = 5_000;

/// Payload bytes a single read can return.
const READ_LEN: usize = 512;
const READ_REPLY_LEN: usize = 2 * READ_LEN + 96;
const HEX_CHUNK_LEN: usize = 64;

pub struct FileSystem<'a, 'sub, S, CLK, D, DTR>
where
    CLK: Clock,
{
    modem: &'a Modem<'sub, S, CLK, D, DTR>,
}

impl<'a, 'sub, S, CLK, D, DTR> FileSystem<'a, 'sub, S, CLK, D, DTR>
where
    CLK: Clock,
{
    pub fn new(modem: &'a Modem<'sub, S, CLK, D, DTR>) -> Self {
        Self { modem }
    }
}

impl<'a, 'sub, S, CLK, D, DTR> FileSystem<'a, 'sub, S, CLK, D, DTR>
where
    S: Read + Write + ReadReady,
    CLK: Clock,
    Generic<CLK::T>: TryInto<Milliseconds>,
    D: DelayNs,
    DTR: OutputPin,
{
    /// Stores `data` as `name`, replacing any previous content.
    pub fn write(&self, name: &str, data: &[u8]) -> Result<(), Error> {
        self.modem.send_fmt(format_args!(
            "AT+UDWNFILE=\"{}\",{}",
            name,
            2 * data.len()
        ))?;
        self.modem
            .wait_for_prompt(Milliseconds(PROMPT_TIMEOUT_MS))?;
        for chunk in data.chunks(HEX_CHUNK_LEN / 2) {
            let mut encoded: String<HEX_CHUNK_LEN> = String::new();
            hex::append_hex(&mut encoded, chunk)?;
            self.modem.write_bytes(encoded.as_bytes())?;
        }
        self.modem
            .wait_for_response(Milliseconds(IO_TIMEOUT_MS))?
            .check()
    }

    /// Reads the whole of `name` into `out` and returns the payload
    /// length. Bounded at 512 payload bytes; use
    /// [`FileSystem::read_block`] for anything larger.
    pub fn read(&self, name: &str, out: &mut [u8]) -> Result<usize, Error> {
        self.modem
            .send_fmt(format_args!("AT+URDFILE=\"{}\"", name))?;
        self.decode_reply(out)
    }

    /// Reads up to `out.len()` payload bytes of `name` starting at
    /// `offset`. Offsets and lengths are in payload bytes; the doubling
    /// for the stored layout happens here.
    pub fn read_block(&self, name: &str, offset: usize, out: &mut [u8]) -> Result<usize, Error> {
        let len = out.len().min(READ_LEN);
        self.modem.send_fmt(format_args!(
            "AT+URDBLOCK=\"{}\",{},{}",
            name,
            2 * offset,
            2 * len
        ))?;
        self.decode_reply(out)
    }

    pub fn delete(&self, name: &str) -> Result<(), Error> {
        self.modem
            .send_fmt(format_args!("AT+UDELFILE=\"{}\"", name))?;
        self.modem
            .wait_for_response(Milliseconds(IO_TIMEOUT_MS))?
            .check()
    }

    /// Payload size of `name` in bytes.
    pub fn size(&self, name: &str) -> Result<usize, Error> {
        self.modem
            .send_fmt(format_args!("AT+ULSTFILE=2,\"{}\"", name))?;
        let stored = self.stored_number()?;
        Ok(stored / 2)
    }

    /// Free file system space in bytes, as the module reports it.
    pub fn free_space(&self) -> Result<usize, Error> {
        self.modem.send("AT+ULSTFILE=1")?;
        self.stored_number()
    }

    /// Lists stored file names into `storage` and returns an iterator of
    /// borrowed names.
    pub fn list<'s, const N: usize>(
        &self,
        storage: &'s mut String<N>,
    ) -> Result<FileNames<'s>, Error> {
        self.modem.send("AT+ULSTFILE=0")?;
        self.modem
            .wait_for_response_into(Milliseconds(LIST_TIMEOUT_MS), storage)?
            .check()?;
        Ok(FileNames {
            rest: storage.as_str(),
        })
    }

    fn decode_reply(&self, out: &mut [u8]) -> Result<usize, Error> {
        let mut reply: String<READ_REPLY_LEN> = String::new();
        self.modem
            .wait_for_response_into(Milliseconds(IO_TIMEOUT_MS), &mut reply)?
            .check()?;
        let encoded = parse::last_quoted(reply.as_str()).ok_or(Error::InvalidResponse)?;
        Ok(hex::decode_to_slice(encoded, out)?)
    }

    fn stored_number(&self) -> Result<usize, Error> {
        let mut reply: String<32> = String::new();
        self.modem
            .wait_for_response_into(Milliseconds(QUERY_TIMEOUT_MS), &mut reply)?
            .check()?;
        parse::after_prefix(reply.as_str(), "+ULSTFILE: ")
            .and_then(|n| n.trim().parse().ok())
            .ok_or(Error::InvalidResponse)
    }
}

/// Iterator over the quoted names of an `AT+ULSTFILE=0` listing.
pub struct FileNames<'s> {
    rest: &'s str,
}

impl<'s> Iterator for FileNames<'s> {
    type Item = &'s str;

    fn next(&mut self) -> Option<Self::Item> {
        let start = self.rest.find('"')? + 1;
        let len = self.rest[start..].find('"')?;
        let name = &self.rest[start..start + len];
        self.rest = &self.rest[start + len + 1..];
        Some(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::modem;

    #[test]
    fn write_sends_the_doubled_length_and_hex_payload() {
        let m = modem();
        let files = FileSystem::new(&m.modem);

        m.serial.expect("AT+UDWNFILE=\"app.log\",8", b"\r\n> ");
        m.serial.expect_raw(b"54455354", b"\r\nOK\r\n");

        files.write("app.log", b"TEST").unwrap();
        assert!(m.serial.script_consumed());
    }

    #[test]
    fn read_decodes_the_quoted_hex_payload() {
        let m = modem();
        let files = FileSystem::new(&m.modem);

        m.serial.expect(
            "AT+URDFILE=\"blob.bin\"",
            b"\r\n+URDFILE: \"blob.bin\",8,\"C0FFEE12\"\r\n\r\nOK\r\n",
        );

        let mut out = [0u8; 16];
        let n = files.read("blob.bin", &mut out).unwrap();
        assert_eq!(&out[..n], &[0xc0, 0xff, 0xee, 0x12]);
    }

    #[test]
    fn read_block_doubles_offset_and_length() {
        let m = modem();
        let files = FileSystem::new(&m.modem);

        m.serial.expect(
            "AT+URDBLOCK=\"big.bin\",8,8",
            b"\r\n+URDBLOCK: \"big.bin\",8,\"AABBCCDD\"\r\n\r\nOK\r\n",
        );

        let mut out = [0u8; 4];
        let n = files.read_block("big.bin", 4, &mut out).unwrap();
        assert_eq!(n, 4);
        assert_eq!(out, [0xaa, 0xbb, 0xcc, 0xdd]);
    }

    #[test]
    fn size_is_half_the_stored_length() {
        let m = modem();
        let files = FileSystem::new(&m.modem);

        m.serial
            .expect("AT+ULSTFILE=2,\"blob.bin\"", b"\r\n+ULSTFILE: 8\r\n\r\nOK\r\n");
        assert_eq!(files.size("blob.bin").unwrap(), 4);
    }

    #[test]
    fn free_space_is_reported_unscaled() {
        let m = modem();
        let files = FileSystem::new(&m.modem);

        m.serial
            .expect("AT+ULSTFILE=1", b"\r\n+ULSTFILE: 997920\r\n\r\nOK\r\n");
        assert_eq!(files.free_space().unwrap(), 997920);
    }

    #[test]
    fn list_yields_each_quoted_name() {
        let m = modem();
        let files = FileSystem::new(&m.modem);

        m.serial.expect(
            "AT+ULSTFILE=0",
            b"\r\n+ULSTFILE: \"update.bin\",\"app.log\"\r\n\r\nOK\r\n",
        );

        let mut storage: String<128> = String::new();
        let names: heapless::Vec<&str, 4> = files.list(&mut storage).unwrap().collect();
        assert_eq!(names.as_slice(), &["update.bin", "app.log"]);
    }

    #[test]
    fn delete_names_the_file() {
        let m = modem();
        let files = FileSystem::new(&m.modem);

        m.serial.expect("AT+UDELFILE=\"app.log\"", b"\r\nOK\r\n");
        files.delete("app.log").unwrap();
    }
}
