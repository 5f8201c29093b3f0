//! Device and SIM identity queries.

use core::convert::TryInto;

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;
use embedded_io::{Read, ReadReady, Write};
use embedded_time::duration::{Generic, Milliseconds};
use embedded_time::Clock;
use heapless::String;

use crate::error::Error;
use crate::modem::Modem;
use crate::services::parse;

const QUERY_TIMEOUT_MS: u32 = 1_000;
const OPERATOR_TIMEOUT_MS: u32 = 10_000;

pub struct ModemInfo<'a, 'sub, S, CLK, D, DTR>
where
    CLK: Clock,
{
    modem: &'a Modem<'sub, S, CLK, D, DTR>,
}

impl<'a, 'sub, S, CLK, D, DTR> ModemInfo<'a, 'sub, S, CLK, D, DTR>
where
    CLK: Clock,
{
    pub fn new(modem: &'a Modem<'sub, S, CLK, D, DTR>) -> Self {
        Self { modem }
    }
}

impl<'a, 'sub, S, CLK, D, DTR> ModemInfo<'a, 'sub, S, CLK, D, DTR>
where
    S: Read + Write + ReadReady,
    CLK: Clock,
    Generic<CLK::T>: TryInto<Milliseconds>,
    D: DelayNs,
    DTR: OutputPin,
{
    /// Module serial number, reported as a bare line.
    pub fn imei<const N: usize>(&self, out: &mut String<N>) -> Result<(), Error> {
        self.modem.send("AT+CGSN")?;
        self.modem
            .wait_for_response_into(Milliseconds(QUERY_TIMEOUT_MS), out)?
            .check()
    }

    /// SIM card identifier.
    pub fn iccid<const N: usize>(&self, out: &mut String<N>) -> Result<(), Error> {
        self.modem.send("AT+CCID")?;
        let mut reply: String<40> = String::new();
        self.modem
            .wait_for_response_into(Milliseconds(QUERY_TIMEOUT_MS), &mut reply)?
            .check()?;
        let iccid = parse::after_prefix(reply.as_str(), "+CCID: ").unwrap_or(reply.as_str());
        out.clear();
        out.push_str(iccid).map_err(|_| Error::Overflow)
    }

    /// Received signal strength indication, 0..=31 or 99 when unknown.
    pub fn signal_strength(&self) -> Result<u8, Error> {
        self.modem.send("AT+CSQ")?;
        let mut reply: String<32> = String::new();
        self.modem
            .wait_for_response_into(Milliseconds(QUERY_TIMEOUT_MS), &mut reply)?
            .check()?;
        parse::after_prefix(reply.as_str(), "+CSQ: ")
            .map(parse::first_field)
            .and_then(|rssi| rssi.trim().parse().ok())
            .ok_or(Error::InvalidResponse)
    }

    /// Name of the currently selected operator.
    pub fn operator_name<const N: usize>(&self, out: &mut String<N>) -> Result<(), Error> {
        self.modem.send("AT+COPS?")?;
        let mut reply: String<64> = String::new();
        self.modem
            .wait_for_response_into(Milliseconds(OPERATOR_TIMEOUT_MS), &mut reply)?
            .check()?;
        let name = parse::quoted(reply.as_str()).ok_or(Error::InvalidResponse)?;
        out.clear();
        out.push_str(name).map_err(|_| Error::Overflow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::modem;

    #[test]
    fn imei_is_the_bare_response_line() {
        let m = modem();
        let info = ModemInfo::new(&m.modem);

        m.serial.expect("AT+CGSN", b"\r\n004999010640000\r\n\r\nOK\r\n");

        let mut imei: String<16> = String::new();
        info.imei(&mut imei).unwrap();
        assert_eq!(imei.as_str(), "004999010640000");
    }

    #[test]
    fn iccid_strips_the_prefix_when_present() {
        let m = modem();
        let info = ModemInfo::new(&m.modem);

        m.serial
            .expect("AT+CCID", b"\r\n+CCID: 8931080019073874397\r\n\r\nOK\r\n");

        let mut iccid: String<24> = String::new();
        info.iccid(&mut iccid).unwrap();
        assert_eq!(iccid.as_str(), "8931080019073874397");
    }

    #[test]
    fn signal_strength_is_the_first_csq_field() {
        let m = modem();
        let info = ModemInfo::new(&m.modem);

        m.serial.expect("AT+CSQ", b"\r\n+CSQ: 17,99\r\n\r\nOK\r\n");
        assert_eq!(info.signal_strength().unwrap(), 17);
    }

    #[test]
    fn operator_name_is_the_quoted_cops_field() {
        let m = modem();
        let info = ModemInfo::new(&m.modem);

        m.serial
            .expect("AT+COPS?", b"\r\n+COPS: 0,0,\"TDC DK\"\r\n\r\nOK\r\n");

        let mut name: String<32> = String::new();
        info.operator_name(&mut name).unwrap();
        assert_eq!(name.as_str(), "TDC DK");
    }
}
