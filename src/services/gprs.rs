//! Packet data: GPRS attach, PDP profile activation, DNS and ping.
//!
//! The module keeps one packet-switched data profile (id 0). Attaching
//! configures the profile (APN, credentials, dynamic IP), activates it and
//! verifies the activation flag.

use core::cell::Cell;
use core::convert::TryInto;
use core::str::FromStr;

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;
use embedded_io::{Read, ReadReady, Write};
use embedded_time::duration::{Generic, Milliseconds};
use embedded_time::Clock;
use heapless::String;
use no_std_net::IpAddr;

use crate::error::{Error, PingError};
use crate::modem::{Modem, UrcHandler};
use crate::services::parse;
use crate::state::{UrcFlag, UrcOperation, SERVICE_POLL_MS};

const DNS_TIMEOUT_MS: u32 = 70_000;

/// Ping completion, reported asynchronously.
///
/// `+UUPING: …,<rtt>` carries the round trip in its last field, `-1` for an
/// echo timeout. `+UUPINGER: …,<code>` reports setup failures; code 8 is an
/// unresolvable host.
#[derive(Default)]
pub struct PingEvents {
    flag: Cell<UrcFlag>,
    rtt: Cell<u32>,
    failure: Cell<Option<PingError>>,
}

impl PingEvents {
    pub fn new() -> Self {
        Self::default()
    }
}

impl UrcHandler for PingEvents {
    fn handle_urc(&self, line: &str) {
        if let Some(rest) = parse::after_prefix(line, "+UUPING: ") {
            match parse::last_field(rest).trim().parse::<i32>() {
                Ok(-1) => {
                    self.failure.set(Some(PingError::Timeout));
                    self.flag.set(UrcFlag::Failed);
                }
                Ok(rtt) if rtt >= 0 => {
                    self.rtt.set(rtt as u32);
                    self.flag.set(UrcFlag::Succeeded);
                }
                _ => {
                    self.failure.set(Some(PingError::Failed));
                    self.flag.set(UrcFlag::Failed);
                }
            }
        } else if let Some(rest) = parse::after_prefix(line, "+UUPINGER: ") {
            let failure = match parse::last_field(rest).trim() {
                "8" => PingError::UnknownHost,
                _ => PingError::Failed,
            };
            self.failure.set(Some(failure));
            self.flag.set(UrcFlag::Failed);
        }
    }
}

enum AttachState {
    AwaitAttach,
    AwaitApn,
    AwaitUser,
    AwaitPassword,
    AwaitDynamicIp,
    AwaitActivation,
    AwaitProfileCheck,
}

pub struct Gprs<'a, 'sub, S, CLK, D, DTR>
where
    CLK: Clock,
{
    modem: &'a Modem<'sub, S, CLK, D, DTR>,
    events: &'sub PingEvents,
}

impl<'a, 'sub, S, CLK, D, DTR> Gprs<'a, 'sub, S, CLK, D, DTR>
where
    CLK: Clock,
{
    pub fn new(
        modem: &'a Modem<'sub, S, CLK, D, DTR>,
        events: &'sub PingEvents,
    ) -> Result<Self, Error> {
        modem.register_urc_handler(events)?;
        Ok(Self { modem, events })
    }
}

impl<'a, 'sub, S, CLK, D, DTR> Drop for Gprs<'a, 'sub, S, CLK, D, DTR>
where
    CLK: Clock,
{
    fn drop(&mut self) {
        self.modem.unregister_urc_handler(self.events);
    }
}

impl<'a, 'sub, S, CLK, D, DTR> Gprs<'a, 'sub, S, CLK, D, DTR>
where
    S: Read + Write + ReadReady,
    CLK: Clock,
    Generic<CLK::T>: TryInto<Milliseconds>,
    D: DelayNs,
    DTR: OutputPin,
{
    /// Attaches to GPRS and brings up the data profile. Activation can
    /// take the network tens of seconds; size `timeout` accordingly.
    pub fn attach(
        &self,
        apn: &str,
        user: &str,
        password: &str,
        timeout: Milliseconds,
    ) -> Result<(), Error> {
        self.modem.send("AT+CGATT=1")?;
        let mut state = AttachState::AwaitAttach;

        self.modem.spin(timeout, SERVICE_POLL_MS, || {
            self.attach_step(&mut state, apn, user, password)
        })
    }

    fn attach_step(
        &self,
        state: &mut AttachState,
        apn: &str,
        user: &str,
        password: &str,
    ) -> nb::Result<(), Error> {
        let code = self.modem.ready()?;
        code.check()?;
        match *state {
            AttachState::AwaitAttach => {
                self.modem
                    .send_fmt(format_args!("AT+UPSD=0,1,\"{}\"", apn))?;
                *state = AttachState::AwaitApn;
            }
            AttachState::AwaitApn => {
                self.modem
                    .send_fmt(format_args!("AT+UPSD=0,2,\"{}\"", user))?;
                *state = AttachState::AwaitUser;
            }
            AttachState::AwaitUser => {
                self.modem
                    .send_fmt(format_args!("AT+UPSD=0,3,\"{}\"", password))?;
                *state = AttachState::AwaitPassword;
            }
            AttachState::AwaitPassword => {
                self.modem.send("AT+UPSD=0,7,\"0.0.0.0\"")?;
                *state = AttachState::AwaitDynamicIp;
            }
            AttachState::AwaitDynamicIp => {
                self.modem.send("AT+UPSDA=0,3")?;
                *state = AttachState::AwaitActivation;
            }
            AttachState::AwaitActivation => {
                self.modem.capture_response();
                self.modem.send("AT+UPSND=0,8")?;
                *state = AttachState::AwaitProfileCheck;
            }
            AttachState::AwaitProfileCheck => {
                let mut reply: String<32> = String::new();
                if !self.modem.take_response(&mut reply) {
                    return Err(nb::Error::Other(Error::InvalidResponse));
                }
                if !reply.as_str().trim_end().ends_with(",1") {
                    warn!("data profile did not come up");
                    return Err(nb::Error::Other(Error::Command));
                }
                info!("GPRS attached");
                return Ok(());
            }
        }
        Err(nb::Error::WouldBlock)
    }

    /// Deactivates the data profile and detaches from GPRS.
    pub fn detach(&self, timeout: Milliseconds) -> Result<(), Error> {
        self.modem.send("AT+UPSDA=0,4")?;
        self.modem.wait_for_response(timeout)?.check()?;
        self.modem.send("AT+CGATT=0")?;
        self.modem.wait_for_response(timeout)?.check()
    }

    /// The profile's assigned address.
    pub fn ip_address(&self) -> Result<IpAddr, Error> {
        self.modem.send("AT+UPSND=0,0")?;
        let mut reply: String<64> = String::new();
        self.modem
            .wait_for_response_into(Milliseconds(1_000), &mut reply)?
            .check()?;
        let quoted = parse::quoted(reply.as_str()).ok_or(Error::InvalidResponse)?;
        IpAddr::from_str(quoted).map_err(|_| Error::InvalidResponse)
    }

    /// Resolves `host` through the module's DNS.
    pub fn host_by_name(&self, host: &str) -> Result<IpAddr, Error> {
        self.modem
            .send_fmt(format_args!("AT+UDNSRN=0,\"{}\"", host))?;
        let mut reply: String<64> = String::new();
        self.modem
            .wait_for_response_into(Milliseconds(DNS_TIMEOUT_MS), &mut reply)?
            .check()?;
        let quoted = parse::quoted(reply.as_str()).ok_or(Error::InvalidResponse)?;
        IpAddr::from_str(quoted).map_err(|_| Error::InvalidResponse)
    }

    /// Pings `host` once and returns the round trip time.
    pub fn ping(&self, host: &str, timeout: Milliseconds) -> Result<Milliseconds, Error> {
        self.events.failure.set(None);
        let mut op = UrcOperation::new();
        let outcome = self.modem.spin(timeout, SERVICE_POLL_MS, || {
            op.advance(self.modem, &self.events.flag, || {
                self.modem
                    .send_fmt(format_args!("AT+UPING=\"{}\",1,32,5000,32", host))
            })
        })?;
        match outcome {
            UrcFlag::Succeeded => Ok(Milliseconds(self.events.rtt.get())),
            _ => Err(Error::Ping(
                self.events.failure.get().unwrap_or(PingError::Failed),
            )),
        }
    }
}
