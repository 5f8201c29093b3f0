//! Voice calls. Call progress arrives asynchronously as `+UCALLSTAT:`
//! notifications; dialing waits on the monitor state rather than on the
//! command response alone.

use core::cell::Cell;
use core::convert::TryInto;

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;
use embedded_io::{Read, ReadReady, Write};
use embedded_time::duration::{Generic, Milliseconds};
use embedded_time::Clock;
use heapless::String;

use crate::error::Error;
use crate::modem::{Modem, UrcHandler};
use crate::services::parse;
use crate::state::SERVICE_POLL_MS;

const ANSWER_TIMEOUT_MS: u32 = 20_000;
const HANGUP_TIMEOUT_MS: u32 = 200_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CallStatus {
    Idle,
    Calling,
    Receiving,
    Talking,
}

impl Default for CallStatus {
    fn default() -> Self {
        CallStatus::Idle
    }
}

/// URC-fed call state shared between the dispatcher and a [`VoiceCall`].
#[derive(Default)]
pub struct CallMonitor {
    state: Cell<CallStatus>,
}

impl CallMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> CallStatus {
        self.state.get()
    }
}

impl UrcHandler for CallMonitor {
    fn handle_urc(&self, line: &str) {
        if !line.starts_with("+UCALLSTAT: ") {
            return;
        }
        let status = match parse::last_digit(line) {
            Some(digit) => digit,
            None => return,
        };
        // Module codes: 0 active, 1 held, 7 connected; 2 dialling,
        // 3 alerting; 4 ringing, 5 waiting; anything else is over.
        self.state.set(match status {
            0 | 1 | 7 => CallStatus::Talking,
            2 | 3 => CallStatus::Calling,
            4 | 5 => CallStatus::Receiving,
            _ => CallStatus::Idle,
        });
    }
}

pub struct VoiceCall<'a, 'sub, S, CLK, D, DTR>
where
    CLK: Clock,
{
    modem: &'a Modem<'sub, S, CLK, D, DTR>,
    monitor: &'sub CallMonitor,
}

impl<'a, 'sub, S, CLK, D, DTR> VoiceCall<'a, 'sub, S, CLK, D, DTR>
where
    CLK: Clock,
{
    pub fn new(
        modem: &'a Modem<'sub, S, CLK, D, DTR>,
        monitor: &'sub CallMonitor,
    ) -> Result<Self, Error> {
        modem.register_urc_handler(monitor)?;
        Ok(Self { modem, monitor })
    }
}

impl<'a, 'sub, S, CLK, D, DTR> Drop for VoiceCall<'a, 'sub, S, CLK, D, DTR>
where
    CLK: Clock,
{
    fn drop(&mut self) {
        self.modem.unregister_urc_handler(self.monitor);
    }
}

impl<'a, 'sub, S, CLK, D, DTR> VoiceCall<'a, 'sub, S, CLK, D, DTR>
where
    S: Read + Write + ReadReady,
    CLK: Clock,
    Generic<CLK::T>: TryInto<Milliseconds>,
    D: DelayNs,
    DTR: OutputPin,
{
    /// Drains pending notifications and reports the current call state.
    pub fn status(&self) -> Result<CallStatus, Error> {
        self.modem.poll()?;
        Ok(self.monitor.state())
    }

    /// Dials `to` and waits for the call to go active. `timeout` bounds
    /// the dial response and the call setup wait separately. A call that
    /// ends or never connects within the window is hung up and reported
    /// as [`Error::NoCarrier`].
    pub fn dial(&self, to: &str, timeout: Milliseconds) -> Result<(), Error> {
        self.monitor.state.set(CallStatus::Calling);
        self.modem.send_fmt(format_args!("ATD{};", to))?;
        self.modem.wait_for_response(timeout)?.check()?;

        let modem = self.modem;
        let outcome = modem.spin(timeout, SERVICE_POLL_MS, || {
            modem.poll().map_err(nb::Error::Other)?;
            match self.monitor.state() {
                CallStatus::Calling => Err(nb::Error::WouldBlock),
                state => Ok(state),
            }
        });
        match outcome {
            Ok(CallStatus::Talking) => {
                info!("call connected");
                Ok(())
            }
            Ok(_) | Err(Error::Timeout) => {
                self.hang_up()?;
                Err(Error::NoCarrier)
            }
            Err(e) => Err(e),
        }
    }

    /// Answers an incoming call.
    pub fn answer(&self) -> Result<(), Error> {
        self.modem.send("ATA")?;
        self.modem
            .wait_for_response(Milliseconds(ANSWER_TIMEOUT_MS))?
            .check()
    }

    /// Ends the current call, incoming or outgoing.
    pub fn hang_up(&self) -> Result<(), Error> {
        self.modem.send("ATH")?;
        self.modem
            .wait_for_response(Milliseconds(HANGUP_TIMEOUT_MS))?
            .check()?;
        self.monitor.state.set(CallStatus::Idle);
        Ok(())
    }

    /// Number of the current call's peer, from the call list.
    pub fn calling_number<const N: usize>(&self, out: &mut String<N>) -> Result<(), Error> {
        self.modem.send("AT+CLCC")?;
        let mut reply: String<96> = String::new();
        self.modem
            .wait_for_response_into(Milliseconds(1_000u32), &mut reply)?
            .check()?;
        let number = parse::quoted(reply.as_str()).ok_or(Error::InvalidResponse)?;
        out.clear();
        out.push_str(number).map_err(|_| Error::Overflow)
    }
}
