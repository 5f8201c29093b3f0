//! GSM network access: SIM unlock and network registration.

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
use crate::state::SERVICE_POLL_MS;

const PIN_LEN: usize = 16;
const SHUTDOWN_TIMEOUT_MS: u32 = 40_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NetworkStatus {
    Error,
    Idle,
    Connecting,
    GsmReady,
    GprsReady,
    TransparentConnected,
}

/// Decoded `+CREG?` network registration state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RegistrationStatus {
    NotRegistered,
    RegisteredHome,
    Searching,
    Denied,
    Unknown,
    RegisteredRoaming,
    SmsOnlyHome,
    SmsOnlyRoaming,
    EmergencyOnly,
}

impl RegistrationStatus {
    pub fn from_digit(digit: u8) -> Self {
        match digit {
            0 => RegistrationStatus::NotRegistered,
            1 => RegistrationStatus::RegisteredHome,
            2 => RegistrationStatus::Searching,
            3 => RegistrationStatus::Denied,
            5 => RegistrationStatus::RegisteredRoaming,
            6 => RegistrationStatus::SmsOnlyHome,
            7 => RegistrationStatus::SmsOnlyRoaming,
            8 => RegistrationStatus::EmergencyOnly,
            _ => RegistrationStatus::Unknown,
        }
    }

    /// Registration states usable for service, including the
    /// emergency-bearer-only attach some networks report while roaming.
    pub fn is_registered(self) -> bool {
        matches!(
            self,
            RegistrationStatus::RegisteredHome
                | RegistrationStatus::RegisteredRoaming
                | RegistrationStatus::EmergencyOnly
        )
    }
}

enum BeginState {
    Idle,
    AwaitSimCheck,
    AwaitSimUnlock,
    AwaitMessageFormat,
    AwaitRegistration,
    AwaitCallerId,
    AwaitConnectedLineId,
}

/// Brings the module onto the GSM network: SIM, text message format,
/// registration wait, caller/connected line identification.
pub struct Network<'a, 'sub, S, CLK, D, DTR>
where
    CLK: Clock,
{
    modem: &'a Modem<'sub, S, CLK, D, DTR>,
    state: BeginState,
    status: NetworkStatus,
    pin: Option<String<PIN_LEN>>,
}

impl<'a, 'sub, S, CLK, D, DTR> Network<'a, 'sub, S, CLK, D, DTR>
where
    CLK: Clock,
{
    pub fn new(modem: &'a Modem<'sub, S, CLK, D, DTR>) -> Self {
        Self {
            modem,
            state: BeginState::Idle,
            status: NetworkStatus::Idle,
            pin: None,
        }
    }

    pub fn status(&self) -> NetworkStatus {
        self.status
    }
}

impl<'a, 'sub, S, CLK, D, DTR> Network<'a, 'sub, S, CLK, D, DTR>
where
    S: Read + Write + ReadReady,
    CLK: Clock,
    Generic<CLK::T>: TryInto<Milliseconds>,
    D: DelayNs,
    DTR: OutputPin,
{
    /// Registers on the network, blocking up to `timeout`. `pin` unlocks
    /// the SIM when it asks for one; a locked SIM without a pin is a hard
    /// failure.
    pub fn begin(&mut self, pin: Option<&str>, timeout: Milliseconds) -> Result<(), Error> {
        self.start(pin)?;
        let modem = self.modem;
        let result = modem.spin(timeout, SERVICE_POLL_MS, || self.poll());
        if result.is_err() {
            self.status = NetworkStatus::Error;
            self.state = BeginState::Idle;
        }
        result
    }

    /// Starts the registration sequence driven by [`Network::poll`].
    pub fn start(&mut self, pin: Option<&str>) -> Result<(), Error> {
        self.pin = match pin {
            Some(pin) => {
                let mut stored: String<PIN_LEN> = String::new();
                stored.push_str(pin).map_err(|_| Error::Overflow)?;
                Some(stored)
            }
            None => None,
        };
        self.status = NetworkStatus::Connecting;
        self.modem.capture_response();
        self.modem.send("AT+CPIN?")?;
        self.state = BeginState::AwaitSimCheck;
        Ok(())
    }

    /// Advances the registration sequence. `Ok` once registered; with no
    /// sequence in progress this is a no-op `Ok`.
    pub fn poll(&mut self) -> nb::Result<(), Error> {
        if matches!(self.state, BeginState::Idle) {
            return Ok(());
        }
        let code = self.modem.ready()?;
        if let Err(e) = code.check() {
            return Err(self.fail(e));
        }

        match self.state {
            BeginState::Idle => unreachable!(),
            BeginState::AwaitSimCheck => {
                let mut reply: String<32> = String::new();
                if !self.modem.take_response(&mut reply) {
                    return Err(self.fail(Error::InvalidResponse));
                }
                let reply = reply.as_str().trim_end();
                if reply.ends_with("READY") {
                    self.modem.send("AT+CMGF=1")?;
                    self.state = BeginState::AwaitMessageFormat;
                } else if reply.ends_with("SIM PIN") {
                    match self.pin.take() {
                        Some(pin) => {
                            self.modem
                                .send_fmt(format_args!("AT+CPIN=\"{}\"", pin.as_str()))?;
                            self.state = BeginState::AwaitSimUnlock;
                        }
                        None => {
                            warn!("SIM is locked and no pin was given");
                            return Err(self.fail(Error::Command));
                        }
                    }
                } else {
                    // PUK-locked or otherwise unusable.
                    return Err(self.fail(Error::Command));
                }
            }
            BeginState::AwaitSimUnlock => {
                self.modem.send("AT+CMGF=1")?;
                self.state = BeginState::AwaitMessageFormat;
            }
            BeginState::AwaitMessageFormat => {
                self.modem.capture_response();
                self.modem.send("AT+CREG?")?;
                self.state = BeginState::AwaitRegistration;
            }
            BeginState::AwaitRegistration => {
                let mut reply: String<32> = String::new();
                if !self.modem.take_response(&mut reply) {
                    return Err(self.fail(Error::InvalidResponse));
                }
                let digit = match parse::last_digit(reply.as_str()) {
                    Some(digit) => digit,
                    None => return Err(self.fail(Error::InvalidResponse)),
                };
                let registration = RegistrationStatus::from_digit(digit);
                if registration.is_registered() {
                    self.modem.send("AT+CLIP=1")?;
                    self.state = BeginState::AwaitCallerId;
                } else if registration == RegistrationStatus::Denied {
                    warn!("network registration denied");
                    return Err(self.fail(Error::Command));
                } else {
                    self.modem.capture_response();
                    self.modem.send("AT+CREG?")?;
                }
            }
            BeginState::AwaitCallerId => {
                self.modem.send("AT+COLP=1")?;
                self.state = BeginState::AwaitConnectedLineId;
            }
            BeginState::AwaitConnectedLineId => {
                info!("registered on the network");
                self.status = NetworkStatus::GsmReady;
                self.state = BeginState::Idle;
                return Ok(());
            }
        }
        Err(nb::Error::WouldBlock)
    }

    /// One-shot registration state query.
    pub fn registration(&self, timeout: Milliseconds) -> Result<RegistrationStatus, Error> {
        self.modem.send("AT+CREG?")?;
        let mut reply: String<32> = String::new();
        self.modem
            .wait_for_response_into(timeout, &mut reply)?
            .check()?;
        let digit = parse::last_digit(reply.as_str()).ok_or(Error::InvalidResponse)?;
        Ok(RegistrationStatus::from_digit(digit))
    }

    /// Whether the module still answers on the AT link.
    pub fn is_access_alive(&self) -> Result<bool, Error> {
        self.modem.send("AT")?;
        match self.modem.wait_for_response(Milliseconds(100)) {
            Ok(code) => Ok(code.check().is_ok()),
            Err(Error::Timeout) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Powers the module off.
    pub fn shutdown(&mut self) -> Result<(), Error> {
        self.modem.send("AT+CPWROFF")?;
        self.modem
            .wait_for_response(Milliseconds(SHUTDOWN_TIMEOUT_MS))?
            .check()?;
        self.status = NetworkStatus::Idle;
        Ok(())
    }

    fn fail(&mut self, e: Error) -> nb::Error<Error> {
        self.status = NetworkStatus::Error;
        self.state = BeginState::Idle;
        nb::Error::Other(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::modem;

    #[test]
    fn begin_registers_without_a_pin() {
        let m = modem();
        let mut network = Network::new(&m.modem);

        m.serial
            .expect("AT+CPIN?", b"\r\n+CPIN: READY\r\n\r\nOK\r\n");
        m.serial.expect("AT+CMGF=1", b"\r\nOK\r\n");
        m.serial
            .expect("AT+CREG?", b"\r\n+CREG: 0,1\r\n\r\nOK\r\n");
        m.serial.expect("AT+CLIP=1", b"\r\nOK\r\n");
        m.serial.expect("AT+COLP=1", b"\r\nOK\r\n");

        network.begin(None, Milliseconds(60_000)).unwrap();
        assert_eq!(network.status(), NetworkStatus::GsmReady);
        assert!(m.serial.script_consumed());
    }

    #[test]
    fn begin_unlocks_a_locked_sim() {
        let m = modem();
        let mut network = Network::new(&m.modem);

        m.serial
            .expect("AT+CPIN?", b"\r\n+CPIN: SIM PIN\r\n\r\nOK\r\n");
        m.serial.expect("AT+CPIN=\"1234\"", b"\r\nOK\r\n");
        m.serial.expect("AT+CMGF=1", b"\r\nOK\r\n");
        m.serial
            .expect("AT+CREG?", b"\r\n+CREG: 0,5\r\n\r\nOK\r\n");
        m.serial.expect("AT+CLIP=1", b"\r\nOK\r\n");
        m.serial.expect("AT+COLP=1", b"\r\nOK\r\n");

        network.begin(Some("1234"), Milliseconds(60_000)).unwrap();
        assert_eq!(network.status(), NetworkStatus::GsmReady);
    }

    #[test]
    fn locked_sim_without_a_pin_fails() {
        let m = modem();
        let mut network = Network::new(&m.modem);

        m.serial
            .expect("AT+CPIN?", b"\r\n+CPIN: SIM PIN\r\n\r\nOK\r\n");

        assert_eq!(
            network.begin(None, Milliseconds(60_000)),
            Err(Error::Command)
        );
        assert_eq!(network.status(), NetworkStatus::Error);
    }

    #[test]
    fn registration_is_polled_until_the_network_answers() {
        let m = modem();
        let mut network = Network::new(&m.modem);

        m.serial
            .expect("AT+CPIN?", b"\r\n+CPIN: READY\r\n\r\nOK\r\n");
        m.serial.expect("AT+CMGF=1", b"\r\nOK\r\n");
        m.serial
            .expect("AT+CREG?", b"\r\n+CREG: 0,2\r\n\r\nOK\r\n");
        m.serial
            .expect("AT+CREG?", b"\r\n+CREG: 0,0\r\n\r\nOK\r\n");
        m.serial
            .expect("AT+CREG?", b"\r\n+CREG: 0,1\r\n\r\nOK\r\n");
        m.serial.expect("AT+CLIP=1", b"\r\nOK\r\n");
        m.serial.expect("AT+COLP=1", b"\r\nOK\r\n");

        network.begin(None, Milliseconds(60_000)).unwrap();
        assert_eq!(network.status(), NetworkStatus::GsmReady);
        assert_eq!(m.serial.written_string().matches("AT+CREG?").count(), 3);
    }

    #[test]
    fn denied_registration_is_terminal() {
        let m = modem();
        let mut network = Network::new(&m.modem);

        m.serial
            .expect("AT+CPIN?", b"\r\n+CPIN: READY\r\n\r\nOK\r\n");
        m.serial.expect("AT+CMGF=1", b"\r\nOK\r\n");
        m.serial
            .expect("AT+CREG?", b"\r\n+CREG: 0,3\r\n\r\nOK\r\n");

        assert_eq!(
            network.begin(None, Milliseconds(60_000)),
            Err(Error::Command)
        );
        assert_eq!(network.status(), NetworkStatus::Error);
    }

    #[test]
    fn access_liveness_follows_the_noop_probe() {
        let m = modem();
        let network = Network::new(&m.modem);

        m.serial.expect("AT", b"\r\nOK\r\n");
        assert_eq!(network.is_access_alive().unwrap(), true);

        // No reply queued: the probe times out.
        assert_eq!(network.is_access_alive().unwrap(), false);
    }

    #[test]
    fn shutdown_powers_the_module_off() {
        let m = modem();
        let mut network = Network::new(&m.modem);

        m.serial.expect("AT+CPWROFF", b"\r\nOK\r\n");
        network.shutdown().unwrap();
        assert_eq!(network.status(), NetworkStatus::Idle);
    }
}
