//! Shared state-machine plumbing for the service modules.
//!
//! Services come in two shapes. Chained command/response machines own a
//! private state enum and step it from a `poll`-style function returning
//! [`nb::Result`], sending the next command as soon as the previous one
//! terminates. Operations whose completion arrives later as a URC use
//! [`UrcOperation`]: send once, watch the response, then watch a
//! service-owned [`UrcFlag`] updated by that service's URC handler.
//!
//! Blocking variants of either shape go through [`Modem::spin`] with an
//! explicit deadline; [`SERVICE_POLL_MS`] is the inter-poll interval they
//! share.
//!
//! [`Modem::spin`]: crate::modem::Modem::spin

use core::cell::Cell;
use core::convert::TryInto;

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;
use embedded_io::{Read, ReadReady, Write};
use embedded_time::duration::{Generic, Milliseconds};
use embedded_time::Clock;

use crate::error::Error;
use crate::modem::Modem;

/// Poll interval for service-level wait loops.
pub(crate) const SERVICE_POLL_MS: u32 = 100;

/// Completion state reported by a URC, owned by the service's events struct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum UrcFlag {
    /// No completion URC seen yet.
    Unknown,
    Failed,
    Succeeded,
}

impl Default for UrcFlag {
    fn default() -> Self {
        UrcFlag::Unknown
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FireState {
    SendRequired,
    AwaitingResponse,
    AwaitingUrc,
}

/// Driver for "fire a command, completion comes later as a URC".
///
/// One value per operation attempt. `advance` is a step function in the
/// [`nb`] sense; terminal outcomes are `Ok(Succeeded)` or, for the one-shot
/// strategy, `Ok(Failed)` with the detail left in the service's events.
/// The retry strategy re-sends on a failed completion instead, bounded by
/// the caller's overall deadline.
pub(crate) struct UrcOperation {
    state: FireState,
    retry: bool,
}

impl UrcOperation {
    pub fn new() -> Self {
        Self {
            state: FireState::SendRequired,
            retry: false,
        }
    }

    pub fn with_retry() -> Self {
        Self {
            state: FireState::SendRequired,
            retry: true,
        }
    }

    pub fn advance<'sub, S, CLK, D, DTR>(
        &mut self,
        modem: &Modem<'sub, S, CLK, D, DTR>,
        flag: &Cell<UrcFlag>,
        mut send: impl FnMut() -> Result<(), Error>,
    ) -> nb::Result<UrcFlag, Error>
    where
        S: Read + Write + ReadReady,
        CLK: Clock,
        Generic<CLK::T>: TryInto<Milliseconds>,
        D: DelayNs,
        DTR: OutputPin,
    {
        match self.state {
            FireState::SendRequired => {
                flag.set(UrcFlag::Unknown);
                send()?;
                self.state = FireState::AwaitingResponse;
                Err(nb::Error::WouldBlock)
            }
            FireState::AwaitingResponse => {
                let code = modem.ready()?;
                code.check()?;
                self.state = FireState::AwaitingUrc;
                Err(nb::Error::WouldBlock)
            }
            FireState::AwaitingUrc => {
                modem.poll().map_err(nb::Error::Other)?;
                match flag.get() {
                    UrcFlag::Unknown => Err(nb::Error::WouldBlock),
                    UrcFlag::Succeeded => Ok(UrcFlag::Succeeded),
                    UrcFlag::Failed => {
                        if self.retry {
                            debug!("operation reported failure, re-sending");
                            self.state = FireState::SendRequired;
                            Err(nb::Error::WouldBlock)
                        } else {
                            Ok(UrcFlag::Failed)
                        }
                    }
                }
            }
        }
    }
}
