//! Cell-based positioning via the module's CellLocate engine. The fix
//! arrives asynchronously as a `+UULOC:` notification.

use core::cell::Cell;
use core::convert::TryInto;

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;
use embedded_io::{Read, ReadReady, Write};
use embedded_time::duration::{Generic, Milliseconds};
use embedded_time::Clock;

use crate::error::Error;
use crate::modem::{Modem, UrcHandler};
use crate::services::parse;
use crate::state::{UrcFlag, UrcOperation, SERVICE_POLL_MS};

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Position {
    pub latitude: f32,
    pub longitude: f32,
    /// Metres above sea level.
    pub altitude: i32,
    /// Estimated error radius in metres.
    pub uncertainty: u32,
}

/// URC state shared between the dispatcher and a [`Location`] service.
#[derive(Default)]
pub struct LocationEvents {
    flag: Cell<UrcFlag>,
    latitude: Cell<f32>,
    longitude: Cell<f32>,
    altitude: Cell<i32>,
    uncertainty: Cell<u32>,
}

impl LocationEvents {
    pub fn new() -> Self {
        Self::default()
    }
}

impl UrcHandler for LocationEvents {
    fn handle_urc(&self, line: &str) {
        let rest = match parse::after_prefix(line, "+UULOC: ") {
            Some(rest) => rest,
            None => return,
        };
        // Date and time fields vary in shape; the tail four fields are
        // fixed: latitude, longitude, altitude, uncertainty.
        let mut fields = rest.rsplit(',');
        let parsed: Option<(f32, f32, i32, u32)> = (|| {
            let uncertainty = fields.next()?.trim().parse().ok()?;
            let altitude = fields.next()?.trim().parse().ok()?;
            let longitude = fields.next()?.trim().parse().ok()?;
            let latitude = fields.next()?.trim().parse().ok()?;
            Some((latitude, longitude, altitude, uncertainty))
        })();
        match parsed {
            Some((latitude, longitude, altitude, uncertainty)) => {
                self.latitude.set(latitude);
                self.longitude.set(longitude);
                self.altitude.set(altitude);
                self.uncertainty.set(uncertainty);
                self.flag.set(UrcFlag::Succeeded);
            }
            None => {
                warn!("unparseable location report");
                self.flag.set(UrcFlag::Failed);
            }
        }
    }
}

pub struct Location<'a, 'sub, S, CLK, D, DTR>
where
    CLK: Clock,
{
    modem: &'a Modem<'sub, S, CLK, D, DTR>,
    events: &'sub LocationEvents,
}

impl<'a, 'sub, S, CLK, D, DTR> Location<'a, 'sub, S, CLK, D, DTR>
where
    CLK: Clock,
{
    pub fn new(
        modem: &'a Modem<'sub, S, CLK, D, DTR>,
        events: &'sub LocationEvents,
    ) -> Result<Self, Error> {
        modem.register_urc_handler(events)?;
        Ok(Self { modem, events })
    }
}

impl<'a, 'sub, S, CLK, D, DTR> Drop for Location<'a, 'sub, S, CLK, D, DTR>
where
    CLK: Clock,
{
    fn drop(&mut self) {
        self.modem.unregister_urc_handler(self.events);
    }
}

impl<'a, 'sub, S, CLK, D, DTR> Location<'a, 'sub, S, CLK, D, DTR>
where
    S: Read + Write + ReadReady,
    CLK: Clock,
    Generic<CLK::T>: TryInto<Milliseconds>,
    D: DelayNs,
    DTR: OutputPin,
{
    /// Enables cell information collection for positioning.
    pub fn begin(&self) -> Result<(), Error> {
        self.modem.send("AT+ULOCCELL=1")?;
        self.modem
            .wait_for_response(Milliseconds(1_000u32))?
            .check()
    }

    /// Requests a fix and waits for the report. CellLocate can take tens
    /// of seconds depending on coverage; size `timeout` accordingly.
    pub fn current(&self, timeout: Milliseconds) -> Result<Position, Error> {
        let mut operation = UrcOperation::new();
        let modem = self.modem;
        let outcome = modem.spin(timeout, SERVICE_POLL_MS, || {
            operation.advance(modem, &self.events.flag, || {
                modem.send("AT+ULOC=2,2,0,1,1")
            })
        })?;
        match outcome {
            UrcFlag::Succeeded => Ok(Position {
                latitude: self.events.latitude.get(),
                longitude: self.events.longitude.get(),
                altitude: self.events.altitude.get(),
                uncertainty: self.events.uncertainty.get(),
            }),
            _ => Err(Error::InvalidResponse),
        }
    }
}
