use embedded_hal::digital::{ErrorType, OutputPin};

pub struct NoPin;

impl ErrorType for NoPin {
    type Error = core::convert::Infallible;
}

impl OutputPin for NoPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Hardware wiring options.
///
/// The serial port itself is owned and configured by the caller; the only
/// line this driver sequences is the DTR power-saving handshake, and only
/// when one is provided.
#[derive(Debug)]
pub struct Config<DTR> {
    pub(crate) dtr_pin: Option<DTR>,
}

impl Default for Config<NoPin> {
    fn default() -> Self {
        Self { dtr_pin: None }
    }
}

impl<DTR> Config<DTR>
where
    DTR: OutputPin,
{
    #[must_use]
    pub fn new() -> Self {
        Self { dtr_pin: None }
    }

    pub fn with_dtr(self, dtr_pin: DTR) -> Self {
        Self {
            dtr_pin: Some(dtr_pin),
        }
    }
}
