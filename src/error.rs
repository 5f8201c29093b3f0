use crate::hex::FromHexError;

/// Outcome of a ping exchange, decoded from `+UUPING`/`+UUPINGER`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PingError {
    /// The modem reported a ping failure.
    Failed,
    /// No echo reply within the modem-side timeout.
    Timeout,
    /// The hostname did not resolve.
    UnknownHost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Serial read or write failed.
    Serial,
    /// No terminator (or expected prompt) within the deadline.
    Timeout,
    /// The monotonic clock failed.
    Clock,
    /// A bounded buffer was too small for the data at hand.
    Overflow,
    /// The response arrived but did not have the expected shape.
    InvalidResponse,
    /// The modem answered `ERROR`.
    Command,
    /// The modem answered `NO CARRIER`.
    NoCarrier,
    /// The socket was closed, either explicitly or asynchronously by the peer.
    SocketClosed,
    /// Operation on a handle that is not currently open.
    InvalidSocket,
    /// All URC handler slots are taken.
    UrcCapacity,

    Hex(FromHexError),
    Ping(PingError),
}

#[cfg(feature = "defmt")]
impl defmt::Format for Error {
    fn format(&self, f: defmt::Formatter<'_>) {
        match self {
            Self::Serial => defmt::write!(f, "Serial"),
            Self::Timeout => defmt::write!(f, "Timeout"),
            Self::Clock => defmt::write!(f, "Clock"),
            Self::Overflow => defmt::write!(f, "Overflow"),
            Self::InvalidResponse => defmt::write!(f, "InvalidResponse"),
            Self::Command => defmt::write!(f, "Command"),
            Self::NoCarrier => defmt::write!(f, "NoCarrier"),
            Self::SocketClosed => defmt::write!(f, "SocketClosed"),
            Self::InvalidSocket => defmt::write!(f, "InvalidSocket"),
            Self::UrcCapacity => defmt::write!(f, "UrcCapacity"),
            Self::Hex(e) => defmt::write!(f, "Hex({:?})", e),
            Self::Ping(e) => defmt::write!(f, "Ping({:?})", e),
            _ => defmt::write!(f, "non_exhaustive"),
        }
    }
}

impl From<FromHexError> for Error {
    fn from(e: FromHexError) -> Self {
        Self::Hex(e)
    }
}

impl From<PingError> for Error {
    fn from(e: PingError) -> Self {
        Self::Ping(e)
    }
}
