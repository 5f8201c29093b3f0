#![cfg_attr(not(test), no_std)]

//! Driver for u-blox SARA-U2 series GSM/GPRS modules over a UART.
//!
//! The modem speaks a line-oriented AT dialect: commands are echoed, response
//! bodies end in `OK`/`ERROR`/`NO CARRIER`, and asynchronous events arrive as
//! unsolicited result codes (URCs). [`Modem`] owns the serial link and turns
//! that byte stream into command outcomes and URC deliveries; the service
//! types under [`services`] (network registration, GPRS context, sockets,
//! FTP, SMS, voice, location, file system) are polling state machines layered
//! on top of it.
//!
//! Everything is driven cooperatively from the caller's thread. Non-blocking
//! methods follow the [`nb`] convention (`WouldBlock` while an operation is
//! still in flight); blocking variants take an explicit bounded timeout and
//! spin with a small delay.
//!
//! Services that consume URCs split their state into an events value the
//! dispatcher writes to and a driver value borrowing both the modem and the
//! events; the events value therefore has to outlive the modem it registers
//! with.
//!
//! ```ignore
//! let ping = PingEvents::new();
//! let sockets = SocketEvents::new();
//!
//! let modem = Modem::new(serial, clock, delay, Config::new());
//! modem.init(Milliseconds(15_000))?;
//!
//! let mut network = Network::new(&modem);
//! network.begin(Some("1234"), Milliseconds(120_000))?;
//!
//! let gprs = Gprs::new(&modem, &ping)?;
//! gprs.attach("internet", "", "", Milliseconds(60_000))?;
//!
//! let mut client = TcpClient::new(&modem, &sockets)?;
//! client.connect("example.org", 80, Milliseconds(30_000))?;
//! ```

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

pub mod config;
pub mod error;
pub mod hex;
pub mod modem;
pub mod services;
mod state;

#[cfg(test)]
mod test_helpers;

pub use config::{Config, NoPin};
pub use error::{Error, PingError};
pub use hex::FromHexError;
pub use modem::{Modem, ResponseCode, UrcHandler, MAX_URC_HANDLERS};
pub use services::files::{FileNames, FileSystem};
pub use services::ftp::{FtpClient, FtpEvents};
pub use services::gprs::{Gprs, PingEvents};
pub use services::info::ModemInfo;
pub use services::location::{Location, LocationEvents, Position};
pub use services::network::{Network, NetworkStatus, RegistrationStatus};
pub use services::sms::{Message, Messages, OutgoingMessage, Sms};
pub use services::socket::server::{ListenerEvents, TcpServer};
pub use services::socket::tcp::{SocketEvents, TcpClient};
pub use services::socket::udp::UdpSocket;
pub use services::socket::{SocketHandle, NUM_SOCKETS};
pub use services::voice::{CallMonitor, CallStatus, VoiceCall};
