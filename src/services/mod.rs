//! Service modules built on the [`Modem`](crate::modem::Modem) transport.
//!
//! Each service borrows the shared transport and owns its own state
//! machine. Services whose state is updated asynchronously by URCs split
//! that state into an events struct (registered with the transport at
//! construction, unregistered on drop) so a URC handler can never issue
//! commands re-entrantly.

pub mod files;
pub mod ftp;
pub mod gprs;
pub mod info;
pub mod location;
pub mod network;
pub(crate) mod parse;
pub mod sms;
pub mod socket;
pub mod voice;
