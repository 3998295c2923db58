//! # NotaryDrip Channels
//! Delivery transports for the notification engine.
//!
//! Email: HTTP mail API or SMTP. SMS: HTTP messages API. Both channels have a
//! dry-run logging transport.

pub mod email;
pub mod log;
pub mod registry;
pub mod sms;

pub use registry::ChannelSet;
