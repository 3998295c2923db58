//! # NotaryDrip Core
//!
//! Shared building blocks for the lifecycle notification engine: domain types,
//! the funnel status guard, template rendering, configuration, errors and the
//! capability traits transports and subject stores implement.

pub mod config;
pub mod error;
pub mod funnel;
pub mod template;
pub mod traits;
pub mod types;

pub use config::DripConfig;
pub use error::{DripError, Result, ValidationError};
pub use funnel::{FunnelStatus, StatusGate, higher_of, should_advance};
pub use traits::{OutboundMessage, SubjectStore, Transport, TransportError, TransportReceipt};
pub use types::{Channel, DomainEvent, Subject, TriggerEvent};
