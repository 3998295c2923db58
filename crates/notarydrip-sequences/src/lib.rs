//! # NotaryDrip Sequences
//! Trigger-driven, multi-step drip campaigns for the lifecycle notification
//! engine.
//!
//! - Catalog: validated sequence/step CRUD, import/export
//! - Matching and scheduling with send windows in a reference timezone
//! - Sweep loop with atomic idempotency claims, so replicas never double-send
//! - Retry/backoff and a failure feed for permanent failures
//!
//! Everything is persisted in SQLite.

pub mod catalog;
pub mod dedup;
pub mod dispatch;
pub mod engine;
pub mod feed;
pub mod matcher;
pub mod model;
pub mod persistence;
pub mod planner;
pub mod retry;
pub mod store;
pub mod window;

#[cfg(test)]
mod testing;

pub use catalog::{Catalog, SequenceUpdate};
pub use dispatch::{DeliveryOutcome, Dispatcher};
pub use engine::{EngineSettings, IngestReport, NotificationEngine, SendResult, SweepReport};
pub use feed::{FailureEvent, FailureFeed, FailureKind};
pub use model::{
    Delay, DelayUnit, DeliveryRecord, NewSequence, NewStep, ScheduledSend, SendStatus,
    SendWindow, Sequence, SequenceStats, Step,
};
pub use persistence::SequenceDb;
