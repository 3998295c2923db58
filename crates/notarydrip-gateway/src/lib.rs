//! # NotaryDrip Gateway
//! Admin and intake HTTP API over the notification engine.
//!
//! Upstream services post domain events and funnel-status proposals here;
//! operators manage sequences and watch failures.

pub mod routes;
pub mod server;

pub use server::{AppState, build_router, start};
