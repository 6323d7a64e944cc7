//! Outreach sequencer: scheduled, rate-limited email sequences that stop
//! on reply.

pub mod api;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod limiter;
pub mod mail;
pub mod replies;
pub mod roster;
pub mod scheduler;
pub mod sequence;
pub mod store;
pub mod telemetry;
