//! Recipient sequence model and stage timing.

pub mod model;
pub mod plan;

pub use model::{AttributeValue, Attributes, RecipientId, RecipientRecord, Stage, StopReason};
pub use plan::{NextStep, SequencePlan};
