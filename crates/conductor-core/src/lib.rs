//! Core domain types for the Conductor build-request engine.
//!
//! This crate contains:
//! - Integer identifiers for every persisted entity
//! - Result codes and the "worst status" ordering
//! - Buildset properties
//! - Entity models shared by the store and the data layer
//! - A clock abstraction so timestamps can be controlled in tests

pub mod clock;
pub mod error;
pub mod id;
pub mod model;
pub mod properties;
pub mod results;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use id::{
    BuildId, BuildRequestId, BuilderId, BuildsetId, MasterId, SourceStampId, StepId, WorkerId,
};
pub use properties::Properties;
pub use results::Results;
