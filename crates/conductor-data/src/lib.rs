//! Data layer for Conductor.
//!
//! Resource types wrap the store with the lifecycle rules of build requests,
//! buildsets, builds and steps, and announce every committed change on the
//! event bus. [`DataConnector::get`] answers path queries over the same views.

pub mod buildrequests;
pub mod builds;
pub mod buildsets;
pub mod connector;
pub mod endpoint;
pub mod error;
pub mod resultspec;
pub mod steps;

#[cfg(test)]
mod fixtures;

pub use buildrequests::{BuildRequestView, BuildRequests};
pub use builds::{BuildView, Builds};
pub use buildsets::{BuildsetView, Buildsets, SourceStampView};
pub use connector::{DataConnector, Resolved};
pub use endpoint::{BuildRef, Identifier, Route};
pub use error::{DataError, DataResult};
pub use resultspec::{Filter, FilterOp, ResultSpec};
pub use steps::{StepView, Steps};
