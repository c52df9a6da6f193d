//! Resource identifiers.
//!
//! Every persisted entity is keyed by a database-assigned integer. Each kind
//! gets its own newtype so a step id can never be passed where a build id is
//! expected.

use derive_more::Display;
use serde::{Deserialize, Serialize};

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
        )]
        #[serde(transparent)]
        #[display("{_0}")]
        pub struct $name(pub i64);

        impl $name {
            /// Get the raw database value.
            pub fn get(self) -> i64 {
                self.0
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl std::str::FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Ok(Self(s.parse()?))
            }
        }
    };
}

define_id!(
    /// Identifier of a master process registered in the shared store.
    MasterId
);
define_id!(
    /// Identifier of a builder.
    BuilderId
);
define_id!(
    /// Identifier of a buildset.
    BuildsetId
);
define_id!(
    /// Identifier of a build request.
    BuildRequestId
);
define_id!(
    /// Identifier of a build.
    BuildId
);
define_id!(
    /// Identifier of a step within a build.
    StepId
);
define_id!(
    /// Identifier of a source stamp.
    SourceStampId
);
define_id!(
    /// Identifier of a worker.
    WorkerId
);
