//! Build result codes.

use derive_more::Display;
use serde::{Deserialize, Serialize};

/// A result code attached to a completed build request, buildset, build or step.
///
/// The well-known codes are exposed as constants. Any other integer is
/// accepted and carried through unchanged, and `NONE` marks an entity that
/// has not completed yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(transparent)]
#[display("{_0}")]
pub struct Results(pub i32);

impl Results {
    pub const NONE: Results = Results(-1);
    pub const SUCCESS: Results = Results(0);
    pub const WARNINGS: Results = Results(1);
    pub const FAILURE: Results = Results(2);
    pub const SKIPPED: Results = Results(3);
    pub const EXCEPTION: Results = Results(4);
    pub const RETRY: Results = Results(5);
    pub const CANCELLED: Results = Results(6);

    /// Best to worst.
    const SEVERITY: [Results; 7] = [
        Results::SKIPPED,
        Results::SUCCESS,
        Results::WARNINGS,
        Results::FAILURE,
        Results::EXCEPTION,
        Results::RETRY,
        Results::CANCELLED,
    ];

    pub fn get(self) -> i32 {
        self.0
    }

    /// Human-readable name of a well-known code.
    pub fn name(self) -> Option<&'static str> {
        match self {
            Results::SUCCESS => Some("success"),
            Results::WARNINGS => Some("warnings"),
            Results::FAILURE => Some("failure"),
            Results::SKIPPED => Some("skipped"),
            Results::EXCEPTION => Some("exception"),
            Results::RETRY => Some("retry"),
            Results::CANCELLED => Some("cancelled"),
            _ => None,
        }
    }

    /// Whether this code can be the result of a completed entity.
    pub fn is_terminal(self) -> bool {
        self != Results::NONE
    }

    fn severity(self) -> usize {
        // Unknown codes rank after every well-known one.
        Self::SEVERITY
            .iter()
            .position(|r| *r == self)
            .unwrap_or(Self::SEVERITY.len())
    }

    /// The worse of two results.
    pub fn worst(self, other: Results) -> Results {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }
}

impl Default for Results {
    fn default() -> Self {
        Results::NONE
    }
}

impl From<i32> for Results {
    fn from(code: i32) -> Self {
        Self(code)
    }
}
