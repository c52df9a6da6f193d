//! Entity models as persisted by the store.
//!
//! These are the store-level records. The data layer derives its canonical,
//! published views from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    BuildId, BuildRequestId, BuilderId, BuildsetId, MasterId, Properties, Results, SourceStampId,
    StepId, WorkerId,
};

/// A registered master process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Master {
    pub id: MasterId,
    pub name: String,
}

/// A builder that build requests target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Builder {
    pub id: BuilderId,
    pub name: String,
}

/// Source code coordinates a buildset was triggered for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceStamp {
    pub id: SourceStampId,
    pub branch: Option<String>,
    pub revision: Option<String>,
    pub repository: Option<String>,
    pub project: Option<String>,
    pub codebase: Option<String>,
}

/// Fields of a source stamp before insertion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewSourceStamp {
    pub branch: Option<String>,
    pub revision: Option<String>,
    pub repository: Option<String>,
    pub project: Option<String>,
    pub codebase: Option<String>,
}

/// One trigger event, grouping build requests that share sources and properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Buildset {
    pub id: BuildsetId,
    pub external_idstring: Option<String>,
    pub reason: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub complete: bool,
    pub complete_at: Option<DateTime<Utc>>,
    pub results: Results,
    pub parent_buildid: Option<BuildId>,
    pub parent_relationship: Option<String>,
    /// Earliest ancestor build this buildset re-runs, if it is a rebuild.
    pub rebuilt_buildid: Option<BuildId>,
    pub sourcestamps: Vec<SourceStampId>,
}

/// Everything needed to insert a buildset together with its requests.
#[derive(Debug, Clone, PartialEq)]
pub struct NewBuildset {
    pub sourcestamps: Vec<SourceStampId>,
    pub reason: Option<String>,
    pub properties: Properties,
    pub builderids: Vec<BuilderId>,
    pub waited_for: bool,
    pub external_idstring: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub parent_buildid: Option<BuildId>,
    pub parent_relationship: Option<String>,
    pub priority: i32,
    pub rebuilt_buildid: Option<BuildId>,
}

/// One schedulable unit of work for a single builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRequest {
    pub id: BuildRequestId,
    pub buildsetid: BuildsetId,
    pub builderid: BuilderId,
    pub priority: i32,
    pub submitted_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub claimed_by_masterid: Option<MasterId>,
    pub complete: bool,
    pub complete_at: Option<DateTime<Utc>>,
    pub results: Results,
    pub waited_for: bool,
}

impl BuildRequest {
    pub fn claimed(&self) -> bool {
        self.claimed_at.is_some()
    }
}

/// One execution attempt of a build request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    pub id: BuildId,
    pub number: i32,
    pub builderid: BuilderId,
    pub buildrequestid: BuildRequestId,
    pub workerid: WorkerId,
    pub masterid: MasterId,
    pub started_at: DateTime<Utc>,
    pub complete_at: Option<DateTime<Utc>>,
    pub state_string: String,
    pub results: Option<Results>,
}

/// Fields of a build before insertion; the number is assigned by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewBuild {
    pub builderid: BuilderId,
    pub buildrequestid: BuildRequestId,
    pub workerid: WorkerId,
    pub masterid: MasterId,
    pub started_at: DateTime<Utc>,
    pub state_string: String,
}

/// A link attached to a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepUrl {
    pub name: String,
    pub url: String,
}

/// One phase of a build's execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub number: i32,
    pub name: String,
    pub buildid: BuildId,
    pub started_at: Option<DateTime<Utc>>,
    pub locks_acquired_at: Option<DateTime<Utc>>,
    pub complete_at: Option<DateTime<Utc>>,
    pub state_string: String,
    pub results: Option<Results>,
    pub urls: Vec<StepUrl>,
    pub hidden: bool,
}

impl Step {
    pub fn complete(&self) -> bool {
        self.complete_at.is_some()
    }
}
