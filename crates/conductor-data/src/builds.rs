//! Build resource type.

use chrono::{DateTime, Utc};
use conductor_core::model::{Build, NewBuild};
use conductor_core::{BuildId, BuildRequestId, BuilderId, MasterId, Results, WorkerId};
use conductor_db::BuildQuery;
use conductor_mq::{Topic, topic};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::endpoint::BuildRef;
use crate::resultspec::ResultSpec;
use crate::{DataConnector, DataError, DataResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildView {
    pub buildid: BuildId,
    pub number: i32,
    pub builderid: BuilderId,
    pub buildrequestid: BuildRequestId,
    pub workerid: WorkerId,
    pub masterid: MasterId,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub started_at: DateTime<Utc>,
    pub complete: bool,
    #[serde(with = "chrono::serde::ts_seconds_option")]
    pub complete_at: Option<DateTime<Utc>>,
    pub state_string: String,
    pub results: Option<Results>,
}

impl From<Build> for BuildView {
    fn from(build: Build) -> Self {
        Self {
            buildid: build.id,
            number: build.number,
            builderid: build.builderid,
            buildrequestid: build.buildrequestid,
            workerid: build.workerid,
            masterid: build.masterid,
            started_at: build.started_at,
            complete: build.complete_at.is_some(),
            complete_at: build.complete_at,
            state_string: build.state_string,
            results: build.results,
        }
    }
}

impl BuildView {
    pub fn topics(&self, event: &str) -> Vec<Topic> {
        vec![
            topic!("builds", self.buildid, event),
            topic!("builders", self.builderid, "builds", self.buildid, event),
        ]
    }
}

pub struct Builds<'a> {
    data: &'a DataConnector,
}

impl<'a> Builds<'a> {
    pub(crate) fn new(data: &'a DataConnector) -> Self {
        Self { data }
    }

    async fn publish(&self, id: BuildId, event: &str) -> DataResult<()> {
        let view = self
            .get(id)
            .await?
            .ok_or_else(|| DataError::NotFound(format!("build {}", id)))?;
        let body = serde_json::to_value(&view)?;
        self.data.publish_all(view.topics(event), &body).await
    }

    /// Start a build of `buildrequestid` on this master. Returns its id and number.
    pub async fn add(
        &self,
        builderid: BuilderId,
        buildrequestid: BuildRequestId,
        workerid: WorkerId,
    ) -> DataResult<(BuildId, i32)> {
        let (id, number) = self
            .data
            .store()
            .add_build(&NewBuild {
                builderid,
                buildrequestid,
                workerid,
                masterid: self.data.masterid(),
                started_at: self.data.now(),
                state_string: "created".to_string(),
            })
            .await?;
        info!(buildid = %id, builderid = %builderid, number, "Added build");
        self.publish(id, "new").await?;
        Ok((id, number))
    }

    pub async fn set_state_string(&self, id: BuildId, state_string: &str) -> DataResult<()> {
        self.data
            .store()
            .set_build_state_string(id, state_string)
            .await?;
        self.publish(id, "updated").await
    }

    pub async fn finish(&self, id: BuildId, results: Results) -> DataResult<()> {
        self.data
            .store()
            .finish_build(id, results, self.data.now())
            .await?;
        info!(buildid = %id, results = %results, "Finished build");
        self.publish(id, "finished").await
    }

    pub async fn get(&self, id: BuildId) -> DataResult<Option<BuildView>> {
        Ok(self.data.store().get_build(id).await?.map(BuildView::from))
    }

    /// Look up a build by id or by builder and number.
    pub async fn get_by_ref(&self, build: &BuildRef) -> DataResult<Option<BuildView>> {
        match build {
            BuildRef::Id(id) => self.get(*id).await,
            BuildRef::Number { builder, number } => {
                let Some(builderid) = self.data.resolve_builder(builder).await? else {
                    return Ok(None);
                };
                Ok(self
                    .data
                    .store()
                    .get_build_by_number(builderid, *number)
                    .await?
                    .map(BuildView::from))
            }
        }
    }

    pub(crate) async fn list(
        &self,
        builderid: Option<BuilderId>,
        spec: &mut ResultSpec,
    ) -> DataResult<Vec<BuildView>> {
        // A builder named in the path wins over a builderid filter.
        let filtered = spec.pop_integer_filter("builderid").map(BuilderId::from);
        let builderid = builderid.or(filtered);
        let buildrequestid = spec
            .pop_integer_filter("buildrequestid")
            .map(BuildRequestId::from);
        self.query(BuildQuery {
            builderid,
            buildrequestid,
            complete: spec.pop_boolean_filter("complete"),
        })
        .await
    }

    pub(crate) async fn list_for_buildrequest(
        &self,
        buildrequestid: BuildRequestId,
        spec: &mut ResultSpec,
    ) -> DataResult<Vec<BuildView>> {
        self.query(BuildQuery {
            buildrequestid: Some(buildrequestid),
            complete: spec.pop_boolean_filter("complete"),
            ..Default::default()
        })
        .await
    }

    async fn query(&self, query: BuildQuery) -> DataResult<Vec<BuildView>> {
        let builds = self.data.store().get_builds(&query).await?;
        Ok(builds.into_iter().map(BuildView::from).collect())
    }
}
