//! Step resource type.
//!
//! A step moves from `pending` to started (optionally with its locks acquired
//! at the same instant), may record lock acquisition later, and is complete
//! once `complete_at` is set.

use chrono::{DateTime, Utc};
use conductor_core::model::{Step, StepUrl};
use conductor_core::{BuildId, Results, StepId};
use conductor_mq::{Topic, topic};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::endpoint::Identifier;
use crate::{DataConnector, DataError, DataResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepView {
    pub stepid: StepId,
    pub number: i32,
    pub name: String,
    pub buildid: BuildId,
    #[serde(with = "chrono::serde::ts_seconds_option")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(with = "chrono::serde::ts_seconds_option")]
    pub locks_acquired_at: Option<DateTime<Utc>>,
    pub complete: bool,
    #[serde(with = "chrono::serde::ts_seconds_option")]
    pub complete_at: Option<DateTime<Utc>>,
    pub results: Option<Results>,
    pub state_string: String,
    pub urls: Vec<StepUrl>,
    pub hidden: bool,
}

impl From<Step> for StepView {
    fn from(step: Step) -> Self {
        Self {
            complete: step.complete(),
            stepid: step.id,
            number: step.number,
            name: step.name,
            buildid: step.buildid,
            started_at: step.started_at,
            locks_acquired_at: step.locks_acquired_at,
            complete_at: step.complete_at,
            results: step.results,
            state_string: step.state_string,
            urls: step.urls,
            hidden: step.hidden,
        }
    }
}

impl StepView {
    pub fn topics(&self, event: &str) -> Vec<Topic> {
        vec![
            topic!("steps", self.stepid, event),
            topic!("builds", self.buildid, "steps", self.stepid, event),
        ]
    }
}

pub struct Steps<'a> {
    data: &'a DataConnector,
}

impl<'a> Steps<'a> {
    pub(crate) fn new(data: &'a DataConnector) -> Self {
        Self { data }
    }

    async fn publish(&self, id: StepId, event: &str) -> DataResult<()> {
        let view = self
            .get(id)
            .await?
            .ok_or_else(|| DataError::NotFound(format!("step {}", id)))?;
        let body = serde_json::to_value(&view)?;
        self.data.publish_all(view.topics(event), &body).await
    }

    /// Add a pending step to a build. Returns its id, number and stored name.
    pub async fn add(&self, buildid: BuildId, name: &str) -> DataResult<(StepId, i32, String)> {
        let (id, number, name) = self.data.store().add_step(buildid, name, "pending").await?;
        debug!(stepid = %id, buildid = %buildid, number, name = %name, "Added step");
        self.publish(id, "new").await?;
        Ok((id, number, name))
    }

    pub async fn start(
        &self,
        id: StepId,
        started_at: Option<DateTime<Utc>>,
        locks_acquired: bool,
    ) -> DataResult<()> {
        let started_at = started_at.unwrap_or_else(|| self.data.now());
        self.data
            .store()
            .start_step(id, started_at, locks_acquired)
            .await?;
        debug!(stepid = %id, locks_acquired, "Started step");
        self.publish(id, "started").await
    }

    pub async fn set_locks_acquired_at(
        &self,
        id: StepId,
        at: Option<DateTime<Utc>>,
    ) -> DataResult<()> {
        let at = at.unwrap_or_else(|| self.data.now());
        self.data.store().set_step_locks_acquired_at(id, at).await?;
        self.publish(id, "updated").await
    }

    pub async fn set_state_string(&self, id: StepId, state_string: &str) -> DataResult<()> {
        self.data
            .store()
            .set_step_state_string(id, state_string)
            .await?;
        self.publish(id, "updated").await
    }

    pub async fn add_url(&self, id: StepId, name: &str, url: &str) -> DataResult<()> {
        self.data.store().add_step_url(id, name, url).await?;
        self.publish(id, "updated").await
    }

    pub async fn finish(&self, id: StepId, results: Results, hidden: bool) -> DataResult<()> {
        self.data
            .store()
            .finish_step(id, results, hidden, self.data.now())
            .await?;
        info!(stepid = %id, results = %results, "Finished step");
        self.publish(id, "finished").await
    }

    pub async fn get(&self, id: StepId) -> DataResult<Option<StepView>> {
        Ok(self.data.store().get_step(id).await?.map(StepView::from))
    }

    /// Look up a step of a build by number or by name.
    pub async fn get_in_build(
        &self,
        buildid: BuildId,
        step: &Identifier,
    ) -> DataResult<Option<StepView>> {
        let found = match step {
            Identifier::Id(number) => match i32::try_from(*number) {
                Ok(number) => self.data.store().get_step_by_number(buildid, number).await?,
                Err(_) => None,
            },
            Identifier::Name(name) => self.data.store().get_step_by_name(buildid, name).await?,
        };
        Ok(found.map(StepView::from))
    }

    pub async fn list(&self, buildid: BuildId) -> DataResult<Vec<StepView>> {
        let steps = self.data.store().get_steps(buildid).await?;
        Ok(steps.into_iter().map(StepView::from).collect())
    }
}
