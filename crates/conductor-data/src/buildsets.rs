//! Buildset resource type.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use conductor_core::model::{Buildset, NewBuildset, SourceStamp};
use conductor_core::{
    BuildId, BuildRequestId, BuilderId, BuildsetId, Properties, Results, SourceStampId,
};
use conductor_db::BuildRequestQuery;
use conductor_mq::topic;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::resultspec::ResultSpec;
use crate::{DataConnector, DataResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceStampView {
    pub ssid: SourceStampId,
    pub branch: Option<String>,
    pub revision: Option<String>,
    pub repository: Option<String>,
    pub project: Option<String>,
    pub codebase: Option<String>,
}

impl From<SourceStamp> for SourceStampView {
    fn from(ss: SourceStamp) -> Self {
        Self {
            ssid: ss.id,
            branch: ss.branch,
            revision: ss.revision,
            repository: ss.repository,
            project: ss.project,
            codebase: ss.codebase,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildsetView {
    pub bsid: BuildsetId,
    pub external_idstring: Option<String>,
    pub reason: Option<String>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub submitted_at: DateTime<Utc>,
    pub complete: bool,
    #[serde(with = "chrono::serde::ts_seconds_option")]
    pub complete_at: Option<DateTime<Utc>>,
    pub results: Results,
    pub sourcestamps: Vec<SourceStampView>,
    pub parent_buildid: Option<BuildId>,
    pub parent_relationship: Option<String>,
    pub rebuilt_buildid: Option<BuildId>,
}

impl BuildsetView {
    fn new(buildset: Buildset, sourcestamps: Vec<SourceStamp>) -> Self {
        Self {
            bsid: buildset.id,
            external_idstring: buildset.external_idstring,
            reason: buildset.reason,
            submitted_at: buildset.submitted_at,
            complete: buildset.complete,
            complete_at: buildset.complete_at,
            results: buildset.results,
            sourcestamps: sourcestamps.into_iter().map(SourceStampView::from).collect(),
            parent_buildid: buildset.parent_buildid,
            parent_relationship: buildset.parent_relationship,
            rebuilt_buildid: buildset.rebuilt_buildid,
        }
    }
}

pub struct Buildsets<'a> {
    data: &'a DataConnector,
}

impl<'a> Buildsets<'a> {
    pub(crate) fn new(data: &'a DataConnector) -> Self {
        Self { data }
    }

    async fn view(&self, buildset: Buildset) -> DataResult<BuildsetView> {
        let sourcestamps = self
            .data
            .store()
            .get_sourcestamps(&buildset.sourcestamps)
            .await?;
        Ok(BuildsetView::new(buildset, sourcestamps))
    }

    pub async fn get(&self, id: BuildsetId) -> DataResult<Option<BuildsetView>> {
        match self.data.store().get_buildset(id).await? {
            Some(buildset) => Ok(Some(self.view(buildset).await?)),
            None => Ok(None),
        }
    }

    pub(crate) async fn list(&self, spec: &mut ResultSpec) -> DataResult<Vec<BuildsetView>> {
        let complete = spec.pop_boolean_filter("complete");
        let buildsets = self.data.store().get_buildsets(complete).await?;
        let mut views = Vec::with_capacity(buildsets.len());
        for buildset in buildsets {
            views.push(self.view(buildset).await?);
        }
        Ok(views)
    }

    /// Properties of a buildset; `None` if the buildset does not exist.
    pub async fn properties(&self, id: BuildsetId) -> DataResult<Option<Properties>> {
        if self.data.store().get_buildset(id).await?.is_none() {
            return Ok(None);
        }
        Ok(Some(self.data.store().get_buildset_properties(id).await?))
    }

    /// Insert a buildset and its requests, announcing both.
    pub async fn add(
        &self,
        buildset: &NewBuildset,
    ) -> DataResult<(BuildsetId, BTreeMap<BuilderId, BuildRequestId>)> {
        let (bsid, brids) = self.data.store().add_buildset(buildset).await?;
        info!(bsid = %bsid, requests = brids.len(), reason = ?buildset.reason, "Added buildset");

        if let Some(view) = self.get(bsid).await? {
            let body = serde_json::to_value(&view)?;
            self.data
                .publish_all(vec![topic!("buildsets", bsid, "new")], &body)
                .await?;
        }
        let ids: Vec<BuildRequestId> = brids.values().copied().collect();
        self.data.buildrequests().publish_event(&ids, "new").await?;
        Ok((bsid, brids))
    }

    /// Complete the buildset once every one of its requests is complete.
    ///
    /// The buildset takes the worst result of its requests. Returns whether
    /// this call completed it.
    pub async fn maybe_complete(&self, id: BuildsetId) -> DataResult<bool> {
        let store = self.data.store();
        let Some(buildset) = store.get_buildset(id).await? else {
            return Ok(false);
        };
        if buildset.complete {
            return Ok(false);
        }
        let requests = store
            .get_buildrequests(&BuildRequestQuery {
                buildsetid: Some(id),
                ..Default::default()
            })
            .await?;
        if requests.iter().any(|br| !br.complete) {
            debug!(bsid = %id, "Buildset still has incomplete requests");
            return Ok(false);
        }
        if requests.iter().any(|br| !br.results.is_terminal()) {
            warn!(bsid = %id, "Buildset has a completed request without a result");
            return Ok(false);
        }
        let results = requests
            .iter()
            .fold(Results::SUCCESS, |acc, br| acc.worst(br.results));

        if !store
            .complete_buildset(id, results, self.data.now())
            .await?
        {
            return Ok(false);
        }
        info!(bsid = %id, results = %results, "Completed buildset");

        if let Some(view) = self.get(id).await? {
            let body = serde_json::to_value(&view)?;
            self.data
                .publish_all(vec![topic!("buildsets", id, "complete")], &body)
                .await?;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{Harness, at};
    use serde_json::json;

    fn new_buildset(builderids: &[i64]) -> NewBuildset {
        let mut properties = Properties::new();
        properties.set("owner", json!("alice"), "force");
        NewBuildset {
            sourcestamps: vec![SourceStampId::from(234)],
            reason: Some("forced".to_string()),
            properties,
            builderids: builderids.iter().copied().map(BuilderId::from).collect(),
            waited_for: true,
            external_idstring: None,
            submitted_at: at(1000),
            parent_buildid: None,
            parent_relationship: None,
            priority: 5,
            rebuilt_buildid: None,
        }
    }

    #[tokio::test]
    async fn test_add_publishes_buildset_and_requests() {
        let h = Harness::new();
        h.builder(77, "builder77");
        h.builder(78, "builder78");
        h.sourcestamp(234, "main");
        let mut buildsets = h.events("buildsets.*.new");
        let mut requests = h.events("builders.*.buildrequests.*.new");

        let data = h.data();
        let (bsid, brids) = data.buildsets().add(&new_buildset(&[77, 78, 77])).await.unwrap();
        assert_eq!(brids.len(), 2);

        let published = buildsets.drain();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].body["bsid"], bsid.get());
        assert_eq!(published[0].body["submitted_at"], 1000);
        assert_eq!(published[0].body["sourcestamps"][0]["branch"], "main");

        let published = requests.drain();
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].body["priority"], 5);
        assert_eq!(published[0].body["waited_for"], true);

        let properties = data.buildsets().properties(bsid).await.unwrap().unwrap();
        assert_eq!(properties.get("owner").map(|(_, s)| s.as_str()), Some("force"));
    }

    #[tokio::test]
    async fn test_maybe_complete_waits_for_all_requests() {
        let h = Harness::new();
        h.builder(77, "builder77");
        h.builder(78, "builder78");
        h.buildset(8822, None);
        h.buildrequest(44, 8822, 77);
        h.buildrequest(45, 8822, 78);
        h.clock.set(at(5000));
        let data = h.data();
        let mut events = h.events("buildsets.*.complete");
        let ids = [BuildRequestId::from(44), BuildRequestId::from(45)];

        assert!(data.buildrequests().claim(&ids, None).await.unwrap());
        assert!(
            data.buildrequests()
                .complete(&ids[..1], Results::WARNINGS, None)
                .await
                .unwrap()
        );
        assert!(!data.buildsets().maybe_complete(BuildsetId::from(8822)).await.unwrap());

        assert!(
            data.buildrequests()
                .complete(&ids[1..], Results::FAILURE, None)
                .await
                .unwrap()
        );
        assert!(data.buildsets().maybe_complete(BuildsetId::from(8822)).await.unwrap());
        // Only once.
        assert!(!data.buildsets().maybe_complete(BuildsetId::from(8822)).await.unwrap());

        let view = data.buildsets().get(BuildsetId::from(8822)).await.unwrap().unwrap();
        assert!(view.complete);
        assert_eq!(view.results, Results::FAILURE);
        assert_eq!(view.complete_at, Some(at(5000)));

        let published = events.drain();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic.to_string(), "buildsets.8822.complete");
    }

    #[tokio::test]
    async fn test_maybe_complete_requires_terminal_result() {
        let h = Harness::new();
        h.builder(77, "builder77");
        h.builder(78, "builder78");
        h.buildset(8822, None);
        h.buildrequest(44, 8822, 77);
        h.buildrequest(45, 8822, 78);
        let data = h.data();
        let mut events = h.events("buildsets.*.complete");
        let ids = [BuildRequestId::from(44), BuildRequestId::from(45)];

        assert!(data.buildrequests().claim(&ids, None).await.unwrap());
        assert!(
            data.buildrequests()
                .complete(&ids[..1], Results::NONE, None)
                .await
                .unwrap()
        );
        assert!(
            data.buildrequests()
                .complete(&ids[1..], Results::SUCCESS, None)
                .await
                .unwrap()
        );
        assert!(!data.buildsets().maybe_complete(BuildsetId::from(8822)).await.unwrap());

        let view = data.buildsets().get(BuildsetId::from(8822)).await.unwrap().unwrap();
        assert!(!view.complete);
        assert!(events.drain().is_empty());
    }

    #[tokio::test]
    async fn test_list_and_missing() {
        let h = Harness::new();
        h.buildset(8821, None);
        h.buildset(8822, None);
        let data = h.data();

        let mut spec = ResultSpec::new();
        assert_eq!(data.buildsets().list(&mut spec).await.unwrap().len(), 2);

        assert!(data.buildsets().get(BuildsetId::from(1)).await.unwrap().is_none());
        assert!(data.buildsets().properties(BuildsetId::from(1)).await.unwrap().is_none());
        assert!(!data.buildsets().maybe_complete(BuildsetId::from(1)).await.unwrap());
    }
}
