//! Build request resource type: claim, unclaim, complete and rebuild.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use conductor_core::model::{BuildRequest, NewBuildset};
use conductor_core::{
    BuildRequestId, BuilderId, BuildsetId, MasterId, Properties, Results,
};
use conductor_db::{BuildQuery, BuildRequestQuery, ClaimedFilter, DbError};
use conductor_mq::{Topic, topic};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::resultspec::ResultSpec;
use crate::{DataConnector, DataError, DataResult};

/// Canonical representation of a build request, as published and queried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRequestView {
    pub buildrequestid: BuildRequestId,
    pub buildsetid: BuildsetId,
    pub builderid: BuilderId,
    pub priority: i32,
    pub claimed: bool,
    #[serde(with = "chrono::serde::ts_seconds_option")]
    pub claimed_at: Option<DateTime<Utc>>,
    pub claimed_by_masterid: Option<MasterId>,
    pub complete: bool,
    #[serde(with = "chrono::serde::ts_seconds_option")]
    pub complete_at: Option<DateTime<Utc>>,
    pub results: Results,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub submitted_at: DateTime<Utc>,
    pub waited_for: bool,
    /// Only populated when a query asks for properties.
    pub properties: Option<Properties>,
}

impl BuildRequestView {
    pub fn new(record: &BuildRequest, properties: Option<Properties>) -> Self {
        Self {
            buildrequestid: record.id,
            buildsetid: record.buildsetid,
            builderid: record.builderid,
            priority: record.priority,
            claimed: record.claimed(),
            claimed_at: record.claimed_at,
            claimed_by_masterid: record.claimed_by_masterid,
            complete: record.complete,
            complete_at: record.complete_at,
            results: record.results,
            submitted_at: record.submitted_at,
            waited_for: record.waited_for,
            properties,
        }
    }

    /// The flat, per-builder and per-buildset topics for `event`.
    pub fn topics(&self, event: &str) -> Vec<Topic> {
        let (brid, builderid, bsid) = (self.buildrequestid, self.builderid, self.buildsetid);
        vec![
            topic!("buildrequests", brid, event),
            topic!("builders", builderid, "buildrequests", brid, event),
            topic!("buildsets", bsid, "builders", builderid, "buildrequests", brid, event),
        ]
    }
}

/// Build request operations on behalf of the local master.
pub struct BuildRequests<'a> {
    data: &'a DataConnector,
}

impl<'a> BuildRequests<'a> {
    pub(crate) fn new(data: &'a DataConnector) -> Self {
        Self { data }
    }

    pub async fn get(&self, id: BuildRequestId) -> DataResult<Option<BuildRequestView>> {
        self.get_with_properties(id, &[]).await
    }

    /// Fetch one request, attaching the named buildset properties (`*` for all).
    pub async fn get_with_properties(
        &self,
        id: BuildRequestId,
        names: &[String],
    ) -> DataResult<Option<BuildRequestView>> {
        let Some(record) = self.data.store().get_buildrequest(id).await? else {
            return Ok(None);
        };
        let properties = self.properties_for(record.buildsetid, names).await?;
        Ok(Some(BuildRequestView::new(&record, properties)))
    }

    async fn properties_for(
        &self,
        buildsetid: BuildsetId,
        names: &[String],
    ) -> DataResult<Option<Properties>> {
        if names.is_empty() {
            return Ok(None);
        }
        let all = self.data.store().get_buildset_properties(buildsetid).await?;
        Ok(Some(all.select(names)))
    }

    /// Fetch requests, consuming the filters the store can evaluate from `spec`.
    pub(crate) async fn list(
        &self,
        builderid: Option<BuilderId>,
        spec: &mut ResultSpec,
    ) -> DataResult<Vec<BuildRequestView>> {
        // A builder named in the path wins over a builderid filter.
        let filtered = spec.pop_integer_filter("builderid").map(BuilderId::from);
        let builderid = builderid.or(filtered);
        let buildsetid = spec.pop_integer_filter("buildsetid").map(BuildsetId::from);
        let complete = spec.pop_boolean_filter("complete");
        // A master filter subsumes the claimed flag, which then stays a post-fetch filter.
        let claimed = match spec.pop_integer_filter("claimed_by_masterid") {
            Some(masterid) => ClaimedFilter::ByMaster(MasterId::from(masterid)),
            None => match spec.pop_boolean_filter("claimed") {
                Some(true) => ClaimedFilter::Claimed,
                Some(false) => ClaimedFilter::Unclaimed,
                None => ClaimedFilter::Any,
            },
        };
        let query = BuildRequestQuery {
            builderid,
            buildsetid,
            complete,
            claimed,
            branch: spec.pop_string_filter("branch"),
            repository: spec.pop_string_filter("repository"),
        };

        let records = self.data.store().get_buildrequests(&query).await?;
        let mut views = Vec::with_capacity(records.len());
        for record in &records {
            let properties = self.properties_for(record.buildsetid, &spec.properties).await?;
            views.push(BuildRequestView::new(record, properties));
        }
        Ok(views)
    }

    /// Publish `event` for each id with the three-topic fan-out.
    pub(crate) async fn publish_event(&self, ids: &[BuildRequestId], event: &str) -> DataResult<()> {
        for id in ids {
            let Some(view) = self.get(*id).await? else {
                continue;
            };
            let body = serde_json::to_value(&view)?;
            self.data.publish_all(view.topics(event), &body).await?;
        }
        Ok(())
    }

    /// Claim `ids` for the local master. `false` if any is held by another master.
    pub async fn claim(
        &self,
        ids: &[BuildRequestId],
        claimed_at: Option<DateTime<Utc>>,
    ) -> DataResult<bool> {
        if ids.is_empty() {
            return Ok(true);
        }
        let claimed_at = claimed_at.unwrap_or_else(|| self.data.now());
        let masterid = self.data.masterid();
        match self
            .data
            .store()
            .claim_buildrequests(ids, masterid, claimed_at)
            .await
        {
            Ok(()) => {}
            Err(DbError::AlreadyClaimed(_)) => {
                debug!(?ids, masterid = %masterid, "Build requests already claimed");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        }
        info!(?ids, masterid = %masterid, "Claimed build requests");
        self.publish_event(ids, "claimed").await?;
        Ok(true)
    }

    /// Refresh the claim timestamp on requests the local master holds.
    pub async fn reclaim(
        &self,
        ids: &[BuildRequestId],
        claimed_at: Option<DateTime<Utc>>,
    ) -> DataResult<bool> {
        if ids.is_empty() {
            return Ok(true);
        }
        let claimed_at = claimed_at.unwrap_or_else(|| self.data.now());
        match self
            .data
            .store()
            .reclaim_buildrequests(ids, self.data.masterid(), claimed_at)
            .await
        {
            Ok(()) => {
                debug!(?ids, "Reclaimed build requests");
                Ok(true)
            }
            Err(DbError::AlreadyClaimed(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Release the local master's claims on `ids`.
    pub async fn unclaim(&self, ids: &[BuildRequestId]) -> DataResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.data
            .store()
            .unclaim_buildrequests(ids, self.data.masterid())
            .await?;
        info!(?ids, "Unclaimed build requests");
        self.publish_event(ids, "unclaimed").await
    }

    /// Complete `ids` with `results`. `false` unless all are incomplete and
    /// claimed by the local master.
    pub async fn complete(
        &self,
        ids: &[BuildRequestId],
        results: Results,
        complete_at: Option<DateTime<Utc>>,
    ) -> DataResult<bool> {
        if ids.is_empty() {
            return Ok(true);
        }
        let complete_at = complete_at.unwrap_or_else(|| self.data.now());
        match self
            .data
            .store()
            .complete_buildrequests(ids, self.data.masterid(), results, complete_at)
            .await
        {
            Ok(()) => {}
            Err(DbError::NotClaimed(_)) => {
                debug!(?ids, "Build requests not claimed by this master");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        }
        info!(?ids, results = %results, "Completed build requests");
        self.publish_event(ids, "completed").await?;
        Ok(true)
    }

    /// Release claims of any master older than `expiry`.
    pub async fn unclaim_expired(&self, expiry: Duration) -> DataResult<Vec<BuildRequestId>> {
        let older_than = self.data.now() - expiry;
        let ids = self
            .data
            .store()
            .unclaim_expired_buildrequests(older_than)
            .await?;
        if !ids.is_empty() {
            warn!(?ids, %older_than, "Released expired build request claims");
            self.publish_event(&ids, "unclaimed").await?;
        }
        Ok(ids)
    }

    /// Submit a new buildset re-running `buildrequest`'s buildset.
    ///
    /// Returns the new buildset id and a request id per builder.
    pub async fn rebuild(
        &self,
        buildrequest: &BuildRequestView,
    ) -> DataResult<(BuildsetId, BTreeMap<BuilderId, BuildRequestId>)> {
        let store = self.data.store();
        let buildset = store
            .get_buildset(buildrequest.buildsetid)
            .await?
            .ok_or_else(|| DataError::NotFound(format!("buildset {}", buildrequest.buildsetid)))?;
        let properties = store.get_buildset_properties(buildset.id).await?;

        let siblings = store
            .get_buildrequests(&BuildRequestQuery {
                buildsetid: Some(buildset.id),
                ..Default::default()
            })
            .await?;
        let mut builderids: Vec<BuilderId> = Vec::new();
        for sibling in &siblings {
            if !builderids.contains(&sibling.builderid) {
                builderids.push(sibling.builderid);
            }
        }

        // Keep pointing at the earliest ancestor when this buildset is itself a rebuild.
        let rebuilt_buildid = match buildset.rebuilt_buildid {
            Some(ancestor) => Some(ancestor),
            None => store
                .get_builds(&BuildQuery {
                    buildrequestid: Some(buildrequest.buildrequestid),
                    ..Default::default()
                })
                .await?
                .iter()
                .map(|build| build.id)
                .max(),
        };

        let new_buildset = NewBuildset {
            sourcestamps: buildset.sourcestamps.clone(),
            reason: Some("rebuild".to_string()),
            properties,
            builderids,
            waited_for: false,
            external_idstring: buildset.external_idstring.clone(),
            submitted_at: self.data.now(),
            parent_buildid: None,
            parent_relationship: None,
            priority: buildrequest.priority,
            rebuilt_buildid,
        };
        let (bsid, brids) = self.data.buildsets().add(&new_buildset).await?;
        info!(
            buildrequestid = %buildrequest.buildrequestid,
            bsid = %bsid,
            rebuilt_buildid = ?rebuilt_buildid,
            "Rebuilt build request"
        );
        Ok((bsid, brids))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{Harness, at};
    use conductor_core::BuildId;
    use serde_json::json;

    const T1: i64 = 266761875;
    const T2: i64 = 329920275;

    fn brids(raw: &[i64]) -> Vec<BuildRequestId> {
        raw.iter().copied().map(BuildRequestId::from).collect()
    }

    fn seeded() -> Harness {
        let h = Harness::new();
        h.builder(77, "builder77");
        h.builder(78, "builder78");
        h.buildset(8822, None);
        h.buildrequest(44, 8822, 77);
        h.buildrequest(45, 8822, 78);
        h
    }

    #[tokio::test]
    async fn test_claim_then_complete() {
        let h = seeded();
        let data = h.data();
        let mut events = h.events("buildrequests.*.*");

        let claimed = data
            .buildrequests()
            .claim(&brids(&[44]), Some(at(T1)))
            .await
            .unwrap();
        assert!(claimed);

        let completed = data
            .buildrequests()
            .complete(&brids(&[44]), Results(75), Some(at(T2)))
            .await
            .unwrap();
        assert!(completed);

        let view = data.buildrequests().get(brids(&[44])[0]).await.unwrap().unwrap();
        assert!(view.complete);
        assert!(view.claimed);
        assert_eq!(view.results, Results(75));
        assert_eq!(view.claimed_by_masterid, Some(h.masterid()));
        assert_eq!(view.claimed_at, Some(at(T1)));
        assert_eq!(view.complete_at, Some(at(T2)));

        let topics: Vec<String> = events.drain().iter().map(|m| m.topic.to_string()).collect();
        assert_eq!(
            topics,
            vec!["buildrequests.44.claimed", "buildrequests.44.completed"]
        );
    }

    #[tokio::test]
    async fn test_claim_publishes_to_three_topics() {
        let h = seeded();
        let mut flat = h.events("buildrequests.*.claimed");
        let mut by_builder = h.events("builders.*.buildrequests.*.claimed");
        let mut by_buildset = h.events("buildsets.*.builders.*.buildrequests.*.claimed");

        assert!(
            h.data()
                .buildrequests()
                .claim(&brids(&[44]), Some(at(T1)))
                .await
                .unwrap()
        );

        let flat = flat.drain();
        let by_builder = by_builder.drain();
        let by_buildset = by_buildset.drain();
        assert_eq!(flat.len(), 1);
        assert_eq!(by_builder[0].topic.to_string(), "builders.77.buildrequests.44.claimed");
        assert_eq!(
            by_buildset[0].topic.to_string(),
            "buildsets.8822.builders.77.buildrequests.44.claimed"
        );
        assert_eq!(flat[0].body, by_builder[0].body);
        assert_eq!(flat[0].body, by_buildset[0].body);

        assert_eq!(
            flat[0].body,
            json!({
                "buildrequestid": 44,
                "buildsetid": 8822,
                "builderid": 77,
                "priority": 0,
                "claimed": true,
                "claimed_at": T1,
                "claimed_by_masterid": h.masterid().get(),
                "complete": false,
                "complete_at": null,
                "results": -1,
                "submitted_at": 0,
                "waited_for": false,
                "properties": null,
            })
        );
    }

    #[tokio::test]
    async fn test_claim_already_claimed_by_other_master() {
        let h = seeded();
        h.claim_by(45, 99, T1).await;
        let mut events = h.events("buildrequests.*.*");

        let claimed = h
            .data()
            .buildrequests()
            .claim(&brids(&[44, 45]), Some(at(T2)))
            .await
            .unwrap();
        assert!(!claimed);
        assert!(events.drain().is_empty());

        let view = h.data().buildrequests().get(brids(&[44])[0]).await.unwrap().unwrap();
        assert!(!view.claimed, "Claim must be all-or-nothing");
    }

    #[tokio::test]
    async fn test_empty_lists_touch_nothing() {
        let h = seeded();
        let data = h.data();
        let mut events = h.events("buildrequests.*.*");

        assert!(data.buildrequests().claim(&[], None).await.unwrap());
        data.buildrequests().unclaim(&[]).await.unwrap();
        assert!(
            data.buildrequests()
                .complete(&[], Results::SUCCESS, None)
                .await
                .unwrap()
        );

        assert_eq!(h.store.writes(), 0);
        assert!(events.drain().is_empty());
    }

    #[tokio::test]
    async fn test_claim_store_failure_propagates() {
        let h = seeded();
        let mut events = h.events("buildrequests.*.*");
        h.store.fail_next_write("connection reset");

        let err = h
            .data()
            .buildrequests()
            .claim(&brids(&[44]), None)
            .await
            .unwrap_err();
        assert!(matches!(err, DataError::Db(DbError::Backend(_))));
        assert!(events.drain().is_empty());
    }

    #[tokio::test]
    async fn test_unclaim() {
        let h = seeded();
        let data = h.data();
        assert!(
            data.buildrequests()
                .claim(&brids(&[44]), Some(at(T1)))
                .await
                .unwrap()
        );
        let mut events = h.events("buildrequests.*.unclaimed");

        data.buildrequests().unclaim(&brids(&[44])).await.unwrap();
        // Already unclaimed: still fine.
        data.buildrequests().unclaim(&brids(&[44])).await.unwrap();

        let view = data.buildrequests().get(brids(&[44])[0]).await.unwrap().unwrap();
        assert!(!view.claimed);
        assert_eq!(view.claimed_at, None);
        assert_eq!(view.claimed_by_masterid, None);

        let published = events.drain();
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].body["claimed"], false);
    }

    #[tokio::test]
    async fn test_complete_not_claimed() {
        let h = seeded();
        let data = h.data();
        let mut events = h.events("buildrequests.*.completed");

        let completed = data
            .buildrequests()
            .complete(&brids(&[44]), Results::SUCCESS, None)
            .await
            .unwrap();
        assert!(!completed);
        assert!(events.drain().is_empty());

        // Held by another master.
        h.claim_by(45, 99, T1).await;
        let completed = data
            .buildrequests()
            .complete(&brids(&[45]), Results::SUCCESS, None)
            .await
            .unwrap();
        assert!(!completed);
    }

    #[tokio::test]
    async fn test_complete_store_failure_propagates() {
        let h = seeded();
        let data = h.data();
        assert!(data.buildrequests().claim(&brids(&[44]), None).await.unwrap());
        h.store.fail_next_write("deadlock");

        let err = data
            .buildrequests()
            .complete(&brids(&[44]), Results::SUCCESS, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DataError::Db(DbError::Backend(_))));
    }

    #[tokio::test]
    async fn test_reclaim() {
        let h = seeded();
        let data = h.data();
        assert!(data.buildrequests().claim(&brids(&[44]), Some(at(T1))).await.unwrap());

        assert!(data.buildrequests().reclaim(&brids(&[44]), Some(at(T2))).await.unwrap());
        let view = data.buildrequests().get(brids(&[44])[0]).await.unwrap().unwrap();
        assert_eq!(view.claimed_at, Some(at(T2)));

        // 45 is not ours.
        assert!(!data.buildrequests().reclaim(&brids(&[44, 45]), None).await.unwrap());
    }

    #[tokio::test]
    async fn test_unclaim_expired() {
        let h = seeded();
        h.clock.set(at(10_000));
        h.claim_by(44, 99, 1_000).await;
        h.claim_by(45, 99, 9_500).await;
        let mut events = h.events("buildrequests.*.unclaimed");

        let released = h
            .data()
            .buildrequests()
            .unclaim_expired(Duration::seconds(3600))
            .await
            .unwrap();
        assert_eq!(released, brids(&[44]));
        assert_eq!(events.drain().len(), 1);
    }

    #[tokio::test]
    async fn test_get_with_properties() {
        let h = seeded();
        h.properties(
            8822,
            &[("prop1", json!("one"), "fake1"), ("prop2", json!("two"), "fake2")],
        );

        let view = h
            .data()
            .buildrequests()
            .get_with_properties(brids(&[44])[0], &["prop1".to_string()])
            .await
            .unwrap()
            .unwrap();
        let properties = view.properties.unwrap();
        assert_eq!(properties.len(), 1);
        assert_eq!(
            properties.get("prop1"),
            Some(&(json!("one"), "fake1".to_string()))
        );

        let view = h
            .data()
            .buildrequests()
            .get_with_properties(brids(&[44])[0], &["*".to_string()])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(view.properties.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_rebuild_copies_buildset() {
        let h = seeded();
        h.sourcestamp(234, "main");
        h.buildset_with_sourcestamps(8822, None, &[234]);
        h.properties(8822, &[("prop1", json!("one"), "fake1")]);
        let data = h.data();

        let original = data.buildrequests().get(brids(&[44])[0]).await.unwrap().unwrap();
        let (bsid, new_brids) = data.buildrequests().rebuild(&original).await.unwrap();

        assert_eq!(
            new_brids.keys().copied().collect::<Vec<_>>(),
            vec![BuilderId::from(77), BuilderId::from(78)]
        );
        let buildset = data.buildsets().get(bsid).await.unwrap().unwrap();
        assert_eq!(buildset.reason.as_deref(), Some("rebuild"));
        assert_eq!(buildset.external_idstring.as_deref(), Some("extid"));
        assert_eq!(buildset.rebuilt_buildid, None);
        assert_eq!(buildset.sourcestamps.len(), 1);
        assert_eq!(buildset.sourcestamps[0].ssid.get(), 234);

        let properties = data.buildsets().properties(bsid).await.unwrap().unwrap();
        assert_eq!(properties.get("prop1").map(|(v, _)| v.clone()), Some(json!("one")));

        let request = data
            .buildrequests()
            .get(new_brids[&BuilderId::from(77)])
            .await
            .unwrap()
            .unwrap();
        assert!(!request.claimed);
        assert!(!request.complete);
        assert!(!request.waited_for);
        assert_eq!(request.results, Results::NONE);
    }

    #[tokio::test]
    async fn test_rebuild_points_at_latest_build() {
        let h = seeded();
        h.build(123, 77, 44, 1);
        let data = h.data();

        let original = data.buildrequests().get(brids(&[44])[0]).await.unwrap().unwrap();
        let (bsid, _) = data.buildrequests().rebuild(&original).await.unwrap();
        let buildset = data.buildsets().get(bsid).await.unwrap().unwrap();
        assert_eq!(buildset.rebuilt_buildid, Some(BuildId::from(123)));
    }

    #[tokio::test]
    async fn test_rebuild_keeps_earliest_ancestor() {
        let h = Harness::new();
        h.builder(77, "builder77");
        h.buildset(8821, None);
        h.buildset(8822, Some(122));
        h.buildrequest(81, 8821, 77);
        h.buildrequest(82, 8822, 77);
        h.build(122, 77, 81, 1);
        h.build(123, 77, 82, 2);
        let data = h.data();

        let original = data.buildrequests().get(brids(&[82])[0]).await.unwrap().unwrap();
        let (bsid, new_brids) = data.buildrequests().rebuild(&original).await.unwrap();
        assert_eq!(new_brids.len(), 1);

        let buildset = data.buildsets().get(bsid).await.unwrap().unwrap();
        assert_eq!(buildset.rebuilt_buildid, Some(BuildId::from(122)));
    }

    #[tokio::test]
    async fn test_concurrent_claims_from_two_masters() {
        let h = seeded();
        h.store.insert_master(MasterId::from(99), "remote");
        let mut events = h.events("buildrequests.*.claimed");
        let ours = h.data();
        let theirs = DataConnector::new(
            h.store.clone(),
            h.bus.clone(),
            h.clock.clone(),
            MasterId::from(99),
        );
        let ids = brids(&[44, 45]);
        let (mine, other) = (ours.buildrequests(), theirs.buildrequests());

        let (a, b) = tokio::join!(
            mine.claim(&ids, Some(at(T1))),
            other.claim(&ids, Some(at(T1))),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(a ^ b, "exactly one master wins: ours={} theirs={}", a, b);

        let winner = if a { ours.masterid() } else { MasterId::from(99) };
        for id in &ids {
            let view = ours.buildrequests().get(*id).await.unwrap().unwrap();
            assert_eq!(view.claimed_by_masterid, Some(winner));
        }
        assert_eq!(events.drain().len(), 2);
    }

    #[tokio::test]
    async fn test_rebuild_publishes_new_events() {
        let h = seeded();
        let mut buildsets = h.events("buildsets.*.new");
        let mut requests = h.events("buildrequests.*.new");
        let data = h.data();

        let original = data.buildrequests().get(brids(&[44])[0]).await.unwrap().unwrap();
        let (bsid, _) = data.buildrequests().rebuild(&original).await.unwrap();

        let published = buildsets.drain();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].body["bsid"], bsid.get());
        assert_eq!(requests.drain().len(), 2);
    }
}
