//! Test harness: an in-memory store, event bus and manual clock.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use conductor_core::model::{Build, BuildRequest, Buildset, SourceStamp};
use conductor_core::{
    BuildId, BuildRequestId, BuilderId, BuildsetId, ManualClock, MasterId, Properties, Results,
    SourceStampId, WorkerId,
};
use conductor_db::{BuildRequestRepo, MemoryStore};
use conductor_mq::{EventBus, Subscription};
use serde_json::Value;

use crate::DataConnector;

pub(crate) const MASTER: i64 = 92;

pub(crate) fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap()
}

pub(crate) struct Harness {
    pub store: Arc<MemoryStore>,
    pub bus: Arc<EventBus>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        store.insert_master(MasterId::from(MASTER), "local");
        Self {
            store,
            bus: Arc::new(EventBus::new()),
            clock: Arc::new(ManualClock::default()),
        }
    }

    pub fn data(&self) -> DataConnector {
        DataConnector::new(
            self.store.clone(),
            self.bus.clone(),
            self.clock.clone(),
            self.masterid(),
        )
    }

    pub fn masterid(&self) -> MasterId {
        MasterId::from(MASTER)
    }

    pub fn events(&self, pattern: &str) -> Subscription {
        self.bus.subscribe_to(pattern).unwrap()
    }

    pub fn builder(&self, id: i64, name: &str) {
        self.store.insert_builder(BuilderId::from(id), name);
    }

    pub fn sourcestamp(&self, id: i64, branch: &str) {
        self.store.insert_sourcestamp(SourceStamp {
            id: SourceStampId::from(id),
            branch: Some(branch.to_string()),
            revision: Some("abcd".to_string()),
            repository: Some("git://repo".to_string()),
            project: Some("proj".to_string()),
            codebase: None,
        });
    }

    pub fn buildset(&self, id: i64, rebuilt_buildid: Option<i64>) {
        self.buildset_with_sourcestamps(id, rebuilt_buildid, &[]);
    }

    pub fn buildset_with_sourcestamps(
        &self,
        id: i64,
        rebuilt_buildid: Option<i64>,
        sourcestamps: &[i64],
    ) {
        self.store.insert_buildset(Buildset {
            id: BuildsetId::from(id),
            external_idstring: Some("extid".to_string()),
            reason: Some("because".to_string()),
            submitted_at: at(0),
            complete: false,
            complete_at: None,
            results: Results::NONE,
            parent_buildid: None,
            parent_relationship: None,
            rebuilt_buildid: rebuilt_buildid.map(BuildId::from),
            sourcestamps: sourcestamps.iter().copied().map(SourceStampId::from).collect(),
        });
    }

    pub fn properties(&self, bsid: i64, entries: &[(&str, Value, &str)]) {
        let mut properties = Properties::new();
        for (name, value, source) in entries {
            properties.set(*name, value.clone(), *source);
        }
        self.store
            .set_buildset_properties(BuildsetId::from(bsid), properties);
    }

    pub fn buildrequest(&self, id: i64, bsid: i64, builderid: i64) {
        self.store.insert_buildrequest(BuildRequest {
            id: BuildRequestId::from(id),
            buildsetid: BuildsetId::from(bsid),
            builderid: BuilderId::from(builderid),
            priority: 0,
            submitted_at: at(0),
            claimed_at: None,
            claimed_by_masterid: None,
            complete: false,
            complete_at: None,
            results: Results::NONE,
            waited_for: false,
        });
    }

    /// Claim a request on behalf of another master.
    pub async fn claim_by(&self, brid: i64, masterid: i64, claimed_at: i64) {
        self.store
            .claim_buildrequests(
                &[BuildRequestId::from(brid)],
                MasterId::from(masterid),
                at(claimed_at),
            )
            .await
            .unwrap();
    }

    pub fn build(&self, id: i64, builderid: i64, brid: i64, number: i32) {
        self.store.insert_build(Build {
            id: BuildId::from(id),
            number,
            builderid: BuilderId::from(builderid),
            buildrequestid: BuildRequestId::from(brid),
            workerid: WorkerId::from(13),
            masterid: self.masterid(),
            started_at: at(0),
            complete_at: None,
            state_string: "created".to_string(),
            results: None,
        });
    }
}
