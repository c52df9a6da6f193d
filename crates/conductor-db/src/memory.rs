//! In-memory store.
//!
//! Mirrors the PostgreSQL store's semantics behind a single mutex so the data
//! layer can be exercised without a database. The `insert_*` helpers seed rows
//! with explicit ids the way test fixtures need them.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conductor_core::model::{
    Build, BuildRequest, Builder, Buildset, Master, NewBuild, NewBuildset, NewSourceStamp,
    SourceStamp, Step, StepUrl,
};
use conductor_core::{
    BuildId, BuildRequestId, BuilderId, BuildsetId, MasterId, Properties, Results, SourceStampId,
    StepId,
};

use crate::repo::buildset::distinct_builders;
use crate::repo::{
    BuildQuery, BuildRepo, BuildRequestQuery, BuildRequestRepo, BuilderRepo, BuildsetRepo,
    ClaimedFilter, MasterRepo, StepRepo, unique_step_name,
};
use crate::{DbError, DbResult};

#[derive(Default)]
struct State {
    masters: BTreeMap<MasterId, Master>,
    builders: BTreeMap<BuilderId, Builder>,
    sourcestamps: BTreeMap<SourceStampId, SourceStamp>,
    buildsets: BTreeMap<BuildsetId, Buildset>,
    properties: HashMap<BuildsetId, Properties>,
    buildrequests: BTreeMap<BuildRequestId, BuildRequest>,
    builds: BTreeMap<BuildId, Build>,
    steps: BTreeMap<StepId, Step>,
    writes: usize,
    fail_next_write: Option<String>,
}

/// Next id after the largest key of a table.
fn next_id<K: Copy + Into<i64> + From<i64>, V>(table: &BTreeMap<K, V>) -> K {
    let last = table.keys().next_back().map(|k| (*k).into()).unwrap_or(0);
    K::from(last + 1)
}

impl State {
    fn buildset_matches(&self, buildsetid: BuildsetId, query: &BuildRequestQuery) -> bool {
        if query.branch.is_none() && query.repository.is_none() {
            return true;
        }
        let Some(buildset) = self.buildsets.get(&buildsetid) else {
            return false;
        };
        let stamps: Vec<&SourceStamp> = buildset
            .sourcestamps
            .iter()
            .filter_map(|id| self.sourcestamps.get(id))
            .collect();
        let branch_ok = query
            .branch
            .as_ref()
            .is_none_or(|b| stamps.iter().any(|ss| ss.branch.as_ref() == Some(b)));
        let repository_ok = query
            .repository
            .as_ref()
            .is_none_or(|r| stamps.iter().any(|ss| ss.repository.as_ref() == Some(r)));
        branch_ok && repository_ok
    }

    fn build_mut(&mut self, id: BuildId) -> DbResult<&mut Build> {
        self.builds
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("build {}", id)))
    }

    fn step_mut(&mut self, id: StepId) -> DbResult<&mut Step> {
        self.steps
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("step {}", id)))
    }
}

/// A store that keeps every row in process memory.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Lock for a mutation, failing if a failure was scheduled.
    fn write(&self) -> DbResult<MutexGuard<'_, State>> {
        let mut state = self.state();
        state.writes += 1;
        if let Some(message) = state.fail_next_write.take() {
            return Err(DbError::Backend(message));
        }
        Ok(state)
    }

    /// Make the next mutating call fail with a backend error.
    pub fn fail_next_write(&self, message: impl Into<String>) {
        self.state().fail_next_write = Some(message.into());
    }

    /// Number of mutating calls that reached the store.
    pub fn writes(&self) -> usize {
        self.state().writes
    }

    pub fn insert_master(&self, id: MasterId, name: &str) {
        let master = Master {
            id,
            name: name.to_string(),
        };
        self.state().masters.insert(id, master);
    }

    pub fn insert_builder(&self, id: BuilderId, name: &str) {
        let builder = Builder {
            id,
            name: name.to_string(),
        };
        self.state().builders.insert(id, builder);
    }

    pub fn insert_sourcestamp(&self, sourcestamp: SourceStamp) {
        self.state().sourcestamps.insert(sourcestamp.id, sourcestamp);
    }

    pub fn insert_buildset(&self, buildset: Buildset) {
        self.state().buildsets.insert(buildset.id, buildset);
    }

    pub fn set_buildset_properties(&self, id: BuildsetId, properties: Properties) {
        self.state().properties.insert(id, properties);
    }

    pub fn insert_buildrequest(&self, buildrequest: BuildRequest) {
        self.state()
            .buildrequests
            .insert(buildrequest.id, buildrequest);
    }

    pub fn insert_build(&self, build: Build) {
        self.state().builds.insert(build.id, build);
    }

    pub fn insert_step(&self, step: Step) {
        self.state().steps.insert(step.id, step);
    }
}

#[async_trait]
impl MasterRepo for MemoryStore {
    async fn find_master_id(&self, name: &str) -> DbResult<MasterId> {
        let mut state = self.write()?;
        if let Some(master) = state.masters.values().find(|m| m.name == name) {
            return Ok(master.id);
        }
        let id = next_id(&state.masters);
        state.masters.insert(
            id,
            Master {
                id,
                name: name.to_string(),
            },
        );
        Ok(id)
    }

    async fn get_master(&self, id: MasterId) -> DbResult<Option<Master>> {
        Ok(self.state().masters.get(&id).cloned())
    }
}

#[async_trait]
impl BuilderRepo for MemoryStore {
    async fn find_builder_id(&self, name: &str) -> DbResult<BuilderId> {
        let mut state = self.write()?;
        if let Some(builder) = state.builders.values().find(|b| b.name == name) {
            return Ok(builder.id);
        }
        let id = next_id(&state.builders);
        state.builders.insert(
            id,
            Builder {
                id,
                name: name.to_string(),
            },
        );
        Ok(id)
    }

    async fn get_builder(&self, id: BuilderId) -> DbResult<Option<Builder>> {
        Ok(self.state().builders.get(&id).cloned())
    }

    async fn get_builder_by_name(&self, name: &str) -> DbResult<Option<Builder>> {
        Ok(self
            .state()
            .builders
            .values()
            .find(|b| b.name == name)
            .cloned())
    }
}

#[async_trait]
impl BuildsetRepo for MemoryStore {
    async fn add_sourcestamp(&self, sourcestamp: &NewSourceStamp) -> DbResult<SourceStampId> {
        let mut state = self.write()?;
        let id = next_id(&state.sourcestamps);
        state.sourcestamps.insert(
            id,
            SourceStamp {
                id,
                branch: sourcestamp.branch.clone(),
                revision: sourcestamp.revision.clone(),
                repository: sourcestamp.repository.clone(),
                project: sourcestamp.project.clone(),
                codebase: sourcestamp.codebase.clone(),
            },
        );
        Ok(id)
    }

    async fn get_sourcestamps(&self, ids: &[SourceStampId]) -> DbResult<Vec<SourceStamp>> {
        let state = self.state();
        Ok(ids
            .iter()
            .filter_map(|id| state.sourcestamps.get(id).cloned())
            .collect())
    }

    async fn add_buildset(
        &self,
        buildset: &NewBuildset,
    ) -> DbResult<(BuildsetId, BTreeMap<BuilderId, BuildRequestId>)> {
        let mut state = self.write()?;
        let bsid = next_id(&state.buildsets);
        state.buildsets.insert(
            bsid,
            Buildset {
                id: bsid,
                external_idstring: buildset.external_idstring.clone(),
                reason: buildset.reason.clone(),
                submitted_at: buildset.submitted_at,
                complete: false,
                complete_at: None,
                results: Results::NONE,
                parent_buildid: buildset.parent_buildid,
                parent_relationship: buildset.parent_relationship.clone(),
                rebuilt_buildid: buildset.rebuilt_buildid,
                sourcestamps: buildset.sourcestamps.clone(),
            },
        );
        state.properties.insert(bsid, buildset.properties.clone());

        let mut brids = BTreeMap::new();
        for builderid in distinct_builders(&buildset.builderids) {
            let brid = next_id(&state.buildrequests);
            state.buildrequests.insert(
                brid,
                BuildRequest {
                    id: brid,
                    buildsetid: bsid,
                    builderid,
                    priority: buildset.priority,
                    submitted_at: buildset.submitted_at,
                    claimed_at: None,
                    claimed_by_masterid: None,
                    complete: false,
                    complete_at: None,
                    results: Results::NONE,
                    waited_for: buildset.waited_for,
                },
            );
            brids.insert(builderid, brid);
        }
        Ok((bsid, brids))
    }

    async fn get_buildset(&self, id: BuildsetId) -> DbResult<Option<Buildset>> {
        Ok(self.state().buildsets.get(&id).cloned())
    }

    async fn get_buildsets(&self, complete: Option<bool>) -> DbResult<Vec<Buildset>> {
        Ok(self
            .state()
            .buildsets
            .values()
            .filter(|bs| complete.is_none_or(|c| bs.complete == c))
            .cloned()
            .collect())
    }

    async fn get_buildset_properties(&self, id: BuildsetId) -> DbResult<Properties> {
        Ok(self
            .state()
            .properties
            .get(&id)
            .cloned()
            .unwrap_or_default())
    }

    async fn complete_buildset(
        &self,
        id: BuildsetId,
        results: Results,
        complete_at: DateTime<Utc>,
    ) -> DbResult<bool> {
        let mut state = self.write()?;
        let buildset = state
            .buildsets
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("buildset {}", id)))?;
        if buildset.complete {
            return Ok(false);
        }
        buildset.complete = true;
        buildset.results = results;
        buildset.complete_at = Some(complete_at);
        Ok(true)
    }
}

#[async_trait]
impl BuildRequestRepo for MemoryStore {
    async fn get_buildrequest(&self, id: BuildRequestId) -> DbResult<Option<BuildRequest>> {
        Ok(self.state().buildrequests.get(&id).cloned())
    }

    async fn get_buildrequests(&self, query: &BuildRequestQuery) -> DbResult<Vec<BuildRequest>> {
        let state = self.state();
        Ok(state
            .buildrequests
            .values()
            .filter(|br| query.builderid.is_none_or(|id| br.builderid == id))
            .filter(|br| query.buildsetid.is_none_or(|id| br.buildsetid == id))
            .filter(|br| query.complete.is_none_or(|c| br.complete == c))
            .filter(|br| match query.claimed {
                ClaimedFilter::Any => true,
                ClaimedFilter::Unclaimed => !br.claimed() && !br.complete,
                ClaimedFilter::Claimed => br.claimed(),
                ClaimedFilter::ByMaster(masterid) => br.claimed_by_masterid == Some(masterid),
            })
            .filter(|br| state.buildset_matches(br.buildsetid, query))
            .cloned()
            .collect())
    }

    async fn claim_buildrequests(
        &self,
        ids: &[BuildRequestId],
        masterid: MasterId,
        claimed_at: DateTime<Utc>,
    ) -> DbResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut state = self.write()?;
        let claimable = ids.iter().all(|id| {
            state
                .buildrequests
                .get(id)
                .is_some_and(|br| br.claimed_by_masterid.is_none_or(|m| m == masterid))
        });
        if !claimable {
            return Err(DbError::AlreadyClaimed(format!("{:?}", ids)));
        }
        for id in ids {
            if let Some(br) = state.buildrequests.get_mut(id) {
                br.claimed_at = Some(claimed_at);
                br.claimed_by_masterid = Some(masterid);
            }
        }
        Ok(())
    }

    async fn reclaim_buildrequests(
        &self,
        ids: &[BuildRequestId],
        masterid: MasterId,
        claimed_at: DateTime<Utc>,
    ) -> DbResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut state = self.write()?;
        let held = ids.iter().all(|id| {
            state
                .buildrequests
                .get(id)
                .is_some_and(|br| br.claimed_by_masterid == Some(masterid))
        });
        if !held {
            return Err(DbError::AlreadyClaimed(format!("{:?}", ids)));
        }
        for id in ids {
            if let Some(br) = state.buildrequests.get_mut(id) {
                br.claimed_at = Some(claimed_at);
            }
        }
        Ok(())
    }

    async fn unclaim_buildrequests(
        &self,
        ids: &[BuildRequestId],
        masterid: MasterId,
    ) -> DbResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut state = self.write()?;
        for id in ids {
            let Some(br) = state.buildrequests.get_mut(id) else {
                continue;
            };
            if !br.complete && br.claimed_by_masterid == Some(masterid) {
                br.claimed_at = None;
                br.claimed_by_masterid = None;
            }
        }
        Ok(())
    }

    async fn complete_buildrequests(
        &self,
        ids: &[BuildRequestId],
        masterid: MasterId,
        results: Results,
        complete_at: DateTime<Utc>,
    ) -> DbResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut state = self.write()?;
        let completable = ids.iter().all(|id| {
            state
                .buildrequests
                .get(id)
                .is_some_and(|br| !br.complete && br.claimed_by_masterid == Some(masterid))
        });
        if !completable {
            return Err(DbError::NotClaimed(format!("{:?}", ids)));
        }
        for id in ids {
            if let Some(br) = state.buildrequests.get_mut(id) {
                br.complete = true;
                br.results = results;
                br.complete_at = Some(complete_at);
            }
        }
        Ok(())
    }

    async fn unclaim_expired_buildrequests(
        &self,
        older_than: DateTime<Utc>,
    ) -> DbResult<Vec<BuildRequestId>> {
        let mut state = self.write()?;
        let mut released = Vec::new();
        for br in state.buildrequests.values_mut() {
            if !br.complete && br.claimed_at.is_some_and(|at| at < older_than) {
                br.claimed_at = None;
                br.claimed_by_masterid = None;
                released.push(br.id);
            }
        }
        Ok(released)
    }
}

#[async_trait]
impl BuildRepo for MemoryStore {
    async fn add_build(&self, build: &NewBuild) -> DbResult<(BuildId, i32)> {
        let mut state = self.write()?;
        if !state.builders.contains_key(&build.builderid) {
            return Err(DbError::NotFound(format!("builder {}", build.builderid)));
        }
        let number = state
            .builds
            .values()
            .filter(|b| b.builderid == build.builderid)
            .map(|b| b.number)
            .max()
            .unwrap_or(0)
            + 1;
        let id = next_id(&state.builds);
        state.builds.insert(
            id,
            Build {
                id,
                number,
                builderid: build.builderid,
                buildrequestid: build.buildrequestid,
                workerid: build.workerid,
                masterid: build.masterid,
                started_at: build.started_at,
                complete_at: None,
                state_string: build.state_string.clone(),
                results: None,
            },
        );
        Ok((id, number))
    }

    async fn get_build(&self, id: BuildId) -> DbResult<Option<Build>> {
        Ok(self.state().builds.get(&id).cloned())
    }

    async fn get_build_by_number(
        &self,
        builderid: BuilderId,
        number: i32,
    ) -> DbResult<Option<Build>> {
        Ok(self
            .state()
            .builds
            .values()
            .find(|b| b.builderid == builderid && b.number == number)
            .cloned())
    }

    async fn get_builds(&self, query: &BuildQuery) -> DbResult<Vec<Build>> {
        Ok(self
            .state()
            .builds
            .values()
            .filter(|b| query.builderid.is_none_or(|id| b.builderid == id))
            .filter(|b| query.buildrequestid.is_none_or(|id| b.buildrequestid == id))
            .filter(|b| query.complete.is_none_or(|c| b.complete_at.is_some() == c))
            .cloned()
            .collect())
    }

    async fn set_build_state_string(&self, id: BuildId, state_string: &str) -> DbResult<()> {
        let mut state = self.write()?;
        state.build_mut(id)?.state_string = state_string.to_string();
        Ok(())
    }

    async fn finish_build(
        &self,
        id: BuildId,
        results: Results,
        complete_at: DateTime<Utc>,
    ) -> DbResult<()> {
        let mut state = self.write()?;
        let build = state.build_mut(id)?;
        build.results = Some(results);
        build.complete_at = Some(complete_at);
        Ok(())
    }
}

#[async_trait]
impl StepRepo for MemoryStore {
    async fn add_step(
        &self,
        buildid: BuildId,
        name: &str,
        state_string: &str,
    ) -> DbResult<(StepId, i32, String)> {
        let mut state = self.write()?;
        if !state.builds.contains_key(&buildid) {
            return Err(DbError::NotFound(format!("build {}", buildid)));
        }
        let siblings: Vec<&Step> = state
            .steps
            .values()
            .filter(|s| s.buildid == buildid)
            .collect();
        let number = siblings
            .iter()
            .map(|s| s.number + 1)
            .max()
            .unwrap_or(0);
        let taken: HashSet<String> = siblings.iter().map(|s| s.name.clone()).collect();
        let name = unique_step_name(name, &taken);

        let id = next_id(&state.steps);
        state.steps.insert(
            id,
            Step {
                id,
                number,
                name: name.clone(),
                buildid,
                started_at: None,
                locks_acquired_at: None,
                complete_at: None,
                state_string: state_string.to_string(),
                results: None,
                urls: Vec::new(),
                hidden: false,
            },
        );
        Ok((id, number, name))
    }

    async fn get_step(&self, id: StepId) -> DbResult<Option<Step>> {
        Ok(self.state().steps.get(&id).cloned())
    }

    async fn get_step_by_number(&self, buildid: BuildId, number: i32) -> DbResult<Option<Step>> {
        Ok(self
            .state()
            .steps
            .values()
            .find(|s| s.buildid == buildid && s.number == number)
            .cloned())
    }

    async fn get_step_by_name(&self, buildid: BuildId, name: &str) -> DbResult<Option<Step>> {
        Ok(self
            .state()
            .steps
            .values()
            .find(|s| s.buildid == buildid && s.name == name)
            .cloned())
    }

    async fn get_steps(&self, buildid: BuildId) -> DbResult<Vec<Step>> {
        let mut steps: Vec<Step> = self
            .state()
            .steps
            .values()
            .filter(|s| s.buildid == buildid)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.number);
        Ok(steps)
    }

    async fn start_step(
        &self,
        id: StepId,
        started_at: DateTime<Utc>,
        locks_acquired: bool,
    ) -> DbResult<()> {
        let mut state = self.write()?;
        let step = state.step_mut(id)?;
        step.started_at.get_or_insert(started_at);
        if locks_acquired {
            step.locks_acquired_at = Some(started_at);
        }
        Ok(())
    }

    async fn set_step_locks_acquired_at(&self, id: StepId, at: DateTime<Utc>) -> DbResult<()> {
        let mut state = self.write()?;
        state.step_mut(id)?.locks_acquired_at = Some(at);
        Ok(())
    }

    async fn set_step_state_string(&self, id: StepId, state_string: &str) -> DbResult<()> {
        let mut state = self.write()?;
        state.step_mut(id)?.state_string = state_string.to_string();
        Ok(())
    }

    async fn add_step_url(&self, id: StepId, name: &str, url: &str) -> DbResult<()> {
        let mut state = self.write()?;
        state.step_mut(id)?.urls.push(StepUrl {
            name: name.to_string(),
            url: url.to_string(),
        });
        Ok(())
    }

    async fn finish_step(
        &self,
        id: StepId,
        results: Results,
        hidden: bool,
        complete_at: DateTime<Utc>,
    ) -> DbResult<()> {
        let mut state = self.write()?;
        let step = state.step_mut(id)?;
        step.results = Some(results);
        step.hidden = hidden;
        step.complete_at = Some(complete_at);
        Ok(())
    }
}
