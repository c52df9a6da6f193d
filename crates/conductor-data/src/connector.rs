//! The data connector: shared context for resource types and path queries.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use conductor_core::{BuilderId, Clock, MasterId};
use conductor_db::Store;
use conductor_mq::{Publisher, Topic};
use futures::future::try_join_all;
use serde::Serialize;
use serde_json::Value;

use crate::buildrequests::BuildRequests;
use crate::builds::Builds;
use crate::buildsets::Buildsets;
use crate::endpoint::{Identifier, Route};
use crate::resultspec::ResultSpec;
use crate::steps::Steps;
use crate::DataResult;

/// Outcome of a path query.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    None,
    One(Value),
    Many(Vec<Value>),
}

impl Resolved {
    pub fn one<T: Serialize>(entity: Option<T>) -> DataResult<Resolved> {
        Ok(match entity {
            Some(entity) => Resolved::One(serde_json::to_value(entity)?),
            None => Resolved::None,
        })
    }

    pub fn many<T: Serialize>(entities: Vec<T>, spec: &ResultSpec) -> DataResult<Resolved> {
        let values = entities
            .into_iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Resolved::Many(spec.apply(values)))
    }

    pub fn into_one(self) -> Option<Value> {
        match self {
            Resolved::One(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_many(self) -> Vec<Value> {
        match self {
            Resolved::Many(values) => values,
            Resolved::One(value) => vec![value],
            Resolved::None => Vec::new(),
        }
    }
}

/// Store, event bus and clock of one master, shared by every resource type.
#[derive(Clone)]
pub struct DataConnector {
    store: Arc<dyn Store>,
    mq: Arc<dyn Publisher>,
    clock: Arc<dyn Clock>,
    masterid: MasterId,
}

impl DataConnector {
    pub fn new(
        store: Arc<dyn Store>,
        mq: Arc<dyn Publisher>,
        clock: Arc<dyn Clock>,
        masterid: MasterId,
    ) -> Self {
        Self {
            store,
            mq,
            clock,
            masterid,
        }
    }

    pub fn masterid(&self) -> MasterId {
        self.masterid
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn buildrequests(&self) -> BuildRequests<'_> {
        BuildRequests::new(self)
    }

    pub fn buildsets(&self) -> Buildsets<'_> {
        Buildsets::new(self)
    }

    pub fn builds(&self) -> Builds<'_> {
        Builds::new(self)
    }

    pub fn steps(&self) -> Steps<'_> {
        Steps::new(self)
    }

    /// Publish one message to several topics.
    pub(crate) async fn publish_all(&self, topics: Vec<Topic>, body: &Value) -> DataResult<()> {
        try_join_all(
            topics
                .into_iter()
                .map(|topic| self.mq.publish(topic, body.clone())),
        )
        .await?;
        Ok(())
    }

    /// Builder id for a path segment; `None` if no such builder exists.
    pub(crate) async fn resolve_builder(
        &self,
        builder: &Identifier,
    ) -> DataResult<Option<BuilderId>> {
        let found = match builder {
            Identifier::Id(id) => self.store.get_builder(BuilderId::from(*id)).await?,
            Identifier::Name(name) => self.store.get_builder_by_name(name).await?,
        };
        Ok(found.map(|b| b.id))
    }

    /// Resolve a path such as `["builders", "linux", "buildrequests"]`.
    ///
    /// Missing entities resolve to [`Resolved::None`] or an empty list.
    pub async fn get(&self, path: &[&str], spec: &ResultSpec) -> DataResult<Resolved> {
        let route = Route::parse(path)?;
        let mut spec = spec.clone();
        match route {
            Route::BuildRequest(id) => {
                Resolved::one(self.buildrequests().get_with_properties(id, &spec.properties).await?)
            }
            Route::BuildRequests { builder } => {
                let builderid = match builder {
                    Some(builder) => match self.resolve_builder(&builder).await? {
                        Some(id) => Some(id),
                        None => return Ok(Resolved::Many(Vec::new())),
                    },
                    None => None,
                };
                let views = self.buildrequests().list(builderid, &mut spec).await?;
                Resolved::many(views, &spec)
            }
            Route::BuildRequestBuilds(id) => {
                let views = self.builds().list_for_buildrequest(id, &mut spec).await?;
                Resolved::many(views, &spec)
            }
            Route::Buildset(id) => Resolved::one(self.buildsets().get(id).await?),
            Route::Buildsets => {
                let views = self.buildsets().list(&mut spec).await?;
                Resolved::many(views, &spec)
            }
            Route::BuildsetProperties(id) => {
                Resolved::one(self.buildsets().properties(id).await?)
            }
            Route::Build(build) => Resolved::one(self.builds().get_by_ref(&build).await?),
            Route::Builds { builder } => {
                let builderid = match builder {
                    Some(builder) => match self.resolve_builder(&builder).await? {
                        Some(id) => Some(id),
                        None => return Ok(Resolved::Many(Vec::new())),
                    },
                    None => None,
                };
                let views = self.builds().list(builderid, &mut spec).await?;
                Resolved::many(views, &spec)
            }
            Route::Step(id) => Resolved::one(self.steps().get(id).await?),
            Route::Steps(build) => {
                let Some(build) = self.builds().get_by_ref(&build).await? else {
                    return Ok(Resolved::Many(Vec::new()));
                };
                let views = self.steps().list(build.buildid).await?;
                Resolved::many(views, &spec)
            }
            Route::BuildStep { build, step } => {
                let Some(build) = self.builds().get_by_ref(&build).await? else {
                    return Ok(Resolved::None);
                };
                Resolved::one(self.steps().get_in_build(build.buildid, &step).await?)
            }
        }
    }
}
