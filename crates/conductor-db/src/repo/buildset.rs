//! Buildsets, their source stamps and properties.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conductor_core::model::{Buildset, NewBuildset, NewSourceStamp, SourceStamp};
use conductor_core::{BuildRequestId, BuilderId, BuildsetId, Properties, Results, SourceStampId};

use super::PgStore;
use crate::{DbError, DbResult};

#[async_trait]
pub trait BuildsetRepo: Send + Sync {
    async fn add_sourcestamp(&self, sourcestamp: &NewSourceStamp) -> DbResult<SourceStampId>;
    /// Source stamps in the order of `ids`; unknown ids are skipped.
    async fn get_sourcestamps(&self, ids: &[SourceStampId]) -> DbResult<Vec<SourceStamp>>;
    /// Insert a buildset with its properties and one request per distinct builder.
    async fn add_buildset(
        &self,
        buildset: &NewBuildset,
    ) -> DbResult<(BuildsetId, BTreeMap<BuilderId, BuildRequestId>)>;
    async fn get_buildset(&self, id: BuildsetId) -> DbResult<Option<Buildset>>;
    async fn get_buildsets(&self, complete: Option<bool>) -> DbResult<Vec<Buildset>>;
    async fn get_buildset_properties(&self, id: BuildsetId) -> DbResult<Properties>;
    /// Mark a buildset complete. Returns `false` if it already was.
    async fn complete_buildset(
        &self,
        id: BuildsetId,
        results: Results,
        complete_at: DateTime<Utc>,
    ) -> DbResult<bool>;
}

/// Builder ids in first-seen order without repeats.
pub(crate) fn distinct_builders(builderids: &[BuilderId]) -> Vec<BuilderId> {
    let mut seen = Vec::with_capacity(builderids.len());
    for id in builderids {
        if !seen.contains(id) {
            seen.push(*id);
        }
    }
    seen
}

#[derive(sqlx::FromRow)]
struct SourceStampRow {
    id: i64,
    branch: Option<String>,
    revision: Option<String>,
    repository: Option<String>,
    project: Option<String>,
    codebase: Option<String>,
}

impl From<SourceStampRow> for SourceStamp {
    fn from(row: SourceStampRow) -> Self {
        SourceStamp {
            id: row.id.into(),
            branch: row.branch,
            revision: row.revision,
            repository: row.repository,
            project: row.project,
            codebase: row.codebase,
        }
    }
}

#[derive(sqlx::FromRow)]
struct BuildsetRow {
    id: i64,
    external_idstring: Option<String>,
    reason: Option<String>,
    submitted_at: DateTime<Utc>,
    complete: bool,
    complete_at: Option<DateTime<Utc>>,
    results: i32,
    parent_buildid: Option<i64>,
    parent_relationship: Option<String>,
    rebuilt_buildid: Option<i64>,
}

impl BuildsetRow {
    fn into_buildset(self, sourcestamps: Vec<SourceStampId>) -> Buildset {
        Buildset {
            id: self.id.into(),
            external_idstring: self.external_idstring,
            reason: self.reason,
            submitted_at: self.submitted_at,
            complete: self.complete,
            complete_at: self.complete_at,
            results: Results(self.results),
            parent_buildid: self.parent_buildid.map(Into::into),
            parent_relationship: self.parent_relationship,
            rebuilt_buildid: self.rebuilt_buildid.map(Into::into),
            sourcestamps,
        }
    }
}

#[derive(sqlx::FromRow)]
struct BuildsetSourceStampRow {
    buildsetid: i64,
    sourcestampid: i64,
}

const BUILDSET_COLUMNS: &str = "id, external_idstring, reason, submitted_at, complete, \
     complete_at, results, parent_buildid, parent_relationship, rebuilt_buildid";

impl PgStore {
    async fn sourcestamp_links(
        &self,
        buildsetids: &[i64],
    ) -> DbResult<HashMap<i64, Vec<SourceStampId>>> {
        let rows = sqlx::query_as::<_, BuildsetSourceStampRow>(
            r#"
            SELECT buildsetid, sourcestampid FROM buildset_sourcestamps
            WHERE buildsetid = ANY($1)
            ORDER BY buildsetid, position
            "#,
        )
        .bind(buildsetids)
        .fetch_all(&self.pool)
        .await?;

        let mut links: HashMap<i64, Vec<SourceStampId>> = HashMap::new();
        for row in rows {
            links
                .entry(row.buildsetid)
                .or_default()
                .push(row.sourcestampid.into());
        }
        Ok(links)
    }
}

#[async_trait]
impl BuildsetRepo for PgStore {
    async fn add_sourcestamp(&self, sourcestamp: &NewSourceStamp) -> DbResult<SourceStampId> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO sourcestamps (branch, revision, repository, project, codebase)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(&sourcestamp.branch)
        .bind(&sourcestamp.revision)
        .bind(&sourcestamp.repository)
        .bind(&sourcestamp.project)
        .bind(&sourcestamp.codebase)
        .fetch_one(&self.pool)
        .await?;
        Ok(id.into())
    }

    async fn get_sourcestamps(&self, ids: &[SourceStampId]) -> DbResult<Vec<SourceStamp>> {
        let raw: Vec<i64> = ids.iter().map(|id| id.get()).collect();
        let rows = sqlx::query_as::<_, SourceStampRow>(
            r#"
            SELECT id, branch, revision, repository, project, codebase
            FROM sourcestamps WHERE id = ANY($1)
            "#,
        )
        .bind(&raw)
        .fetch_all(&self.pool)
        .await?;

        let mut by_id: HashMap<i64, SourceStamp> = rows
            .into_iter()
            .map(|row| (row.id, SourceStamp::from(row)))
            .collect();
        Ok(raw.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    async fn add_buildset(
        &self,
        buildset: &NewBuildset,
    ) -> DbResult<(BuildsetId, BTreeMap<BuilderId, BuildRequestId>)> {
        let mut tx = self.pool.begin().await?;

        let bsid: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO buildsets
                (external_idstring, reason, submitted_at, complete, results,
                 parent_buildid, parent_relationship, rebuilt_buildid)
            VALUES ($1, $2, $3, FALSE, -1, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(&buildset.external_idstring)
        .bind(&buildset.reason)
        .bind(buildset.submitted_at)
        .bind(buildset.parent_buildid.map(|id| id.get()))
        .bind(&buildset.parent_relationship)
        .bind(buildset.rebuilt_buildid.map(|id| id.get()))
        .fetch_one(&mut *tx)
        .await?;

        for (position, ssid) in buildset.sourcestamps.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO buildset_sourcestamps (buildsetid, sourcestampid, position)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(bsid)
            .bind(ssid.get())
            .bind(position as i32)
            .execute(&mut *tx)
            .await?;
        }

        for (name, (value, source)) in buildset.properties.iter() {
            sqlx::query(
                r#"
                INSERT INTO buildset_properties (buildsetid, property_name, property_value)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(bsid)
            .bind(name)
            .bind(Properties::encode_entry(value, source))
            .execute(&mut *tx)
            .await?;
        }

        let mut brids = BTreeMap::new();
        for builderid in distinct_builders(&buildset.builderids) {
            let brid: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO buildrequests
                    (buildsetid, builderid, priority, complete, results, submitted_at, waited_for)
                VALUES ($1, $2, $3, FALSE, -1, $4, $5)
                RETURNING id
                "#,
            )
            .bind(bsid)
            .bind(builderid.get())
            .bind(buildset.priority)
            .bind(buildset.submitted_at)
            .bind(buildset.waited_for)
            .fetch_one(&mut *tx)
            .await?;
            brids.insert(builderid, BuildRequestId::from(brid));
        }

        tx.commit().await?;
        Ok((bsid.into(), brids))
    }

    async fn get_buildset(&self, id: BuildsetId) -> DbResult<Option<Buildset>> {
        let row = sqlx::query_as::<_, BuildsetRow>(&format!(
            "SELECT {BUILDSET_COLUMNS} FROM buildsets WHERE id = $1"
        ))
        .bind(id.get())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut links = self.sourcestamp_links(&[row.id]).await?;
        let sourcestamps = links.remove(&row.id).unwrap_or_default();
        Ok(Some(row.into_buildset(sourcestamps)))
    }

    async fn get_buildsets(&self, complete: Option<bool>) -> DbResult<Vec<Buildset>> {
        let rows = sqlx::query_as::<_, BuildsetRow>(&format!(
            "SELECT {BUILDSET_COLUMNS} FROM buildsets \
             WHERE ($1::BOOLEAN IS NULL OR complete = $1) ORDER BY id"
        ))
        .bind(complete)
        .fetch_all(&self.pool)
        .await?;

        let ids: Vec<i64> = rows.iter().map(|row| row.id).collect();
        let mut links = self.sourcestamp_links(&ids).await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let sourcestamps = links.remove(&row.id).unwrap_or_default();
                row.into_buildset(sourcestamps)
            })
            .collect())
    }

    async fn get_buildset_properties(&self, id: BuildsetId) -> DbResult<Properties> {
        let rows: Vec<(String, serde_json::Value)> = sqlx::query_as(
            r#"
            SELECT property_name, property_value FROM buildset_properties
            WHERE buildsetid = $1
            "#,
        )
        .bind(id.get())
        .fetch_all(&self.pool)
        .await?;

        let mut properties = Properties::new();
        for (name, raw) in rows {
            let (value, source) = Properties::decode_entry(&raw)?;
            properties.set(name, value, source);
        }
        Ok(properties)
    }

    async fn complete_buildset(
        &self,
        id: BuildsetId,
        results: Results,
        complete_at: DateTime<Utc>,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE buildsets SET complete = TRUE, results = $2, complete_at = $3
            WHERE id = $1 AND complete = FALSE
            "#,
        )
        .bind(id.get())
        .bind(results.get())
        .bind(complete_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.get_buildset(id).await? {
            Some(_) => Ok(false),
            None => Err(DbError::NotFound(format!("buildset {}", id))),
        }
    }
}
