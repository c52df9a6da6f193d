//! Builds.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conductor_core::model::{Build, NewBuild};
use conductor_core::{BuildId, BuildRequestId, BuilderId, Results};
use sqlx::{Postgres, QueryBuilder};

use super::PgStore;
use crate::{DbError, DbResult};

/// Filters the store applies when listing builds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildQuery {
    pub builderid: Option<BuilderId>,
    pub buildrequestid: Option<BuildRequestId>,
    pub complete: Option<bool>,
}

#[async_trait]
pub trait BuildRepo: Send + Sync {
    /// Insert a build, numbered after the builder's latest build (starting at 1).
    async fn add_build(&self, build: &NewBuild) -> DbResult<(BuildId, i32)>;
    async fn get_build(&self, id: BuildId) -> DbResult<Option<Build>>;
    async fn get_build_by_number(
        &self,
        builderid: BuilderId,
        number: i32,
    ) -> DbResult<Option<Build>>;
    async fn get_builds(&self, query: &BuildQuery) -> DbResult<Vec<Build>>;
    async fn set_build_state_string(&self, id: BuildId, state_string: &str) -> DbResult<()>;
    async fn finish_build(
        &self,
        id: BuildId,
        results: Results,
        complete_at: DateTime<Utc>,
    ) -> DbResult<()>;
}

#[derive(sqlx::FromRow)]
struct BuildRow {
    id: i64,
    number: i32,
    builderid: i64,
    buildrequestid: i64,
    workerid: i64,
    masterid: i64,
    started_at: DateTime<Utc>,
    complete_at: Option<DateTime<Utc>>,
    state_string: String,
    results: Option<i32>,
}

impl From<BuildRow> for Build {
    fn from(row: BuildRow) -> Self {
        Build {
            id: row.id.into(),
            number: row.number,
            builderid: row.builderid.into(),
            buildrequestid: row.buildrequestid.into(),
            workerid: row.workerid.into(),
            masterid: row.masterid.into(),
            started_at: row.started_at,
            complete_at: row.complete_at,
            state_string: row.state_string,
            results: row.results.map(Results),
        }
    }
}

const SELECT_BUILDS: &str = r#"
    SELECT id, number, builderid, buildrequestid, workerid, masterid,
           started_at, complete_at, state_string, results
    FROM builds
    WHERE TRUE
"#;

#[async_trait]
impl BuildRepo for PgStore {
    async fn add_build(&self, build: &NewBuild) -> DbResult<(BuildId, i32)> {
        let mut tx = self.pool.begin().await?;

        // Serialize numbering per builder.
        sqlx::query_scalar::<_, i64>("SELECT id FROM builders WHERE id = $1 FOR UPDATE")
            .bind(build.builderid.get())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("builder {}", build.builderid)))?;

        let (id, number): (i64, i32) = sqlx::query_as(
            r#"
            INSERT INTO builds
                (number, builderid, buildrequestid, workerid, masterid, started_at, state_string)
            SELECT COALESCE(MAX(number), 0) + 1, $1, $2, $3, $4, $5, $6
            FROM builds WHERE builderid = $1
            RETURNING id, number
            "#,
        )
        .bind(build.builderid.get())
        .bind(build.buildrequestid.get())
        .bind(build.workerid.get())
        .bind(build.masterid.get())
        .bind(build.started_at)
        .bind(&build.state_string)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((id.into(), number))
    }

    async fn get_build(&self, id: BuildId) -> DbResult<Option<Build>> {
        let row = sqlx::query_as::<_, BuildRow>(&format!("{SELECT_BUILDS} AND id = $1"))
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Build::from))
    }

    async fn get_build_by_number(
        &self,
        builderid: BuilderId,
        number: i32,
    ) -> DbResult<Option<Build>> {
        let row = sqlx::query_as::<_, BuildRow>(&format!(
            "{SELECT_BUILDS} AND builderid = $1 AND number = $2"
        ))
        .bind(builderid.get())
        .bind(number)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Build::from))
    }

    async fn get_builds(&self, query: &BuildQuery) -> DbResult<Vec<Build>> {
        let mut builder = QueryBuilder::<Postgres>::new(SELECT_BUILDS);
        if let Some(builderid) = query.builderid {
            builder.push(" AND builderid = ").push_bind(builderid.get());
        }
        if let Some(buildrequestid) = query.buildrequestid {
            builder
                .push(" AND buildrequestid = ")
                .push_bind(buildrequestid.get());
        }
        match query.complete {
            Some(true) => {
                builder.push(" AND complete_at IS NOT NULL");
            }
            Some(false) => {
                builder.push(" AND complete_at IS NULL");
            }
            None => {}
        }
        builder.push(" ORDER BY id");

        let rows = builder
            .build_query_as::<BuildRow>()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Build::from).collect())
    }

    async fn set_build_state_string(&self, id: BuildId, state_string: &str) -> DbResult<()> {
        let result = sqlx::query("UPDATE builds SET state_string = $2 WHERE id = $1")
            .bind(id.get())
            .bind(state_string)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("build {}", id)));
        }
        Ok(())
    }

    async fn finish_build(
        &self,
        id: BuildId,
        results: Results,
        complete_at: DateTime<Utc>,
    ) -> DbResult<()> {
        let result = sqlx::query("UPDATE builds SET results = $2, complete_at = $3 WHERE id = $1")
            .bind(id.get())
            .bind(results.get())
            .bind(complete_at)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("build {}", id)));
        }
        Ok(())
    }
}
