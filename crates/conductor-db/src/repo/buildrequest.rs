//! Build requests and their claims.
//!
//! A claim is one row in `buildrequest_claims` keyed by the request id. The
//! primary key is the only cross-master lock: a claim either inserts the row or
//! refreshes a row the same master already owns, all inside one transaction
//! whose affected-row count must match the requested ids.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conductor_core::model::BuildRequest;
use conductor_core::{BuildRequestId, BuilderId, BuildsetId, MasterId, Results};
use sqlx::{Postgres, QueryBuilder};
use tracing::debug;

use super::{PgStore, distinct_ids};
use crate::{DbError, DbResult};

/// Which claim state a build request query selects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ClaimedFilter {
    #[default]
    Any,
    /// Unclaimed and incomplete.
    Unclaimed,
    Claimed,
    ByMaster(MasterId),
}

/// Filters the store applies when listing build requests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildRequestQuery {
    pub builderid: Option<BuilderId>,
    pub buildsetid: Option<BuildsetId>,
    pub complete: Option<bool>,
    pub claimed: ClaimedFilter,
    /// Matches any source stamp of the owning buildset.
    pub branch: Option<String>,
    pub repository: Option<String>,
}

#[async_trait]
pub trait BuildRequestRepo: Send + Sync {
    async fn get_buildrequest(&self, id: BuildRequestId) -> DbResult<Option<BuildRequest>>;
    async fn get_buildrequests(&self, query: &BuildRequestQuery) -> DbResult<Vec<BuildRequest>>;

    /// Claim every id for `masterid`, or none of them (`AlreadyClaimed`).
    async fn claim_buildrequests(
        &self,
        ids: &[BuildRequestId],
        masterid: MasterId,
        claimed_at: DateTime<Utc>,
    ) -> DbResult<()>;

    /// Refresh `claimed_at` on ids all held by `masterid`, or none (`AlreadyClaimed`).
    async fn reclaim_buildrequests(
        &self,
        ids: &[BuildRequestId],
        masterid: MasterId,
        claimed_at: DateTime<Utc>,
    ) -> DbResult<()>;

    /// Release claims `masterid` holds on incomplete requests. Other ids are ignored.
    async fn unclaim_buildrequests(&self, ids: &[BuildRequestId], masterid: MasterId)
    -> DbResult<()>;

    /// Complete every id, or none of them (`NotClaimed`) unless all are
    /// incomplete and held by `masterid`.
    async fn complete_buildrequests(
        &self,
        ids: &[BuildRequestId],
        masterid: MasterId,
        results: Results,
        complete_at: DateTime<Utc>,
    ) -> DbResult<()>;

    /// Release claims by any master on incomplete requests claimed before `older_than`.
    async fn unclaim_expired_buildrequests(
        &self,
        older_than: DateTime<Utc>,
    ) -> DbResult<Vec<BuildRequestId>>;
}

#[derive(sqlx::FromRow)]
struct BuildRequestRow {
    id: i64,
    buildsetid: i64,
    builderid: i64,
    priority: i32,
    submitted_at: DateTime<Utc>,
    claimed_at: Option<DateTime<Utc>>,
    claimed_by_masterid: Option<i64>,
    complete: bool,
    complete_at: Option<DateTime<Utc>>,
    results: i32,
    waited_for: bool,
}

impl From<BuildRequestRow> for BuildRequest {
    fn from(row: BuildRequestRow) -> Self {
        BuildRequest {
            id: row.id.into(),
            buildsetid: row.buildsetid.into(),
            builderid: row.builderid.into(),
            priority: row.priority,
            submitted_at: row.submitted_at,
            claimed_at: row.claimed_at,
            claimed_by_masterid: row.claimed_by_masterid.map(Into::into),
            complete: row.complete,
            complete_at: row.complete_at,
            results: Results(row.results),
            waited_for: row.waited_for,
        }
    }
}

const SELECT_BUILDREQUESTS: &str = r#"
    SELECT br.id, br.buildsetid, br.builderid, br.priority, br.submitted_at,
           c.claimed_at, c.masterid AS claimed_by_masterid,
           br.complete, br.complete_at, br.results, br.waited_for
    FROM buildrequests br
    LEFT JOIN buildrequest_claims c ON c.brid = br.id
    WHERE TRUE
"#;

fn sourcestamp_filter(builder: &mut QueryBuilder<'_, Postgres>, column: &str, value: &str) {
    builder.push(
        " AND EXISTS (SELECT 1 FROM buildset_sourcestamps bss \
         JOIN sourcestamps ss ON ss.id = bss.sourcestampid \
         WHERE bss.buildsetid = br.buildsetid AND ss.",
    );
    builder.push(column);
    builder.push(" = ");
    builder.push_bind(value.to_string());
    builder.push(")");
}

#[async_trait]
impl BuildRequestRepo for PgStore {
    async fn get_buildrequest(&self, id: BuildRequestId) -> DbResult<Option<BuildRequest>> {
        let row =
            sqlx::query_as::<_, BuildRequestRow>(&format!("{SELECT_BUILDREQUESTS} AND br.id = $1"))
                .bind(id.get())
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(BuildRequest::from))
    }

    async fn get_buildrequests(&self, query: &BuildRequestQuery) -> DbResult<Vec<BuildRequest>> {
        let mut builder = QueryBuilder::<Postgres>::new(SELECT_BUILDREQUESTS);

        if let Some(builderid) = query.builderid {
            builder.push(" AND br.builderid = ").push_bind(builderid.get());
        }
        if let Some(buildsetid) = query.buildsetid {
            builder.push(" AND br.buildsetid = ").push_bind(buildsetid.get());
        }
        if let Some(complete) = query.complete {
            builder.push(" AND br.complete = ").push_bind(complete);
        }
        match query.claimed {
            ClaimedFilter::Any => {}
            ClaimedFilter::Unclaimed => {
                builder.push(" AND c.brid IS NULL AND br.complete = FALSE");
            }
            ClaimedFilter::Claimed => {
                builder.push(" AND c.brid IS NOT NULL");
            }
            ClaimedFilter::ByMaster(masterid) => {
                builder.push(" AND c.masterid = ").push_bind(masterid.get());
            }
        }
        if let Some(branch) = &query.branch {
            sourcestamp_filter(&mut builder, "branch", branch);
        }
        if let Some(repository) = &query.repository {
            sourcestamp_filter(&mut builder, "repository", repository);
        }
        builder.push(" ORDER BY br.id");

        let rows = builder
            .build_query_as::<BuildRequestRow>()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(BuildRequest::from).collect())
    }

    async fn claim_buildrequests(
        &self,
        ids: &[BuildRequestId],
        masterid: MasterId,
        claimed_at: DateTime<Utc>,
    ) -> DbResult<()> {
        let ids = distinct_ids(ids);
        if ids.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        // Inserts fresh claims and refreshes our own; rows held by another
        // master are left alone and so do not count as affected.
        let result = sqlx::query(
            r#"
            INSERT INTO buildrequest_claims (brid, masterid, claimed_at)
            SELECT id, $2, $3 FROM buildrequests WHERE id = ANY($1)
            ON CONFLICT (brid) DO UPDATE SET claimed_at = EXCLUDED.claimed_at
                WHERE buildrequest_claims.masterid = EXCLUDED.masterid
            "#,
        )
        .bind(&ids)
        .bind(masterid.get())
        .bind(claimed_at)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() != ids.len() as u64 {
            debug!(
                requested = ids.len(),
                affected = result.rows_affected(),
                "Claim conflict, rolling back"
            );
            tx.rollback().await?;
            return Err(DbError::AlreadyClaimed(format!("{:?}", ids)));
        }
        tx.commit().await?;
        Ok(())
    }

    async fn reclaim_buildrequests(
        &self,
        ids: &[BuildRequestId],
        masterid: MasterId,
        claimed_at: DateTime<Utc>,
    ) -> DbResult<()> {
        let ids = distinct_ids(ids);
        if ids.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE buildrequest_claims SET claimed_at = $3
            WHERE brid = ANY($1) AND masterid = $2
            "#,
        )
        .bind(&ids)
        .bind(masterid.get())
        .bind(claimed_at)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() != ids.len() as u64 {
            tx.rollback().await?;
            return Err(DbError::AlreadyClaimed(format!("{:?}", ids)));
        }
        tx.commit().await?;
        Ok(())
    }

    async fn unclaim_buildrequests(
        &self,
        ids: &[BuildRequestId],
        masterid: MasterId,
    ) -> DbResult<()> {
        let ids = distinct_ids(ids);
        if ids.is_empty() {
            return Ok(());
        }

        sqlx::query(
            r#"
            DELETE FROM buildrequest_claims c
            USING buildrequests br
            WHERE c.brid = br.id AND c.brid = ANY($1)
              AND c.masterid = $2 AND br.complete = FALSE
            "#,
        )
        .bind(&ids)
        .bind(masterid.get())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete_buildrequests(
        &self,
        ids: &[BuildRequestId],
        masterid: MasterId,
        results: Results,
        complete_at: DateTime<Utc>,
    ) -> DbResult<()> {
        let ids = distinct_ids(ids);
        if ids.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE buildrequests SET complete = TRUE, results = $3, complete_at = $4
            WHERE id = ANY($1) AND complete = FALSE
              AND EXISTS (
                  SELECT 1 FROM buildrequest_claims c
                  WHERE c.brid = buildrequests.id AND c.masterid = $2
              )
            "#,
        )
        .bind(&ids)
        .bind(masterid.get())
        .bind(results.get())
        .bind(complete_at)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() != ids.len() as u64 {
            debug!(
                requested = ids.len(),
                affected = result.rows_affected(),
                "Completion of unclaimed requests, rolling back"
            );
            tx.rollback().await?;
            return Err(DbError::NotClaimed(format!("{:?}", ids)));
        }
        tx.commit().await?;
        Ok(())
    }

    async fn unclaim_expired_buildrequests(
        &self,
        older_than: DateTime<Utc>,
    ) -> DbResult<Vec<BuildRequestId>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            r#"
            DELETE FROM buildrequest_claims c
            USING buildrequests br
            WHERE c.brid = br.id AND br.complete = FALSE AND c.claimed_at < $1
            RETURNING c.brid
            "#,
        )
        .bind(older_than)
        .fetch_all(&self.pool)
        .await?;

        let mut ids: Vec<BuildRequestId> = ids.into_iter().map(Into::into).collect();
        ids.sort();
        Ok(ids)
    }
}
