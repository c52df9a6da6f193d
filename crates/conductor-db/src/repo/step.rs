//! Steps of a build.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conductor_core::model::{Step, StepUrl};
use conductor_core::{BuildId, Results, StepId};
use sqlx::types::Json;

use super::PgStore;
use crate::{DbError, DbResult};

#[async_trait]
pub trait StepRepo: Send + Sync {
    /// Insert a step numbered after the build's latest step (starting at 0).
    ///
    /// Returns the id, the number and the stored name, which carries a `_N`
    /// suffix when `name` was already taken in this build.
    async fn add_step(
        &self,
        buildid: BuildId,
        name: &str,
        state_string: &str,
    ) -> DbResult<(StepId, i32, String)>;
    async fn get_step(&self, id: StepId) -> DbResult<Option<Step>>;
    async fn get_step_by_number(&self, buildid: BuildId, number: i32) -> DbResult<Option<Step>>;
    async fn get_step_by_name(&self, buildid: BuildId, name: &str) -> DbResult<Option<Step>>;
    async fn get_steps(&self, buildid: BuildId) -> DbResult<Vec<Step>>;
    /// Set `started_at` unless already set; with `locks_acquired` also set
    /// `locks_acquired_at` to the same instant.
    async fn start_step(
        &self,
        id: StepId,
        started_at: DateTime<Utc>,
        locks_acquired: bool,
    ) -> DbResult<()>;
    async fn set_step_locks_acquired_at(&self, id: StepId, at: DateTime<Utc>) -> DbResult<()>;
    async fn set_step_state_string(&self, id: StepId, state_string: &str) -> DbResult<()>;
    async fn add_step_url(&self, id: StepId, name: &str, url: &str) -> DbResult<()>;
    async fn finish_step(
        &self,
        id: StepId,
        results: Results,
        hidden: bool,
        complete_at: DateTime<Utc>,
    ) -> DbResult<()>;
}

/// First of `name`, `name_2`, `name_3`, ... not in `taken`.
pub fn unique_step_name(name: &str, taken: &HashSet<String>) -> String {
    if !taken.contains(name) {
        return name.to_string();
    }
    (2..)
        .map(|n| format!("{name}_{n}"))
        .find(|candidate| !taken.contains(candidate))
        .unwrap_or_else(|| name.to_string())
}

#[derive(sqlx::FromRow)]
struct StepRow {
    id: i64,
    number: i32,
    name: String,
    buildid: i64,
    started_at: Option<DateTime<Utc>>,
    locks_acquired_at: Option<DateTime<Utc>>,
    complete_at: Option<DateTime<Utc>>,
    state_string: String,
    results: Option<i32>,
    urls_json: Json<Vec<StepUrl>>,
    hidden: bool,
}

impl From<StepRow> for Step {
    fn from(row: StepRow) -> Self {
        Step {
            id: row.id.into(),
            number: row.number,
            name: row.name,
            buildid: row.buildid.into(),
            started_at: row.started_at,
            locks_acquired_at: row.locks_acquired_at,
            complete_at: row.complete_at,
            state_string: row.state_string,
            results: row.results.map(Results),
            urls: row.urls_json.0,
            hidden: row.hidden,
        }
    }
}

const SELECT_STEPS: &str = r#"
    SELECT id, number, name, buildid, started_at, locks_acquired_at, complete_at,
           state_string, results, urls_json, hidden
    FROM steps
    WHERE TRUE
"#;

fn step_updated(id: StepId, rows_affected: u64) -> DbResult<()> {
    if rows_affected == 0 {
        return Err(DbError::NotFound(format!("step {}", id)));
    }
    Ok(())
}

#[async_trait]
impl StepRepo for PgStore {
    async fn add_step(
        &self,
        buildid: BuildId,
        name: &str,
        state_string: &str,
    ) -> DbResult<(StepId, i32, String)> {
        let mut tx = self.pool.begin().await?;

        // Serialize numbering and naming per build.
        sqlx::query_scalar::<_, i64>("SELECT id FROM builds WHERE id = $1 FOR UPDATE")
            .bind(buildid.get())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("build {}", buildid)))?;

        let taken: Vec<String> = sqlx::query_scalar("SELECT name FROM steps WHERE buildid = $1")
            .bind(buildid.get())
            .fetch_all(&mut *tx)
            .await?;
        let name = unique_step_name(name, &taken.into_iter().collect());

        let (id, number): (i64, i32) = sqlx::query_as(
            r#"
            INSERT INTO steps (number, name, buildid, state_string, urls_json, hidden)
            SELECT COALESCE(MAX(number) + 1, 0), $2, $1, $3, '[]'::jsonb, FALSE
            FROM steps WHERE buildid = $1
            RETURNING id, number
            "#,
        )
        .bind(buildid.get())
        .bind(&name)
        .bind(state_string)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((id.into(), number, name))
    }

    async fn get_step(&self, id: StepId) -> DbResult<Option<Step>> {
        let row = sqlx::query_as::<_, StepRow>(&format!("{SELECT_STEPS} AND id = $1"))
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Step::from))
    }

    async fn get_step_by_number(&self, buildid: BuildId, number: i32) -> DbResult<Option<Step>> {
        let row = sqlx::query_as::<_, StepRow>(&format!(
            "{SELECT_STEPS} AND buildid = $1 AND number = $2"
        ))
        .bind(buildid.get())
        .bind(number)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Step::from))
    }

    async fn get_step_by_name(&self, buildid: BuildId, name: &str) -> DbResult<Option<Step>> {
        let row = sqlx::query_as::<_, StepRow>(&format!(
            "{SELECT_STEPS} AND buildid = $1 AND name = $2"
        ))
        .bind(buildid.get())
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Step::from))
    }

    async fn get_steps(&self, buildid: BuildId) -> DbResult<Vec<Step>> {
        let rows = sqlx::query_as::<_, StepRow>(&format!(
            "{SELECT_STEPS} AND buildid = $1 ORDER BY number"
        ))
        .bind(buildid.get())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Step::from).collect())
    }

    async fn start_step(
        &self,
        id: StepId,
        started_at: DateTime<Utc>,
        locks_acquired: bool,
    ) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE steps SET
                started_at = COALESCE(started_at, $2),
                locks_acquired_at = CASE WHEN $3 THEN $2 ELSE locks_acquired_at END
            WHERE id = $1
            "#,
        )
        .bind(id.get())
        .bind(started_at)
        .bind(locks_acquired)
        .execute(&self.pool)
        .await?;
        step_updated(id, result.rows_affected())
    }

    async fn set_step_locks_acquired_at(&self, id: StepId, at: DateTime<Utc>) -> DbResult<()> {
        let result = sqlx::query("UPDATE steps SET locks_acquired_at = $2 WHERE id = $1")
            .bind(id.get())
            .bind(at)
            .execute(&self.pool)
            .await?;
        step_updated(id, result.rows_affected())
    }

    async fn set_step_state_string(&self, id: StepId, state_string: &str) -> DbResult<()> {
        let result = sqlx::query("UPDATE steps SET state_string = $2 WHERE id = $1")
            .bind(id.get())
            .bind(state_string)
            .execute(&self.pool)
            .await?;
        step_updated(id, result.rows_affected())
    }

    async fn add_step_url(&self, id: StepId, name: &str, url: &str) -> DbResult<()> {
        // Appending in SQL keeps concurrent URL additions from overwriting each other.
        let result = sqlx::query(
            r#"
            UPDATE steps
            SET urls_json = urls_json || jsonb_build_array(jsonb_build_object('name', $2::TEXT, 'url', $3::TEXT))
            WHERE id = $1
            "#,
        )
        .bind(id.get())
        .bind(name)
        .bind(url)
        .execute(&self.pool)
        .await?;
        step_updated(id, result.rows_affected())
    }

    async fn finish_step(
        &self,
        id: StepId,
        results: Results,
        hidden: bool,
        complete_at: DateTime<Utc>,
    ) -> DbResult<()> {
        let result = sqlx::query(
            "UPDATE steps SET results = $2, hidden = $3, complete_at = $4 WHERE id = $1",
        )
        .bind(id.get())
        .bind(results.get())
        .bind(hidden)
        .bind(complete_at)
        .execute(&self.pool)
        .await?;
        step_updated(id, result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_step_name() {
        let taken: HashSet<String> = ["compile", "compile_2", "test"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(unique_step_name("lint", &taken), "lint");
        assert_eq!(unique_step_name("compile", &taken), "compile_3");
        assert_eq!(unique_step_name("test", &taken), "test_2");
    }
}
