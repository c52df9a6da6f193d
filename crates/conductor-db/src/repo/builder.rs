//! Builder registration and lookup.

use async_trait::async_trait;
use conductor_core::BuilderId;
use conductor_core::model::Builder;

use super::PgStore;
use crate::DbResult;

#[async_trait]
pub trait BuilderRepo: Send + Sync {
    /// Id of the builder with this name, registering it on first use.
    async fn find_builder_id(&self, name: &str) -> DbResult<BuilderId>;
    async fn get_builder(&self, id: BuilderId) -> DbResult<Option<Builder>>;
    async fn get_builder_by_name(&self, name: &str) -> DbResult<Option<Builder>>;
}

#[derive(sqlx::FromRow)]
struct BuilderRow {
    id: i64,
    name: String,
}

impl From<BuilderRow> for Builder {
    fn from(row: BuilderRow) -> Self {
        Builder {
            id: row.id.into(),
            name: row.name,
        }
    }
}

#[async_trait]
impl BuilderRepo for PgStore {
    async fn find_builder_id(&self, name: &str) -> DbResult<BuilderId> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO builders (name) VALUES ($1)
            ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
            RETURNING id
            "#,
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(id.into())
    }

    async fn get_builder(&self, id: BuilderId) -> DbResult<Option<Builder>> {
        let row = sqlx::query_as::<_, BuilderRow>("SELECT id, name FROM builders WHERE id = $1")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Builder::from))
    }

    async fn get_builder_by_name(&self, name: &str) -> DbResult<Option<Builder>> {
        let row =
            sqlx::query_as::<_, BuilderRow>("SELECT id, name FROM builders WHERE name = $1")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(Builder::from))
    }
}
