//! Master registration.

use async_trait::async_trait;
use conductor_core::MasterId;
use conductor_core::model::Master;

use super::PgStore;
use crate::DbResult;

#[async_trait]
pub trait MasterRepo: Send + Sync {
    /// Id of the master with this name, registering it on first use.
    async fn find_master_id(&self, name: &str) -> DbResult<MasterId>;
    async fn get_master(&self, id: MasterId) -> DbResult<Option<Master>>;
}

#[derive(sqlx::FromRow)]
struct MasterRow {
    id: i64,
    name: String,
}

impl From<MasterRow> for Master {
    fn from(row: MasterRow) -> Self {
        Master {
            id: row.id.into(),
            name: row.name,
        }
    }
}

#[async_trait]
impl MasterRepo for PgStore {
    async fn find_master_id(&self, name: &str) -> DbResult<MasterId> {
        // The no-op update makes RETURNING yield the existing row on conflict.
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO masters (name) VALUES ($1)
            ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
            RETURNING id
            "#,
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(id.into())
    }

    async fn get_master(&self, id: MasterId) -> DbResult<Option<Master>> {
        let row = sqlx::query_as::<_, MasterRow>("SELECT id, name FROM masters WHERE id = $1")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Master::from))
    }
}
