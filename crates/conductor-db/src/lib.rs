//! Persistent store adapter for Conductor.
//!
//! Provides repository traits, a PostgreSQL implementation and an in-memory
//! implementation with identical semantics.

pub mod error;
pub mod memory;
pub mod repo;

pub use error::{DbError, DbResult};
pub use memory::MemoryStore;
pub use repo::*;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str, max_connections: u32) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> DbResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// The full store contract consumed by the data layer.
pub trait Store:
    MasterRepo + BuilderRepo + BuildsetRepo + BuildRequestRepo + BuildRepo + StepRepo
{
}

impl<T> Store for T where
    T: MasterRepo + BuilderRepo + BuildsetRepo + BuildRequestRepo + BuildRepo + StepRepo
{
}

/// Integration tests that require PostgreSQL.
/// Run with: DATABASE_URL=postgres://... cargo test -- --ignored
#[cfg(test)]
mod integration_tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use conductor_core::model::{NewBuild, NewBuildset};
    use conductor_core::{BuildRequestId, Properties, Results, WorkerId};

    async fn store() -> PgStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let pool = create_pool(&url, 5).await.expect("Should connect to PostgreSQL");
        run_migrations(&pool).await.expect("Should run migrations");
        PgStore::new(pool)
    }

    async fn buildset(store: &PgStore, builders: &[&str]) -> Vec<BuildRequestId> {
        let mut builderids = Vec::new();
        for name in builders {
            builderids.push(store.find_builder_id(name).await.unwrap());
        }
        let mut properties = Properties::new();
        properties.set("branch", serde_json::json!("main"), "test");
        let (_, brids) = store
            .add_buildset(&NewBuildset {
                sourcestamps: vec![],
                reason: Some("integration".into()),
                properties,
                builderids,
                waited_for: false,
                external_idstring: None,
                submitted_at: Utc::now(),
                parent_buildid: None,
                parent_relationship: None,
                priority: 0,
                rebuilt_buildid: None,
            })
            .await
            .unwrap();
        brids.into_values().collect()
    }

    #[tokio::test]
    #[ignore]
    async fn test_claim_race_between_masters() {
        let store = store().await;
        let ours = store.find_master_id("it-master-a").await.unwrap();
        let theirs = store.find_master_id("it-master-b").await.unwrap();
        let brids = buildset(&store, &["it-linux", "it-windows"]).await;

        store
            .claim_buildrequests(&brids[..1], theirs, Utc::now())
            .await
            .unwrap();
        let err = store
            .claim_buildrequests(&brids, ours, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::AlreadyClaimed(_)));

        let second = store.get_buildrequest(brids[1]).await.unwrap().unwrap();
        assert!(!second.claimed(), "Failed claim must not leave partial rows");
    }

    #[tokio::test]
    #[ignore]
    async fn test_claim_and_complete() {
        let store = store().await;
        let ours = store.find_master_id("it-master-a").await.unwrap();
        let brids = buildset(&store, &["it-linux"]).await;
        let claimed_at = Utc.timestamp_opt(266761875, 0).single().unwrap();
        let complete_at = Utc.timestamp_opt(329920275, 0).single().unwrap();

        store
            .claim_buildrequests(&brids, ours, claimed_at)
            .await
            .unwrap();
        store
            .complete_buildrequests(&brids, ours, Results(75), complete_at)
            .await
            .unwrap();

        let br = store.get_buildrequest(brids[0]).await.unwrap().unwrap();
        assert!(br.complete);
        assert_eq!(br.results, Results(75));
        assert_eq!(br.claimed_by_masterid, Some(ours));
        assert_eq!(br.complete_at, Some(complete_at));
    }

    #[tokio::test]
    #[ignore]
    async fn test_steps_and_urls() {
        let store = store().await;
        let ours = store.find_master_id("it-master-a").await.unwrap();
        let brids = buildset(&store, &["it-steps"]).await;
        let br = store.get_buildrequest(brids[0]).await.unwrap().unwrap();
        let (buildid, _) = store
            .add_build(&NewBuild {
                builderid: br.builderid,
                buildrequestid: br.id,
                workerid: WorkerId::from(1),
                masterid: ours,
                started_at: Utc::now(),
                state_string: "created".into(),
            })
            .await
            .unwrap();

        let (stepid, number, _) = store.add_step(buildid, "compile", "pending").await.unwrap();
        let (_, second, name) = store.add_step(buildid, "compile", "pending").await.unwrap();
        assert_eq!((number, second), (0, 1));
        assert_eq!(name, "compile_2");

        store.add_step_url(stepid, "log", "http://a").await.unwrap();
        store.add_step_url(stepid, "log", "http://a").await.unwrap();
        let step = store.get_step(stepid).await.unwrap().unwrap();
        assert_eq!(step.urls.len(), 2);

        let props = store.get_buildset_properties(br.buildsetid).await.unwrap();
        assert_eq!(props.get("branch").map(|(v, _)| v.clone()), Some(serde_json::json!("main")));
    }
}
