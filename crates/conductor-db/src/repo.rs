//! Repository traits and the PostgreSQL implementation.

pub mod build;
pub mod builder;
pub mod buildrequest;
pub mod buildset;
pub mod master;
pub mod step;

pub use build::{BuildQuery, BuildRepo};
pub use builder::BuilderRepo;
pub use buildrequest::{BuildRequestQuery, BuildRequestRepo, ClaimedFilter};
pub use buildset::BuildsetRepo;
pub use master::MasterRepo;
pub use step::{StepRepo, unique_step_name};

use sqlx::PgPool;

/// PostgreSQL-backed store. Implements every repository trait.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Sort and deduplicate ids so batch operations can compare affected-row counts.
pub(crate) fn distinct_ids<T: Copy + Ord + Into<i64>>(ids: &[T]) -> Vec<i64> {
    let mut raw: Vec<T> = ids.to_vec();
    raw.sort();
    raw.dedup();
    raw.into_iter().map(Into::into).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_core::BuildRequestId;

    #[test]
    fn test_distinct_ids() {
        let ids = [
            BuildRequestId::from(7),
            BuildRequestId::from(3),
            BuildRequestId::from(7),
        ];
        assert_eq!(distinct_ids(&ids), vec![3, 7]);
    }
}
