//! An in-memory SQLite-backed `Pool`, migrated on construction, for
//! control-plane repo/service tests that want real SQL semantics (unique
//! constraints, row locking) without standing up Postgres.

use taskmesh_service_base::db::Pool;
use taskmesh_service_base::migration;

pub struct Store {
    pub pool: Pool,
}

impl Store {
    pub async fn new(migrator: &sqlx::migrate::Migrator) -> anyhow::Result<Self> {
        let pool = Pool::in_memory_sqlite().await?;
        migration::run_migrations(&pool, migrator).await?;
        Ok(Self { pool })
    }
}
