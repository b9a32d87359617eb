//! Compile-time-embedded migration sets for each backend (§10.4). The
//! control plane picks one at startup based on `ControlPlaneConfig::db`.

use sqlx::migrate::Migrator;

pub fn sqlite_migrator() -> &'static Migrator {
    static MIGRATOR: Migrator = sqlx::migrate!("./db/migrations/sqlite");
    &MIGRATOR
}

pub fn postgres_migrator() -> &'static Migrator {
    static MIGRATOR: Migrator = sqlx::migrate!("./db/migrations/postgres");
    &MIGRATOR
}

pub fn migrator_for(db: &taskmesh_common::config::DbConfig) -> &'static Migrator {
    match db {
        taskmesh_common::config::DbConfig::Postgres(_) => postgres_migrator(),
        taskmesh_common::config::DbConfig::Sqlite(_) => sqlite_migrator(),
    }
}
