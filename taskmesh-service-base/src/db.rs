// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A single `Pool` type backed by sqlx's `Any` driver, so the same repo code
//! runs unmodified against Postgres in production and SQLite for local
//! development / tests (matching §10.4's Postgres-or-SQLite `DbConfig`).
//!
//! Every repo method acquires the pool through `with_ro`/`with_rw` rather
//! than touching the `sqlx::AnyPool` directly; this is where slow-query
//! logging (and, later, per-operation metrics) hangs.

use crate::repo::RepoError;
use sqlx::any::{AnyArguments, AnyPoolOptions, AnyQueryResult, AnyRow};
use sqlx::query::{Query, QueryAs};
use sqlx::query_scalar::QueryScalar;
use sqlx::{Any, FromRow};
use std::time::Instant;
use taskmesh_common::config::DbConfig;

/// Which real driver backs this pool. Repos that need backend-specific SQL
/// (SQLite has no `SELECT ... FOR UPDATE`) branch on this rather than
/// duplicating query text per caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    Postgres,
    Sqlite,
}

impl Backend {
    /// Appends a row-lock clause where the backend supports one. SQLite has
    /// no `FOR UPDATE`; its single-writer transaction semantics already
    /// serialize concurrent writers within one connection/pool.
    pub fn for_update(self) -> &'static str {
        match self {
            Backend::Postgres => " FOR UPDATE",
            Backend::Sqlite => "",
        }
    }
}

#[derive(Clone)]
pub struct Pool {
    inner: sqlx::AnyPool,
    backend: Backend,
}

impl Pool {
    pub async fn configured(config: &DbConfig) -> Result<Self, sqlx::Error> {
        sqlx::any::install_default_drivers();

        let (url, max_connections, backend) = match config {
            DbConfig::Postgres(c) => (
                format!(
                    "postgres://{}:{}@{}:{}/{}",
                    c.username, c.password, c.host, c.port, c.database
                ),
                c.max_connections,
                Backend::Postgres,
            ),
            DbConfig::Sqlite(c) => (
                format!("sqlite://{}?mode=rwc", c.database_path.display()),
                c.max_connections,
                Backend::Sqlite,
            ),
        };

        let inner = AnyPoolOptions::new()
            .max_connections(max_connections)
            .connect(&url)
            .await?;

        Ok(Self { inner, backend })
    }

    #[cfg(any(test, feature = "test-utils"))]
    pub async fn in_memory_sqlite() -> Result<Self, sqlx::Error> {
        sqlx::any::install_default_drivers();
        let inner = AnyPoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self {
            inner,
            backend: Backend::Sqlite,
        })
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn raw(&self) -> &sqlx::AnyPool {
        &self.inner
    }

    /// Read-only access. Distinguished from `with_rw` so that a future
    /// read-replica split doesn't require touching every call site.
    pub fn with_ro(&self, svc: &'static str, api: &'static str) -> LabelledPool<'_> {
        LabelledPool {
            pool: &self.inner,
            svc,
            api,
        }
    }

    pub fn with_rw(&self, svc: &'static str, api: &'static str) -> LabelledPool<'_> {
        LabelledPool {
            pool: &self.inner,
            svc,
            api,
        }
    }
}

pub struct LabelledPool<'p> {
    pool: &'p sqlx::AnyPool,
    svc: &'static str,
    api: &'static str,
}

impl<'p> LabelledPool<'p> {
    fn record(&self, started: Instant) {
        tracing::debug!(
            svc = self.svc,
            api = self.api,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "repo query"
        );
    }

    pub async fn execute<'q>(
        &self,
        query: Query<'q, Any, AnyArguments<'q>>,
    ) -> Result<AnyQueryResult, RepoError> {
        let started = Instant::now();
        let result = query.execute(self.pool).await;
        self.record(started);
        Ok(result?)
    }

    pub async fn fetch_optional_as<T>(
        &self,
        query: QueryAs<'_, Any, T, AnyArguments<'_>>,
    ) -> Result<Option<T>, RepoError>
    where
        T: for<'r> FromRow<'r, AnyRow> + Send + Unpin,
    {
        let started = Instant::now();
        let result = query.fetch_optional(self.pool).await;
        self.record(started);
        Ok(result?)
    }

    pub async fn fetch_one_as<T>(
        &self,
        query: QueryAs<'_, Any, T, AnyArguments<'_>>,
    ) -> Result<T, RepoError>
    where
        T: for<'r> FromRow<'r, AnyRow> + Send + Unpin,
    {
        let started = Instant::now();
        let result = query.fetch_one(self.pool).await;
        self.record(started);
        Ok(result?)
    }

    pub async fn fetch_all_as<T>(
        &self,
        query: QueryAs<'_, Any, T, AnyArguments<'_>>,
    ) -> Result<Vec<T>, RepoError>
    where
        T: for<'r> FromRow<'r, AnyRow> + Send + Unpin,
    {
        let started = Instant::now();
        let result = query.fetch_all(self.pool).await;
        self.record(started);
        Ok(result?)
    }

    pub async fn fetch_scalar<T>(&self, query: QueryScalar<'_, Any, T, AnyArguments<'_>>) -> Result<T, RepoError>
    where
        T: Send + Unpin,
        (T,): for<'r> FromRow<'r, AnyRow>,
    {
        let started = Instant::now();
        let result = query.fetch_one(self.pool).await;
        self.record(started);
        Ok(result?)
    }
}
