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

//! Runs a compile-time-embedded set of `.sql` migration files against the
//! configured pool on startup, in filename order, tracked in sqlx's own
//! `_sqlx_migrations` bookkeeping table. Callers build the `Migrator` with
//! `sqlx::migrate!("./db/migrations/...")` (embeds the directory at compile
//! time, like the teacher's `include_dir!`-embedded migrations) and hand it
//! to `run_migrations`.

use crate::db::Pool;
use sqlx::migrate::Migrator;

pub async fn run_migrations(pool: &Pool, migrator: &Migrator) -> anyhow::Result<()> {
    migrator.run(pool.raw()).await?;
    Ok(())
}
