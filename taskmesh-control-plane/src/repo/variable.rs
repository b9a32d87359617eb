//! Scoped variables (§3), resolved by the worker at dispatch time to fill
//! in `${name}` interpolations. The control plane only needs to read them
//! when assembling a task payload; writes happen through the out-of-scope
//! CRUD surface and are not this crate's concern.

use crate::model::{Variable, VariableScope};
use taskmesh_service_base::db::Pool;
use taskmesh_service_base::repo::RepoError;

#[derive(Clone)]
pub struct VariableRepo {
    pool: Pool,
}

impl VariableRepo {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub async fn for_scope(&self, scope: VariableScope, scope_ref: &str) -> Result<Vec<Variable>, RepoError> {
        let query = sqlx::query_as::<_, Variable>(
            "SELECT * FROM variables WHERE scope = $1 AND scope_ref = $2",
        )
        .bind(scope.to_string())
        .bind(scope_ref);
        self.pool.with_ro("variable", "for_scope").fetch_all_as(query).await
    }

    /// Merges project-scoped variables with script-scoped ones, script
    /// values winning on key collision (§3's "script-over-project" rule).
    pub async fn merged(
        &self,
        project_ref: Option<&str>,
        script_ref: &str,
    ) -> Result<std::collections::HashMap<String, String>, RepoError> {
        let mut merged = std::collections::HashMap::new();

        if let Some(project_ref) = project_ref {
            for v in self.for_scope(VariableScope::Project, project_ref).await? {
                merged.insert(v.name, v.value);
            }
        }
        for v in self.for_scope(VariableScope::Script, script_ref).await? {
            merged.insert(v.name, v.value);
        }

        Ok(merged)
    }
}
