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

//! Config loading: a TOML file (if present) layered with `APP__`-prefixed
//! environment variable overrides, falling back to `T::default()`.

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

pub struct ConfigLoader<T> {
    path: PathBuf,
    _marker: PhantomData<T>,
}

impl<T> ConfigLoader<T>
where
    T: DeserializeOwned + Serialize + Default,
{
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            _marker: PhantomData,
        }
    }

    pub fn load(&self) -> Result<T, figment::Error> {
        Figment::from(Serialized::defaults(T::default()))
            .merge(Toml::file(&self.path))
            .merge(Env::prefixed("APP__").split("__"))
            .extract()
    }
}

/// Database backend selection: Postgres in production, SQLite for
/// zero-setup local development (SQLite is the default).
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DbConfig {
    Postgres(PostgresConfig),
    Sqlite(SqliteConfig),
}

impl Default for DbConfig {
    fn default() -> Self {
        DbConfig::Sqlite(SqliteConfig::default())
    }
}

impl crate::SafeDisplay for DbConfig {
    fn to_safe_string(&self) -> String {
        match self {
            DbConfig::Postgres(c) => format!(
                "postgres://{}:****@{}:{}/{}",
                c.username, c.host, c.port, c.database
            ),
            DbConfig::Sqlite(c) => format!("sqlite://{}", c.database_path.display()),
        }
    }
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub max_connections: u32,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "taskmesh".to_string(),
            username: "taskmesh".to_string(),
            password: "taskmesh".to_string(),
            max_connections: 10,
        }
    }
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct SqliteConfig {
    pub database_path: PathBuf,
    pub max_connections: u32,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("taskmesh.db"),
            max_connections: 10,
        }
    }
}

/// Connection parameters for the AMQP broker (§4.2's topic exchange / per
/// worker queue topology).
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub vhost: String,
    pub username: String,
    pub password: String,
    pub heartbeat_secs: u16,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            vhost: "/".to_string(),
            username: "guest".to_string(),
            password: "guest".to_string(),
            heartbeat_secs: 600,
        }
    }
}

impl crate::SafeDisplay for BrokerConfig {
    fn to_safe_string(&self) -> String {
        format!(
            "amqp://{}:****@{}:{}{}",
            self.username, self.host, self.port, self.vhost
        )
    }
}

impl BrokerConfig {
    pub fn amqp_uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}{}",
            self.username, self.password, self.host, self.port, self.vhost
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
    struct Example {
        port: u16,
        name: String,
    }

    #[test]
    fn loads_defaults_when_file_missing() {
        let loader: ConfigLoader<Example> = ConfigLoader::new(Path::new("/nonexistent/path.toml"));
        let config = loader.load().expect("defaults should always load");
        assert_eq!(config, Example::default());
    }
}
