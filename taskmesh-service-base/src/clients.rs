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

//! Configuration for calling a remote HTTP service with sane timeouts,
//! used by the worker agent's control-plane client (registration 10s,
//! heartbeat 5s, status-check 2-3s, result POST 10s per §5).

use serde::{Deserialize, Serialize};
use std::time::Duration;
use taskmesh_common::SafeDisplay;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteServiceConfig {
    pub base_url: url::Url,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl RemoteServiceConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn client(&self) -> reqwest::Result<reqwest::Client> {
        reqwest::Client::builder()
            .connect_timeout(self.connect_timeout())
            .timeout(self.request_timeout())
            .build()
    }
}

impl Default for RemoteServiceConfig {
    fn default() -> Self {
        Self {
            base_url: url::Url::parse("http://localhost:8080").unwrap(),
            connect_timeout_ms: 5_000,
            request_timeout_ms: 10_000,
        }
    }
}

impl SafeDisplay for RemoteServiceConfig {
    fn to_safe_string(&self) -> String {
        format!("{}", self.base_url)
    }
}
