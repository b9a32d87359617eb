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

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use taskmesh_broker::AmqpBroker;
use taskmesh_common::tracing_config::{init_tracing, TracingConfig};
use taskmesh_common::SafeDisplay;
use taskmesh_worker_agent::agent::WorkerAgent;
use taskmesh_worker_agent::config::{default_config_path, ConfigManager};
use taskmesh_worker_agent::control_plane_client::HttpControlPlaneClient;
use taskmesh_worker_agent::step_executor::StubBrowserFactory;
use tokio::select;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "taskmesh-worker-agent")]
struct Args {
    /// Path to the persisted local worker config (created with defaults on
    /// first run if it doesn't exist).
    #[arg(long)]
    config: Option<PathBuf>,

    /// SPEC_FULL §10.6's clear-queue tool: purge this worker's own bound
    /// queue on the broker before connecting, then exit. Operator recovery
    /// from a poisoned queue; never run automatically.
    #[arg(long)]
    purge: bool,
}

fn main() -> Result<(), std::io::Error> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> Result<(), std::io::Error> {
    let args = Args::parse();

    init_tracing(&TracingConfig::local_dev("taskmesh-worker-agent"));

    let config_path = args.config.unwrap_or_else(default_config_path);
    let config = ConfigManager::new(&config_path)
        .load_or_create()
        .map_err(std::io::Error::other)?;
    info!("{}", config.to_safe_string());

    let broker = Arc::new(AmqpBroker::new(config.broker.clone()));
    let control_plane = Arc::new(HttpControlPlaneClient::new(config.server_url.clone()).map_err(std::io::Error::other)?);
    let browser_factory = Arc::new(StubBrowserFactory);

    let agent = WorkerAgent::new(config, broker, control_plane, browser_factory);

    if args.purge {
        let purged = agent.purge_own_queue().await.map_err(std::io::Error::other)?;
        info!(purged, "purge complete, exiting");
        return Ok(());
    }

    agent.register().await.map_err(|e| {
        error!(error = %e, "failed to register with control plane");
        std::io::Error::other(e)
    })?;

    let intake_agent = agent.clone();
    let intake_task = tokio::spawn(async move { intake_agent.run_intake().await });

    let heartbeat_agent = agent.clone();
    let heartbeat_task = tokio::spawn(async move { heartbeat_agent.run_heartbeat().await });

    select! {
        _ = intake_task => {},
        _ = heartbeat_task => {},
    }

    Ok(())
}
