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
use poem::listener::TcpListener;
use std::time::Duration;
use taskmesh_control_plane::config::make_config_loader;
use taskmesh_control_plane::services::Services;
use taskmesh_common::tracing_config::init_tracing;
use taskmesh_common::SafeDisplay;
use tokio::select;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "taskmesh-control-plane")]
struct Args {
    /// Print the resolved config (redacted) and exit instead of serving.
    #[arg(long)]
    dump_config: bool,
}

fn main() -> Result<(), std::io::Error> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> Result<(), std::io::Error> {
    let args = Args::parse();
    let config = make_config_loader().load().map_err(std::io::Error::other)?;

    if args.dump_config {
        println!("{}", config.to_safe_string());
        return Ok(());
    }

    init_tracing(&config.tracing);
    info!("{}", config.to_safe_string());

    let services = Services::new(&config).await.map_err(|e| {
        error!(error = %e, "failed to initialize services");
        std::io::Error::other(e)
    })?;

    let http_port = config.http_port;
    let dispatch_interval = Duration::from_millis(config.dispatch.tick_interval_ms);

    let http_services = services.clone();
    let http_server = tokio::spawn(async move {
        let app = taskmesh_control_plane::api::combined_routes(&http_services);
        poem::Server::new(TcpListener::bind(format!("0.0.0.0:{http_port}")))
            .run(app)
            .await
            .expect("HTTP server failed");
    });

    let dispatch_services = services.clone();
    let dispatch_tick = tokio::spawn(async move {
        let mut interval = tokio::time::interval(dispatch_interval);
        loop {
            interval.tick().await;
            dispatch_services.run_dispatch_tick().await;
        }
    });

    let prune_services = services.clone();
    let status_log_prune = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(3600));
        loop {
            interval.tick().await;
            prune_services.run_status_log_prune().await;
        }
    });

    select! {
        _ = http_server => {},
        _ = dispatch_tick => {},
        _ = status_log_prune => {},
    }

    Ok(())
}
