// Copyright 2025 Chris Custine
//
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

mod config;
mod display;
mod replay;

use std::path::PathBuf;

use clap::Parser;
use config::{AppConfig, TOKEN_ENV_VAR};
use convoy_client::{
    LocationError, LocationProvider, Session, SessionCommand, SessionError, SessionEvent,
};
use display::Renderer;
use log::{info, warn};
use mimalloc::MiMalloc;
use replay::ReplayProvider;
use tokio::sync::broadcast::error::RecvError;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Join a convoy and drive it from a recorded track.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Convoy to join
    convoy_id: String,

    /// Recorded track (CSV) played back as the device location
    #[arg(long)]
    replay: PathBuf,

    /// Bearer token (overrides CONVOY_TOKEN and the config file)
    #[arg(long)]
    token: Option<String>,

    /// WebSocket base, e.g. ws://localhost:8000/ws
    #[arg(long)]
    ws_base: Option<String>,

    /// REST base, e.g. http://localhost:8000/api/v1
    #[arg(long)]
    api_base: Option<String>,

    /// Milliseconds between replayed fixes
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Write the effective configuration back to the config file
    #[arg(long, default_value_t = false)]
    save_config: bool,
}

impl Args {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(ws_base) = &self.ws_base {
            config.ws_base.clone_from(ws_base);
        }
        if let Some(api_base) = &self.api_base {
            config.api_base.clone_from(api_base);
        }
        if let Some(interval_ms) = self.interval_ms {
            config.replay_interval_ms = interval_ms;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut app_config = AppConfig::load().unwrap_or_else(|e| {
        warn!("Failed to load config, using defaults: {}", e);
        AppConfig::default()
    });
    args.apply(&mut app_config);

    if args.save_config {
        app_config.save()?;
        if let Ok(path) = AppConfig::get_config_path() {
            info!("Saved configuration to {}", path.display());
        }
    }

    let token = args
        .token
        .clone()
        .or_else(|| app_config.resolve_token(std::env::var(TOKEN_ENV_VAR).ok()))
        .ok_or("no token: pass --token or set CONVOY_TOKEN")?;

    let mut provider = ReplayProvider::new(replay::load_track(&args.replay)?);
    let config = app_config.session_config();

    let mut session = Session::new(config.clone())?;
    let mut events = session.subscribe();
    session.join(&args.convoy_id, &token).await?;
    let locations = provider.watch(&config.watch, config.filter.clone())?;

    let roster_config = config.roster.clone();
    let renderer_task = tokio::spawn(async move {
        let mut renderer = Renderer::new(roster_config);
        loop {
            match events.recv().await {
                Ok(event) => {
                    for line in renderer.render(&event) {
                        println!("{line}");
                    }
                    if event == SessionEvent::Ended {
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => warn!("Renderer skipped {} events", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let commands = session.commands();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, leaving convoy");
            let _ = commands.send(SessionCommand::Leave).await;
        }
    });

    let result = session.run(locations).await;
    drop(session);
    let _ = renderer_task.await;

    match result {
        Err(SessionError::Location(LocationError::StreamEnded)) => {
            info!("Replay finished");
            Ok(())
        }
        other => other.map_err(Into::into),
    }
}
