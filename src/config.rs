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

//! Application configuration management.
//!
//! Persistent settings are stored as TOML through `confy`. Command-line flags
//! override the file; the bearer token can also come from `CONVOY_TOKEN`.

use std::time::Duration;

use convoy_client::{ConnectionConfig, RouteClientConfig, SessionConfig};
use serde::{Deserialize, Serialize};

const APP_NAME: &str = "convoy-tracker";
const CONFIG_NAME: &str = "config";

/// Environment variable holding the bearer token.
pub const TOKEN_ENV_VAR: &str = "CONVOY_TOKEN";

/// Application configuration stored in TOML format
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AppConfig {
    /// Configuration schema version for migrations
    #[serde(default = "default_config_version")]
    pub config_version: u32,

    /// WebSocket base of the convoy channel
    #[serde(default = "default_ws_base")]
    pub ws_base: String,

    /// REST base of the convoy API
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Bearer token (env var takes precedence)
    #[serde(default)]
    pub token: Option<String>,

    /// Route request timeout in seconds
    #[serde(default = "default_route_timeout_secs")]
    pub route_timeout_secs: u64,

    /// Assumed cruising speed for members without a reported ETA (m/s)
    #[serde(default = "default_cruising_speed")]
    pub cruising_speed_mps: f64,

    /// Replay cadence for recorded tracks in milliseconds
    #[serde(default = "default_replay_interval_ms")]
    pub replay_interval_ms: u64,
}

// Default value functions for serde
fn default_config_version() -> u32 {
    1
}

fn default_ws_base() -> String {
    ConnectionConfig::default().ws_base
}

fn default_api_base() -> String {
    RouteClientConfig::default().api_base
}

fn default_route_timeout_secs() -> u64 {
    5
}

fn default_cruising_speed() -> f64 {
    13.8
}

fn default_replay_interval_ms() -> u64 {
    1000
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            config_version: default_config_version(),
            ws_base: default_ws_base(),
            api_base: default_api_base(),
            token: None,
            route_timeout_secs: default_route_timeout_secs(),
            cruising_speed_mps: default_cruising_speed(),
            replay_interval_ms: default_replay_interval_ms(),
        }
    }
}

impl AppConfig {
    /// Load configuration from disk
    pub fn load() -> Result<Self, confy::ConfyError> {
        confy::load(APP_NAME, CONFIG_NAME)
    }

    /// Save configuration to disk
    pub fn save(&self) -> Result<(), confy::ConfyError> {
        confy::store(APP_NAME, CONFIG_NAME, self)
    }

    /// Get the config file path for display to user
    pub fn get_config_path() -> Result<std::path::PathBuf, confy::ConfyError> {
        confy::get_configuration_file_path(APP_NAME, CONFIG_NAME)
    }

    /// Resolve the bearer token: `env` wins over the file.
    #[must_use]
    pub fn resolve_token(&self, env: Option<String>) -> Option<String> {
        env.filter(|t| !t.is_empty())
            .or_else(|| self.token.clone().filter(|t| !t.is_empty()))
    }

    /// Build the session configuration, keeping library defaults for the
    /// policy constants that are not exposed in the file.
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        let mut config = SessionConfig::default();
        config.connection.ws_base.clone_from(&self.ws_base);
        config.route.api_base.clone_from(&self.api_base);
        config.route.timeout = Duration::from_secs(self.route_timeout_secs);
        config.roster.cruising_speed_mps = self.cruising_speed_mps;
        config.watch.interval = Duration::from_millis(self.replay_interval_ms);
        config
    }
}
