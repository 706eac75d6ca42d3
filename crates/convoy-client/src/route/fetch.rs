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

//! HTTP client for the convoy route endpoint.
//!
//! `GET {api_base}/convoys/{id}/route?user_lat=..&user_lon=..` returns the
//! route from the caller's position to the convoy destination, either flat
//! (`{"route": [...], "steps": [...], "duration": ..}`) or wrapped once more
//! under a `route` key.

use std::time::Duration;

use log::{debug, warn};
use serde::Deserialize;
use thiserror::Error;

use super::{ManeuverStep, Route, RouteError};
use crate::geodesic::Coordinate;
use crate::protocol::ParseError;

/// Errors that can occur while fetching a route.
#[derive(Debug, Error)]
pub enum RouteFetchError {
    #[error("route request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("route endpoint returned status {0}")]
    Status(u16),

    #[error("malformed route payload: {0}")]
    Payload(#[from] ParseError),

    #[error("route service returned no route")]
    Empty,
}

impl From<RouteError> for RouteFetchError {
    fn from(e: RouteError) -> Self {
        match e {
            RouteError::NoWaypoints => Self::Empty,
            RouteError::InvalidDuration(d) => Self::Payload(ParseError::InvalidValue {
                field: "duration",
                value: d.to_string(),
            }),
        }
    }
}

/// Configuration for the route client.
#[derive(Debug, Clone)]
pub struct RouteClientConfig {
    /// REST base, e.g. `http://localhost:8000/api/v1`.
    pub api_base: String,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for RouteClientConfig {
    fn default() -> Self {
        Self {
            api_base: "http://localhost:8000/api/v1".to_string(),
            timeout: Duration::from_secs(5),
        }
    }
}

/// Fetches routes from the convoy API. Cheap to clone.
#[derive(Debug, Clone)]
pub struct RouteClient {
    http: reqwest::Client,
    api_base: String,
}

impl RouteClient {
    pub fn new(config: &RouteClientConfig) -> Result<Self, RouteFetchError> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
        })
    }

    /// Fetch the route from `from` to the destination of `convoy_id`.
    pub async fn fetch(
        &self,
        convoy_id: &str,
        token: &str,
        from: Coordinate,
    ) -> Result<Route, RouteFetchError> {
        let url = format!("{}/convoys/{}/route", self.api_base, convoy_id);
        debug!("Fetching route from {url}");

        let response = self
            .http
            .get(&url)
            .query(&[("user_lat", from.latitude), ("user_lon", from.longitude)])
            .bearer_auth(token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            warn!("Route endpoint returned {status}");
            return Err(RouteFetchError::Status(status.as_u16()));
        }

        let body = response.bytes().await?;
        parse_route_payload(&body)
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RoutePayload {
    Nested { route: RouteBody },
    Flat(RouteBody),
}

#[derive(Debug, Default, Deserialize)]
struct RouteBody {
    #[serde(default)]
    route: Vec<WirePoint>,
    #[serde(default)]
    steps: Vec<WireStep>,
    #[serde(default)]
    duration: f64,
    #[serde(default)]
    distance: Option<f64>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct WirePoint {
    latitude: f64,
    longitude: f64,
}

impl From<WirePoint> for Coordinate {
    fn from(p: WirePoint) -> Self {
        Coordinate::new(p.latitude, p.longitude)
    }
}

#[derive(Debug, Deserialize)]
struct WireStep {
    location: WirePoint,
    #[serde(default)]
    instruction: String,
    #[serde(default)]
    modifier: String,
    #[serde(default)]
    name: String,
    #[serde(default, rename = "type")]
    maneuver_type: Option<String>,
    #[serde(default)]
    distance: Option<f64>,
    #[serde(default)]
    duration: Option<f64>,
}

impl From<WireStep> for ManeuverStep {
    fn from(s: WireStep) -> Self {
        Self {
            location: s.location.into(),
            instruction: s.instruction,
            modifier: s.modifier,
            name: Some(s.name).filter(|n| !n.is_empty()),
            maneuver_type: s.maneuver_type.filter(|t| !t.is_empty()),
            distance_meters: s.distance,
            duration_seconds: s.duration,
        }
    }
}

/// Decode a route endpoint body.
pub fn parse_route_payload(body: &[u8]) -> Result<Route, RouteFetchError> {
    let payload: RoutePayload = serde_json::from_slice(body)
        .map_err(|e| ParseError::InvalidFormat(e.to_string()))?;

    let body = match payload {
        RoutePayload::Nested { route } | RoutePayload::Flat(route) => route,
    };
    if body.route.is_empty() {
        return Err(RouteFetchError::Empty);
    }

    let waypoints = body.route.into_iter().map(Coordinate::from).collect();
    let steps = body.steps.into_iter().map(ManeuverStep::from).collect();
    let route = Route::new(waypoints, steps, body.duration)?;

    Ok(match body.distance {
        Some(distance) => route.with_distance(distance),
        None => route,
    })
}
