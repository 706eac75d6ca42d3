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

//! Route progress and turn-by-turn step tracking.
//!
//! The route itself comes from the routing service (see [`fetch`]) and is
//! never modified here. [`RouteTracker`] is a two-state machine:
//!
//! - `NoRoute` until [`RouteTracker::set_route`]
//! - `Navigating(i)` afterwards, where `i` only ever grows by one per
//!   [`RouteTracker::advance`] call, once the driver comes within the trigger
//!   radius of step `i` and `i` is not the last step
//!
//! A position that skips past several maneuver points advances a single
//! step per call; the next fix advances again if it is still in range.

pub mod fetch;

use chrono::{DateTime, Duration, Utc};
use log::info;
use thiserror::Error;

use crate::geodesic::{distance_meters, path_length_meters, Coordinate};

/// Errors building a route.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RouteError {
    #[error("route has no waypoints")]
    NoWaypoints,

    #[error("invalid route duration: {0}")]
    InvalidDuration(f64),
}

/// One turn-by-turn instruction tied to a trigger point.
#[derive(Debug, Clone, PartialEq)]
pub struct ManeuverStep {
    pub location: Coordinate,
    /// Human-readable instruction; may be empty.
    pub instruction: String,
    /// Direction tag, e.g. `"left"`, `"slight right"`, `"straight"`.
    pub modifier: String,
    /// Road name, if known.
    pub name: Option<String>,
    /// Maneuver kind, e.g. `"turn"`, `"arrive"`.
    pub maneuver_type: Option<String>,
    /// Length of the step in meters.
    pub distance_meters: Option<f64>,
    /// Expected duration of the step in seconds.
    pub duration_seconds: Option<f64>,
}

impl ManeuverStep {
    #[must_use]
    pub fn new(location: Coordinate, instruction: impl Into<String>, modifier: impl Into<String>) -> Self {
        Self {
            location,
            instruction: instruction.into(),
            modifier: modifier.into(),
            name: None,
            maneuver_type: None,
            distance_meters: None,
            duration_seconds: None,
        }
    }

    /// Text to show for this step.
    ///
    /// Falls back to `"<type> <modifier> onto <name>"` when the service sent
    /// no instruction.
    #[must_use]
    pub fn display_instruction(&self) -> String {
        if !self.instruction.trim().is_empty() {
            return self.instruction.clone();
        }

        let mut text = self
            .maneuver_type
            .as_deref()
            .filter(|t| !t.is_empty())
            .unwrap_or("continue")
            .to_string();
        if !self.modifier.is_empty() {
            text.push(' ');
            text.push_str(&self.modifier);
        }
        if let Some(name) = self.name.as_deref().filter(|n| !n.is_empty()) {
            text.push_str(" onto ");
            text.push_str(name);
        }
        text
    }
}

/// An immutable route: geometry, maneuvers and the service's duration estimate.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    waypoints: Vec<Coordinate>,
    steps: Vec<ManeuverStep>,
    duration_seconds: f64,
    distance_meters: f64,
}

impl Route {
    pub fn new(
        waypoints: Vec<Coordinate>,
        steps: Vec<ManeuverStep>,
        duration_seconds: f64,
    ) -> Result<Self, RouteError> {
        if waypoints.is_empty() {
            return Err(RouteError::NoWaypoints);
        }
        if !duration_seconds.is_finite() || duration_seconds < 0.0 {
            return Err(RouteError::InvalidDuration(duration_seconds));
        }

        let distance_meters = path_length_meters(&waypoints);
        Ok(Self {
            waypoints,
            steps,
            duration_seconds,
            distance_meters,
        })
    }

    /// Override the computed length with the service-reported one.
    #[must_use]
    pub fn with_distance(mut self, distance_meters: f64) -> Self {
        if distance_meters.is_finite() && distance_meters >= 0.0 {
            self.distance_meters = distance_meters;
        }
        self
    }

    #[must_use]
    pub fn waypoints(&self) -> &[Coordinate] {
        &self.waypoints
    }

    #[must_use]
    pub fn steps(&self) -> &[ManeuverStep] {
        &self.steps
    }

    #[must_use]
    pub fn duration_seconds(&self) -> f64 {
        self.duration_seconds
    }

    #[must_use]
    pub fn distance_meters(&self) -> f64 {
        self.distance_meters
    }

    /// Final waypoint.
    #[must_use]
    pub fn destination(&self) -> Coordinate {
        // waypoints is non-empty by construction
        self.waypoints[self.waypoints.len() - 1]
    }

    /// Whole minutes to arrival: `ceil(duration / 60)`.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        reason = "duration is validated finite and non-negative"
    )]
    pub fn eta_minutes(&self) -> u32 {
        (self.duration_seconds / 60.0)
            .ceil()
            .min(f64::from(u32::MAX)) as u32
    }
}

/// Configuration for step tracking.
#[derive(Debug, Clone)]
pub struct StepTrackerConfig {
    /// Radius around a maneuver point that counts as reaching it, in meters.
    pub step_trigger_meters: f64,
}

impl Default for StepTrackerConfig {
    fn default() -> Self {
        Self {
            step_trigger_meters: 30.0,
        }
    }
}

/// Snapshot of navigation progress.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NavigationProgress {
    pub step_index: usize,
    /// Distance to the maneuver point at `step_index`; `None` for step-less
    /// routes or before the first fix.
    ///
    /// When a fix triggers an advance, this is measured to the newly current
    /// step, not to the step that was just passed.
    pub distance_to_next_step: Option<f64>,
    pub distance_to_destination: f64,
    pub eta_minutes: u32,
    pub arrival_time: DateTime<Utc>,
}

/// Tracker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationState {
    NoRoute,
    Navigating { step_index: usize },
}

#[derive(Debug, Clone)]
struct ActiveRoute {
    route: Route,
    progress: NavigationProgress,
}

/// Follows the driver along the active route.
#[derive(Debug, Clone, Default)]
pub struct RouteTracker {
    config: StepTrackerConfig,
    active: Option<ActiveRoute>,
}

impl RouteTracker {
    #[must_use]
    pub fn new(config: StepTrackerConfig) -> Self {
        Self {
            config,
            active: None,
        }
    }

    /// Install a route, starting at step 0.
    pub fn set_route(&mut self, route: Route) -> NavigationProgress {
        self.set_route_at(route, Utc::now())
    }

    /// Install a route with an explicit "now" for arrival time.
    pub fn set_route_at(&mut self, route: Route, now: DateTime<Utc>) -> NavigationProgress {
        let eta_minutes = route.eta_minutes();
        let progress = NavigationProgress {
            step_index: 0,
            distance_to_next_step: None,
            distance_to_destination: route.distance_meters(),
            eta_minutes,
            arrival_time: now + Duration::minutes(i64::from(eta_minutes)),
        };

        info!(
            "Route set: {} waypoints, {} steps, {:.0} m, ETA {} min",
            route.waypoints().len(),
            route.steps().len(),
            route.distance_meters(),
            eta_minutes
        );

        self.active = Some(ActiveRoute { route, progress });
        progress
    }

    /// Update progress for an accepted location.
    ///
    /// Returns `None` while no route is set.
    pub fn advance(&mut self, current: &Coordinate) -> Option<NavigationProgress> {
        let trigger = self.config.step_trigger_meters;
        let active = self.active.as_mut()?;
        let steps = active.route.steps();

        let distance_to_destination = distance_meters(current, &active.route.destination());
        let mut step_index = active.progress.step_index;
        let mut distance_to_next_step = None;

        if let Some(step) = steps.get(step_index) {
            let mut distance = distance_meters(current, &step.location);
            if distance < trigger && step_index + 1 < steps.len() {
                step_index += 1;
                info!(
                    "Advanced to step {}/{}: {}",
                    step_index + 1,
                    steps.len(),
                    steps[step_index].display_instruction()
                );
                distance = distance_meters(current, &steps[step_index].location);
            }
            distance_to_next_step = Some(distance);
        }

        active.progress = NavigationProgress {
            step_index,
            distance_to_next_step,
            distance_to_destination,
            ..active.progress
        };
        Some(active.progress)
    }

    /// Drop the route and return to `NoRoute`.
    pub fn clear(&mut self) {
        self.active = None;
    }

    #[must_use]
    pub fn state(&self) -> NavigationState {
        match &self.active {
            Some(active) => NavigationState::Navigating {
                step_index: active.progress.step_index,
            },
            None => NavigationState::NoRoute,
        }
    }

    #[must_use]
    pub fn has_route(&self) -> bool {
        self.active.is_some()
    }

    #[must_use]
    pub fn route(&self) -> Option<&Route> {
        self.active.as_ref().map(|a| &a.route)
    }

    #[must_use]
    pub fn progress(&self) -> Option<NavigationProgress> {
        self.active.as_ref().map(|a| a.progress)
    }

    /// The maneuver the driver is heading towards.
    #[must_use]
    pub fn current_step(&self) -> Option<&ManeuverStep> {
        let active = self.active.as_ref()?;
        active.route.steps().get(active.progress.step_index)
    }
}
