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

//! Follow / free-pan camera policy.
//!
//! The controller never touches a map itself; it returns the [`CameraMove`]
//! the renderer should perform, or `None` when the camera must stay put.

use crate::geodesic::Coordinate;

/// Zoom and pitch presets.
#[derive(Debug, Clone)]
pub struct CameraConfig {
    /// Zoom while auto-following.
    pub follow_zoom: f64,
    /// Pitch while following with a route active.
    pub navigation_pitch: f64,
    /// Zoom of the recenter move.
    pub recenter_zoom: f64,
    /// Pitch of the recenter move.
    pub recenter_pitch: f64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            follow_zoom: 17.0,
            navigation_pitch: 45.0,
            recenter_zoom: 18.0,
            recenter_pitch: 50.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CameraMode {
    #[default]
    Following,
    FreePan,
}

/// A camera move for the renderer to animate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraMove {
    pub center: Coordinate,
    /// Map rotation in degrees, north = 0.
    pub heading: f64,
    pub zoom: f64,
    /// Tilt in degrees, 0 = flat.
    pub pitch: f64,
}

#[derive(Debug, Clone, Default)]
pub struct CameraController {
    config: CameraConfig,
    mode: CameraMode,
    latest: Option<Coordinate>,
    heading: f64,
}

impl CameraController {
    #[must_use]
    pub fn new(config: CameraConfig) -> Self {
        Self {
            config,
            mode: CameraMode::Following,
            latest: None,
            heading: 0.0,
        }
    }

    #[must_use]
    pub fn mode(&self) -> CameraMode {
        self.mode
    }

    #[must_use]
    pub fn is_following(&self) -> bool {
        self.mode == CameraMode::Following
    }

    /// Record an accepted location; returns a move only while following.
    pub fn on_location(
        &mut self,
        location: Coordinate,
        heading: Option<f64>,
        route_active: bool,
    ) -> Option<CameraMove> {
        self.latest = Some(location);
        if let Some(heading) = heading {
            self.heading = heading;
        }

        if self.mode != CameraMode::Following {
            return None;
        }

        Some(CameraMove {
            center: location,
            heading: self.heading,
            zoom: self.config.follow_zoom,
            pitch: if route_active {
                self.config.navigation_pitch
            } else {
                0.0
            },
        })
    }

    /// A user drag or pan gesture: stop following.
    pub fn on_user_pan(&mut self) {
        self.mode = CameraMode::FreePan;
    }

    /// Resume following and jump to the latest location, if one is known.
    pub fn recenter(&mut self) -> Option<CameraMove> {
        self.mode = CameraMode::Following;
        self.latest.map(|center| CameraMove {
            center,
            heading: self.heading,
            zoom: self.config.recenter_zoom,
            pitch: self.config.recenter_pitch,
        })
    }
}
