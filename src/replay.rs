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

//! Recorded-track location source.
//!
//! Plays a CSV track (`latitude,longitude,heading,speed,accuracy,timestamp`)
//! back as the device location, one fix per watch interval. Optional columns
//! may be left empty; a missing timestamp is stamped at playback time.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use chrono::{DateTime, Utc};
use convoy_client::{
    FilterConfig, LocationError, LocationProvider, LocationSubscription, PositionSample,
    WatchRequest,
};
use log::{debug, info};
use serde::Deserialize;
use tokio::time::MissedTickBehavior;

/// One row of a recorded track.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TrackPoint {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub heading: Option<f64>,
    #[serde(default)]
    pub speed: Option<f64>,
    #[serde(default)]
    pub accuracy: Option<f64>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl TrackPoint {
    fn to_sample(&self, now: DateTime<Utc>) -> PositionSample {
        PositionSample {
            latitude: self.latitude,
            longitude: self.longitude,
            heading: self.heading,
            speed: self.speed,
            accuracy: self.accuracy,
            timestamp: self.timestamp.unwrap_or(now),
        }
    }
}

/// Load a track from a CSV file
pub fn load_track<P: AsRef<Path>>(path: P) -> Result<Vec<TrackPoint>, Box<dyn std::error::Error>> {
    let file = File::open(path)?;
    read_track(BufReader::new(file))
}

/// Read a track from any CSV source
pub fn read_track<R: Read>(reader: R) -> Result<Vec<TrackPoint>, Box<dyn std::error::Error>> {
    let mut csv_reader = csv::Reader::from_reader(reader);

    let mut points = Vec::new();
    for result in csv_reader.deserialize() {
        let point: TrackPoint = result?;
        points.push(point);
    }

    info!("Loaded {} track points", points.len());
    Ok(points)
}

/// Replays a recorded track as a location watch.
#[derive(Debug, Clone)]
pub struct ReplayProvider {
    points: Vec<TrackPoint>,
}

impl ReplayProvider {
    #[must_use]
    pub fn new(points: Vec<TrackPoint>) -> Self {
        Self { points }
    }
}

impl LocationProvider for ReplayProvider {
    fn watch(
        &mut self,
        request: &WatchRequest,
        filter: FilterConfig,
    ) -> Result<LocationSubscription, LocationError> {
        if self.points.is_empty() {
            return Err(LocationError::StreamFailed("recorded track is empty".to_string()));
        }

        let (feed, subscription) = LocationSubscription::channel(request.buffer_size, filter);
        let points = self.points.clone();
        let interval = request.interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            for point in &points {
                tokio::select! {
                    () = feed.cancelled() => {
                        debug!("Replay unsubscribed");
                        return;
                    }
                    _ = ticker.tick() => {}
                }
                if !feed.push(point.to_sample(Utc::now())).await {
                    return;
                }
            }
            info!("Replay reached end of track");
        });

        Ok(subscription)
    }
}
