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

//! Location sampling and noise filtering.
//!
//! Raw fixes from the platform location service are pushed through a
//! [`LocationFilter`] which keeps only *accepted* samples:
//!
//! - Fixes with a reported accuracy worse than 25 m are dropped
//! - Fixes closer than 5 m to the last accepted fix are dropped (GPS jitter)
//! - Below 1 m/s the heading is pinned to the last accepted heading so a
//!   stationary marker does not spin
//!
//! The async side is a [`LocationSubscription`] fed by a [`LocationFeed`];
//! each subscription owns a fresh filter, so resubscribing starts from zero.

use std::time::Duration;

use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::geodesic::{distance_meters, Coordinate};

/// Sensor-side failures. All of them end the tracking session.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LocationError {
    #[error("location permission denied")]
    PermissionDenied,

    #[error("location stream failed: {0}")]
    StreamFailed(String),

    #[error("location stream ended")]
    StreamEnded,

    #[error("location subscription cancelled")]
    Unsubscribed,
}

/// One raw or accepted position fix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSample {
    pub latitude: f64,
    pub longitude: f64,
    /// Course over ground in degrees, north = 0.
    pub heading: Option<f64>,
    /// Ground speed in m/s.
    pub speed: Option<f64>,
    /// Horizontal accuracy radius in meters.
    pub accuracy: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl PositionSample {
    #[must_use]
    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.latitude, self.longitude)
    }
}

/// Acceptance thresholds for the filter.
#[derive(Debug, Clone)]
pub struct FilterConfig {
    /// Fixes with `accuracy` above this are rejected.
    pub max_accuracy_meters: f64,
    /// Fixes closer than this to the last accepted fix are rejected.
    pub min_movement_meters: f64,
    /// Below this speed the previous heading is kept.
    pub heading_freeze_speed_mps: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            max_accuracy_meters: 25.0,
            min_movement_meters: 5.0,
            heading_freeze_speed_mps: 1.0,
        }
    }
}

/// Stateful filter holding the last accepted sample.
#[derive(Debug, Clone, Default)]
pub struct LocationFilter {
    config: FilterConfig,
    last_accepted: Option<PositionSample>,
}

impl LocationFilter {
    #[must_use]
    pub fn new(config: FilterConfig) -> Self {
        Self {
            config,
            last_accepted: None,
        }
    }

    /// Run one raw sample through the acceptance policy.
    ///
    /// Returns the accepted (possibly heading-adjusted) sample, or `None` if it
    /// was rejected. A rejected sample leaves the filter untouched.
    pub fn accept(&mut self, mut sample: PositionSample) -> Option<PositionSample> {
        if !sample.latitude.is_finite() || !sample.longitude.is_finite() {
            debug!("Rejected fix: non-finite coordinate");
            return None;
        }

        if let Some(accuracy) = sample.accuracy {
            if accuracy.is_nan() || accuracy > self.config.max_accuracy_meters {
                debug!("Rejected fix: accuracy {:.1} m", accuracy);
                return None;
            }
        }

        if let Some(last) = &self.last_accepted {
            let moved = distance_meters(&last.coordinate(), &sample.coordinate());
            if moved < self.config.min_movement_meters {
                debug!("Rejected fix: moved only {:.1} m", moved);
                return None;
            }

            if sample
                .speed
                .is_some_and(|speed| speed < self.config.heading_freeze_speed_mps)
            {
                sample.heading = last.heading;
            }
        }

        self.last_accepted = Some(sample.clone());
        Some(sample)
    }

    /// The last accepted sample, if any.
    #[must_use]
    pub fn last_accepted(&self) -> Option<&PositionSample> {
        self.last_accepted.as_ref()
    }

    /// Forget the last accepted sample.
    pub fn reset(&mut self) {
        self.last_accepted = None;
    }
}

/// Iterator adapter yielding only accepted samples.
#[derive(Debug)]
pub struct AcceptedSamples<I> {
    inner: I,
    filter: LocationFilter,
}

impl<I> Iterator for AcceptedSamples<I>
where
    I: Iterator<Item = PositionSample>,
{
    type Item = PositionSample;

    fn next(&mut self) -> Option<Self::Item> {
        for sample in self.inner.by_ref() {
            if let Some(accepted) = self.filter.accept(sample) {
                return Some(accepted);
            }
        }
        None
    }
}

/// Filter a sequence of raw samples lazily with a fresh filter.
pub fn accepted_samples<I>(samples: I, config: FilterConfig) -> AcceptedSamples<I::IntoIter>
where
    I: IntoIterator<Item = PositionSample>,
{
    AcceptedSamples {
        inner: samples.into_iter(),
        filter: LocationFilter::new(config),
    }
}

/// Parameters handed to the platform when opening a location watch.
#[derive(Debug, Clone)]
pub struct WatchRequest {
    /// Requested interval between fixes.
    pub interval: Duration,
    /// Requested minimum displacement between fixes, in meters.
    pub distance_hint_meters: f64,
    /// Queue depth between producer and consumer.
    pub buffer_size: usize,
}

impl Default for WatchRequest {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            distance_hint_meters: 10.0,
            buffer_size: 64,
        }
    }
}

/// A source of raw position fixes, implemented by the host platform.
pub trait LocationProvider {
    /// Open a new location watch.
    fn watch(
        &mut self,
        request: &WatchRequest,
        filter: FilterConfig,
    ) -> Result<LocationSubscription, LocationError>;
}

/// Cancels a location watch. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionHandle {
    cancel_token: CancellationToken,
}

impl SubscriptionHandle {
    /// Stop the producer and end the subscription.
    pub fn unsubscribe(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_unsubscribed(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// Producer side of a location subscription.
#[derive(Debug, Clone)]
pub struct LocationFeed {
    sample_tx: mpsc::Sender<Result<PositionSample, LocationError>>,
    cancel_token: CancellationToken,
}

impl LocationFeed {
    /// Push a raw sample. Returns `false` once the consumer is gone or has
    /// unsubscribed; the producer should stop then.
    pub async fn push(&self, sample: PositionSample) -> bool {
        if self.cancel_token.is_cancelled() {
            return false;
        }
        self.sample_tx.send(Ok(sample)).await.is_ok()
    }

    /// Report a terminal sensor error.
    pub async fn fail(&self, error: LocationError) {
        let _ = self.sample_tx.send(Err(error)).await;
    }

    /// Resolves when the consumer unsubscribes.
    pub async fn cancelled(&self) {
        self.cancel_token.cancelled().await;
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// Consumer side: a lazy, non-restartable sequence of accepted samples.
#[derive(Debug)]
pub struct LocationSubscription {
    sample_rx: mpsc::Receiver<Result<PositionSample, LocationError>>,
    filter: LocationFilter,
    handle: SubscriptionHandle,
}

impl LocationSubscription {
    /// Create a connected feed/subscription pair.
    #[must_use]
    pub fn channel(buffer_size: usize, config: FilterConfig) -> (LocationFeed, Self) {
        let (sample_tx, sample_rx) = mpsc::channel(buffer_size.max(1));
        let cancel_token = CancellationToken::new();

        let feed = LocationFeed {
            sample_tx,
            cancel_token: cancel_token.clone(),
        };
        let subscription = Self {
            sample_rx,
            filter: LocationFilter::new(config),
            handle: SubscriptionHandle { cancel_token },
        };
        (feed, subscription)
    }

    /// Handle that can cancel this subscription from elsewhere.
    #[must_use]
    pub fn handle(&self) -> SubscriptionHandle {
        self.handle.clone()
    }

    /// Wait for the next accepted sample.
    ///
    /// Rejected samples are skipped silently. Errors are terminal.
    pub async fn next_accepted(&mut self) -> Result<PositionSample, LocationError> {
        loop {
            let received = tokio::select! {
                biased;
                () = self.handle.cancel_token.cancelled() => return Err(LocationError::Unsubscribed),
                received = self.sample_rx.recv() => received,
            };

            match received {
                Some(Ok(sample)) => {
                    if let Some(accepted) = self.filter.accept(sample) {
                        return Ok(accepted);
                    }
                }
                Some(Err(e)) => return Err(e),
                None => return Err(LocationError::StreamEnded),
            }
        }
    }

    /// The last accepted sample of this subscription.
    #[must_use]
    pub fn last_accepted(&self) -> Option<&PositionSample> {
        self.filter.last_accepted()
    }
}

impl Drop for LocationSubscription {
    fn drop(&mut self) {
        self.handle.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(lat: f64, lon: f64) -> PositionSample {
        PositionSample {
            latitude: lat,
            longitude: lon,
            heading: Some(90.0),
            speed: Some(10.0),
            accuracy: Some(5.0),
            timestamp: Utc::now(),
        }
    }

    // 0.00045 degrees of latitude is about 50 m
    const FIFTY_METERS_LAT: f64 = 0.00045;

    #[test]
    fn test_first_sample_accepted() {
        let mut filter = LocationFilter::default();
        assert!(filter.accept(sample(32.0, 34.0)).is_some());
        assert!(filter.last_accepted().is_some());
    }

    #[test]
    fn test_low_accuracy_rejected_regardless_of_movement() {
        let mut filter = LocationFilter::default();
        filter.accept(sample(32.0, 34.0));

        let mut far = sample(32.1, 34.1);
        far.accuracy = Some(25.5);
        assert!(filter.accept(far).is_none());

        let mut first = sample(10.0, 10.0);
        first.accuracy = Some(100.0);
        assert!(LocationFilter::default().accept(first).is_none());
    }

    #[test]
    fn test_accuracy_at_limit_or_missing_accepted() {
        let mut filter = LocationFilter::default();
        let mut s = sample(32.0, 34.0);
        s.accuracy = Some(25.0);
        assert!(filter.accept(s).is_some());

        let mut s = sample(32.0 + FIFTY_METERS_LAT, 34.0);
        s.accuracy = None;
        assert!(filter.accept(s).is_some());
    }

    #[test]
    fn test_non_finite_fix_rejected() {
        let mut filter = LocationFilter::default();
        assert!(filter.accept(sample(f64::NAN, 34.0)).is_none());
        assert!(filter.accept(sample(32.0, f64::INFINITY)).is_none());

        let mut s = sample(32.0, 34.0);
        s.accuracy = Some(f64::NAN);
        assert!(filter.accept(s).is_none());
        assert!(filter.last_accepted().is_none());

        // debounce still works after the bad fixes
        filter.accept(sample(32.0, 34.0)).unwrap();
        assert!(filter.accept(sample(32.00003, 34.0)).is_none());
    }

    #[test]
    fn test_jitter_rejected() {
        let mut filter = LocationFilter::default();
        let first = filter.accept(sample(32.0, 34.0)).unwrap();

        // ~3.3 m north
        let rejected = filter.accept(sample(32.00003, 34.0));
        assert!(rejected.is_none());
        assert_eq!(filter.last_accepted(), Some(&first));

        // a rejected sample does not become the debounce reference
        assert!(filter.accept(sample(32.00006, 34.0)).is_some());
    }

    #[test]
    fn test_debounce_property_over_many_offsets() {
        for step in 0..45 {
            let offset = f64::from(step) * 1e-6;
            let mut filter = LocationFilter::default();
            let p1 = sample(48.0, 11.0);
            let p2 = sample(48.0 + offset, 11.0 + offset);
            filter.accept(p1.clone());
            let d = distance_meters(&p1.coordinate(), &p2.coordinate());
            if d < 5.0 {
                assert!(filter.accept(p2).is_none(), "offset {offset} ({d} m) must be rejected");
            }
        }
    }

    #[test]
    fn test_heading_frozen_at_low_speed() {
        let mut filter = LocationFilter::default();
        let mut first = sample(32.0, 34.0);
        first.heading = Some(45.0);
        filter.accept(first);

        let mut slow = sample(32.0 + FIFTY_METERS_LAT, 34.0);
        slow.heading = Some(200.0);
        slow.speed = Some(0.3);
        assert_eq!(filter.accept(slow).unwrap().heading, Some(45.0));
    }

    #[test]
    fn test_heading_passes_through_when_speed_unknown_or_fast() {
        let mut filter = LocationFilter::default();
        filter.accept(sample(32.0, 34.0));

        let mut unknown = sample(32.0 + FIFTY_METERS_LAT, 34.0);
        unknown.heading = Some(10.0);
        unknown.speed = None;
        assert_eq!(filter.accept(unknown).unwrap().heading, Some(10.0));

        let mut fast = sample(32.0 + 2.0 * FIFTY_METERS_LAT, 34.0);
        fast.heading = Some(20.0);
        fast.speed = Some(1.0);
        assert_eq!(filter.accept(fast).unwrap().heading, Some(20.0));
    }

    #[test]
    fn test_slow_stream_keeps_first_heading() {
        let raw: Vec<PositionSample> = (0..3)
            .map(|i| {
                let mut s = sample(32.0 + f64::from(i) * FIFTY_METERS_LAT, 34.0);
                s.speed = Some(0.5);
                s.heading = Some(f64::from(i) * 60.0 + 15.0);
                s
            })
            .collect();

        let headings: Vec<_> = accepted_samples(raw, FilterConfig::default())
            .map(|s| s.heading)
            .collect();
        assert_eq!(headings, vec![Some(15.0), Some(15.0), Some(15.0)]);
    }

    #[test]
    fn test_iterator_skips_rejected() {
        let mut noisy = sample(32.0 + FIFTY_METERS_LAT, 34.0);
        noisy.accuracy = Some(80.0);
        let raw = vec![
            sample(32.0, 34.0),
            sample(32.00001, 34.0),
            noisy,
            sample(32.0 + 2.0 * FIFTY_METERS_LAT, 34.0),
        ];
        assert_eq!(accepted_samples(raw, FilterConfig::default()).count(), 2);
    }

    #[tokio::test]
    async fn test_subscription_filters_and_ends() {
        let (feed, mut subscription) = LocationSubscription::channel(8, FilterConfig::default());

        assert!(feed.push(sample(32.0, 34.0)).await);
        assert!(feed.push(sample(32.00001, 34.0)).await);
        assert!(feed.push(sample(32.0 + FIFTY_METERS_LAT, 34.0)).await);
        drop(feed);

        let first = subscription.next_accepted().await.unwrap();
        assert_eq!(first.latitude, 32.0);
        let second = subscription.next_accepted().await.unwrap();
        assert_eq!(second.latitude, 32.0 + FIFTY_METERS_LAT);
        assert_eq!(
            subscription.next_accepted().await,
            Err(LocationError::StreamEnded)
        );
    }

    #[tokio::test]
    async fn test_sensor_error_is_surfaced() {
        let (feed, mut subscription) = LocationSubscription::channel(8, FilterConfig::default());
        feed.fail(LocationError::PermissionDenied).await;
        assert_eq!(
            subscription.next_accepted().await,
            Err(LocationError::PermissionDenied)
        );
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_producer() {
        let (feed, mut subscription) = LocationSubscription::channel(8, FilterConfig::default());
        let handle = subscription.handle();
        handle.unsubscribe();

        assert!(feed.is_cancelled());
        assert!(!feed.push(sample(32.0, 34.0)).await);
        assert_eq!(
            subscription.next_accepted().await,
            Err(LocationError::Unsubscribed)
        );
    }

    #[tokio::test]
    async fn test_dropping_subscription_cancels_feed() {
        let (feed, subscription) = LocationSubscription::channel(8, FilterConfig::default());
        drop(subscription);
        assert!(feed.is_cancelled());
    }
}
