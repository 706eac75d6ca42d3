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

//! One tracking session: a joined convoy plus the driver's location feed.
//!
//! The session owns exactly one [`Connection`] and one
//! [`SubscriptionHandle`] at a time and is the only writer of navigation,
//! roster and camera state. [`Session::run`] drives it from a single task,
//! handling one event to completion before the next:
//!
//! ```text
//! accepted location ─┬─> route tracker ─> camera ─> publish to convoy
//!                    └─> one-shot route fetch (first fix only)
//! convoy frames ──────> roster
//! ```

use std::future::pending;

use log::{error, info, warn};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::camera::{CameraConfig, CameraController, CameraMove};
use crate::channel::{ChannelError, ChannelEvent, Connection, ConnectionConfig, ConnectionState};
use crate::geodesic::Coordinate;
use crate::location::{
    FilterConfig, LocationError, LocationSubscription, PositionSample, SubscriptionHandle,
    WatchRequest,
};
use crate::protocol::{MemberReport, PositionReport};
use crate::roster::{MemberEta, RosterAggregator, RosterConfig, RosterEntry};
use crate::route::fetch::{RouteClient, RouteClientConfig, RouteFetchError};
use crate::route::{ManeuverStep, NavigationProgress, NavigationState, Route, RouteTracker, StepTrackerConfig};

/// Errors surfaced by the session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Location(#[from] LocationError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Route(#[from] RouteFetchError),
}

/// Configuration for a session and all of its components.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub connection: ConnectionConfig,
    pub route: RouteClientConfig,
    pub watch: WatchRequest,
    pub filter: FilterConfig,
    pub steps: StepTrackerConfig,
    pub roster: RosterConfig,
    pub camera: CameraConfig,
    /// Broadcast channel capacity for session events.
    pub event_channel_capacity: usize,
    /// Queue depth for commands sent to a running session.
    pub command_channel_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            route: RouteClientConfig::default(),
            watch: WatchRequest::default(),
            filter: FilterConfig::default(),
            steps: StepTrackerConfig::default(),
            roster: RosterConfig::default(),
            camera: CameraConfig::default(),
            event_channel_capacity: 256,
            command_channel_capacity: 32,
        }
    }
}

/// Result of handling one accepted location.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationUpdate {
    pub sample: PositionSample,
    pub progress: Option<NavigationProgress>,
    /// Instruction of the step being approached.
    pub next_instruction: Option<String>,
    /// Camera move to perform, if the camera is following.
    pub camera: Option<CameraMove>,
}

/// Events published to renderers.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// An accepted location was processed.
    Location(LocationUpdate),
    /// The roster was replaced; entries are ordered by proximity.
    RosterReplaced(Vec<RosterEntry>),
    /// A route was installed.
    RouteLoaded(NavigationProgress),
    /// The route fetch failed; navigation stays in `NoRoute`.
    RouteFailed(String),
    /// Convoy channel state changed.
    ChannelState(ConnectionState),
    /// Camera move requested by a recenter.
    Camera(CameraMove),
    /// The session was torn down.
    Ended,
}

/// User actions delivered to a running session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    /// The map was dragged; stop following the driver.
    Pan,
    /// Follow the driver again and move the camera to them.
    Recenter,
    /// Reopen the route fetch after a failure.
    RetryRoute,
    /// Leave the convoy; `run` returns `Ok(())`.
    Leave,
    /// Reopen the convoy channel with the current membership.
    Reconnect,
}

/// Parameters of a pending route request.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteRequest {
    pub convoy_id: String,
    pub token: String,
    pub from: Coordinate,
}

#[derive(Debug)]
struct Membership {
    convoy_id: String,
    token: String,
}

type RouteTask = JoinHandle<Result<Route, RouteFetchError>>;

/// A convoy tracking session.
pub struct Session {
    config: SessionConfig,
    route_client: RouteClient,
    membership: Option<Membership>,
    connection: Option<Connection>,
    subscription: Option<SubscriptionHandle>,
    last_location: Option<PositionSample>,
    tracker: RouteTracker,
    roster: RosterAggregator,
    camera: CameraController,
    route_requested: bool,
    pending_route: Option<RouteTask>,
    event_tx: broadcast::Sender<SessionEvent>,
    command_tx: mpsc::Sender<SessionCommand>,
    command_rx: mpsc::Receiver<SessionCommand>,
    cancel_token: CancellationToken,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("convoy_id", &self.convoy_id())
            .field("connection", &self.connection)
            .field("navigation", &self.tracker.state())
            .field("roster_len", &self.roster.len())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(config: SessionConfig) -> Result<Self, SessionError> {
        let route_client = RouteClient::new(&config.route)?;
        let (event_tx, _) = broadcast::channel(config.event_channel_capacity.max(1));
        let (command_tx, command_rx) = mpsc::channel(config.command_channel_capacity.max(1));

        Ok(Self {
            route_client,
            membership: None,
            connection: None,
            subscription: None,
            last_location: None,
            tracker: RouteTracker::new(config.steps.clone()),
            roster: RosterAggregator::new(config.roster.clone()),
            camera: CameraController::new(config.camera.clone()),
            route_requested: false,
            pending_route: None,
            event_tx,
            command_tx,
            command_rx,
            cancel_token: CancellationToken::new(),
            config,
        })
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Subscribe to session events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    /// Token that stops [`Session::run`] when cancelled.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Sender for commands handled by [`Session::run`].
    #[must_use]
    pub fn commands(&self) -> mpsc::Sender<SessionCommand> {
        self.command_tx.clone()
    }

    /// Open the convoy channel and join `convoy_id`.
    pub async fn join(&mut self, convoy_id: &str, token: &str) -> Result<(), SessionError> {
        let connection = Connection::connect(&self.config.connection, convoy_id, token).await?;
        self.attach(connection, token);
        Ok(())
    }

    /// Join using an already open connection.
    ///
    /// Any previous connection is closed first. Navigation starts over only
    /// when `connection` belongs to a different convoy; reattaching to the
    /// current convoy keeps the route, step and roster.
    pub fn attach(&mut self, connection: Connection, token: &str) {
        if let Some(previous) = self.connection.take() {
            previous.close();
        }

        let same_convoy = self
            .membership
            .as_ref()
            .is_some_and(|m| m.convoy_id == connection.convoy_id());
        if same_convoy {
            info!("Reconnected to convoy {}", connection.convoy_id());
        } else {
            self.reset_navigation();
            info!("Joined convoy {}", connection.convoy_id());
        }
        self.membership = Some(Membership {
            convoy_id: connection.convoy_id().to_string(),
            token: token.to_string(),
        });
        self.connection = Some(connection);
    }

    /// Leave the convoy and end the session.
    pub fn leave(&mut self) {
        self.teardown();
        self.reset_navigation();
        self.last_location = None;

        if let Some(membership) = self.membership.take() {
            info!("Left convoy {}", membership.convoy_id);
        }
        self.emit(SessionEvent::Ended);
    }

    /// Handle one accepted location.
    pub fn handle_location(&mut self, sample: PositionSample) -> LocationUpdate {
        let here = sample.coordinate();
        let progress = self.tracker.advance(&here);
        let camera = self
            .camera
            .on_location(here, sample.heading, self.tracker.has_route());

        if let Some(connection) = &self.connection {
            connection.send(&PositionReport {
                latitude: sample.latitude,
                longitude: sample.longitude,
                eta_minutes: progress.map(|p| p.eta_minutes),
            });
        }

        self.last_location = Some(sample.clone());
        let update = LocationUpdate {
            sample,
            progress,
            next_instruction: self.tracker.current_step().map(ManeuverStep::display_instruction),
            camera,
        };
        self.emit(SessionEvent::Location(update.clone()));
        update
    }

    /// Claim the one route fetch allowed per session.
    ///
    /// Returns the request once, after the first accepted location of a
    /// joined session; `None` afterwards.
    pub fn take_route_request(&mut self) -> Option<RouteRequest> {
        if self.route_requested || self.tracker.has_route() {
            return None;
        }
        let membership = self.membership.as_ref()?;
        let from = self.last_location.as_ref()?.coordinate();

        self.route_requested = true;
        Some(RouteRequest {
            convoy_id: membership.convoy_id.clone(),
            token: membership.token.clone(),
            from,
        })
    }

    /// Allow another route fetch after a failure.
    pub fn retry_route(&mut self) {
        if !self.tracker.has_route() && self.pending_route.is_none() {
            self.route_requested = false;
        }
    }

    /// Install the outcome of a route fetch.
    pub fn apply_route(
        &mut self,
        result: Result<Route, RouteFetchError>,
    ) -> Option<NavigationProgress> {
        match result {
            Ok(route) => {
                let mut progress = self.tracker.set_route(route);
                if let Some(here) = self.last_location.as_ref().map(PositionSample::coordinate) {
                    if let Some(advanced) = self.tracker.advance(&here) {
                        progress = advanced;
                    }
                }
                self.emit(SessionEvent::RouteLoaded(progress));
                Some(progress)
            }
            Err(e) => {
                warn!("Route fetch failed: {}", e);
                self.emit(SessionEvent::RouteFailed(e.to_string()));
                None
            }
        }
    }

    /// Handle an event from the convoy channel.
    pub fn handle_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Roster(members) => {
                self.apply_roster(members);
            }
            ChannelEvent::StateChanged(state) => {
                if matches!(state, ConnectionState::Closed | ConnectionState::Error(_)) {
                    warn!("Convoy channel lost: {:?}", state);
                    self.connection = None;
                }
                self.emit(SessionEvent::ChannelState(state));
            }
        }
    }

    /// Replace the roster and publish it ordered by proximity.
    pub fn apply_roster(&mut self, members: Vec<MemberReport>) -> Vec<RosterEntry> {
        self.roster.update(members);
        let sorted = self.sorted_roster();
        self.emit(SessionEvent::RosterReplaced(sorted.clone()));
        sorted
    }

    /// User dragged the map.
    pub fn on_user_pan(&mut self) {
        self.camera.on_user_pan();
    }

    /// Resume following the driver.
    pub fn recenter(&mut self) -> Option<CameraMove> {
        let camera_move = self.camera.recenter();
        if let Some(mv) = camera_move {
            self.emit(SessionEvent::Camera(mv));
        }
        camera_move
    }

    /// Reopen the convoy channel for the current membership.
    ///
    /// Does nothing when the session has not joined a convoy.
    pub async fn reconnect(&mut self) -> Result<(), SessionError> {
        let Some((convoy_id, token)) = self
            .membership
            .as_ref()
            .map(|m| (m.convoy_id.clone(), m.token.clone()))
        else {
            return Ok(());
        };
        self.join(&convoy_id, &token).await
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Pan => self.on_user_pan(),
            SessionCommand::Recenter => {
                self.recenter();
            }
            SessionCommand::RetryRoute => {
                self.retry_route();
                self.spawn_route_fetch();
            }
            SessionCommand::Reconnect => {
                if let Err(e) = self.reconnect().await {
                    warn!("Reconnect failed: {}", e);
                    self.emit(SessionEvent::ChannelState(ConnectionState::Error(
                        e.to_string(),
                    )));
                }
            }
            SessionCommand::Leave => {}
        }
    }

    /// Drive the session until shutdown, [`SessionCommand::Leave`],
    /// unsubscribe, or a sensor error.
    ///
    /// Commands are handled ahead of locations that are already queued.
    /// The session is always left (channel closed, location unsubscribed)
    /// when this returns.
    pub async fn run(&mut self, mut locations: LocationSubscription) -> Result<(), SessionError> {
        if let Some(previous) = self.subscription.replace(locations.handle()) {
            previous.unsubscribe();
        }
        let cancel_token = self.cancel_token.clone();

        let result = loop {
            let input = tokio::select! {
                biased;
                () = cancel_token.cancelled() => break Ok(()),
                Some(command) = self.command_rx.recv() => Input::Command(command),
                sample = locations.next_accepted() => Input::Location(sample),
                event = next_channel_event(self.connection.as_mut()) => Input::Channel(event),
                fetched = next_route(self.pending_route.as_mut()) => Input::Route(fetched),
            };

            match input {
                Input::Command(SessionCommand::Leave) => break Ok(()),
                Input::Command(command) => self.handle_command(command).await,
                Input::Location(Ok(sample)) => {
                    self.handle_location(sample);
                    self.spawn_route_fetch();
                }
                Input::Location(Err(LocationError::Unsubscribed)) => break Ok(()),
                Input::Location(Err(e)) => {
                    error!("Location stream failed: {}", e);
                    break Err(e.into());
                }
                Input::Channel(Some(event)) => self.handle_channel_event(event),
                Input::Channel(None) => {
                    self.connection = None;
                }
                Input::Route(joined) => {
                    self.pending_route = None;
                    match joined {
                        Ok(result) => {
                            self.apply_route(result);
                        }
                        Err(e) => warn!("Route fetch task ended abnormally: {}", e),
                    }
                }
            }
        };

        self.leave();
        result
    }

    fn spawn_route_fetch(&mut self) {
        let Some(request) = self.take_route_request() else {
            return;
        };
        info!("Requesting route for convoy {}", request.convoy_id);

        let client = self.route_client.clone();
        self.pending_route = Some(tokio::spawn(async move {
            client
                .fetch(&request.convoy_id, &request.token, request.from)
                .await
        }));
    }

    /// Close the channel and the location subscription.
    fn teardown(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.close();
        }
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        if let Some(task) = self.pending_route.take() {
            task.abort();
        }
    }

    fn reset_navigation(&mut self) {
        if let Some(task) = self.pending_route.take() {
            task.abort();
        }
        self.tracker.clear();
        self.roster.clear();
        self.route_requested = false;
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event);
    }

    #[must_use]
    pub fn convoy_id(&self) -> Option<&str> {
        self.membership.as_ref().map(|m| m.convoy_id.as_str())
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection.as_ref().is_some_and(|c| !c.is_closed())
    }

    #[must_use]
    pub fn last_location(&self) -> Option<&PositionSample> {
        self.last_location.as_ref()
    }

    #[must_use]
    pub fn navigation_state(&self) -> NavigationState {
        self.tracker.state()
    }

    #[must_use]
    pub fn progress(&self) -> Option<NavigationProgress> {
        self.tracker.progress()
    }

    #[must_use]
    pub fn current_step(&self) -> Option<&ManeuverStep> {
        self.tracker.current_step()
    }

    #[must_use]
    pub fn route(&self) -> Option<&Route> {
        self.tracker.route()
    }

    #[must_use]
    pub fn roster(&self) -> &RosterAggregator {
        &self.roster
    }

    /// Roster ordered by distance from the last accepted location.
    #[must_use]
    pub fn sorted_roster(&self) -> Vec<RosterEntry> {
        let here = self.last_location.as_ref().map(PositionSample::coordinate);
        self.roster.sorted_by_proximity(here.as_ref())
    }

    /// ETA to show next to `entry`.
    #[must_use]
    pub fn member_eta(&self, entry: &RosterEntry) -> MemberEta {
        let here = self.last_location.as_ref().map(PositionSample::coordinate);
        self.roster.eta_for(entry, here.as_ref())
    }

    #[must_use]
    pub fn is_following(&self) -> bool {
        self.camera.is_following()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.teardown();
    }
}

enum Input {
    Command(SessionCommand),
    Location(Result<PositionSample, LocationError>),
    Channel(Option<ChannelEvent>),
    Route(Result<Result<Route, RouteFetchError>, JoinError>),
}

async fn next_channel_event(connection: Option<&mut Connection>) -> Option<ChannelEvent> {
    match connection {
        Some(connection) => connection.recv().await,
        None => pending().await,
    }
}

async fn next_route(task: Option<&mut RouteTask>) -> Result<Result<Route, RouteFetchError>, JoinError> {
    match task {
        Some(task) => task.await,
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::InboundFrame;
    use chrono::Utc;
    use tokio::sync::mpsc;

    const FIFTY_METERS_LAT: f64 = 0.00045;

    fn sample(lat: f64, lon: f64) -> PositionSample {
        PositionSample {
            latitude: lat,
            longitude: lon,
            heading: Some(0.0),
            speed: Some(12.0),
            accuracy: Some(4.0),
            timestamp: Utc::now(),
        }
    }

    fn member(id: &str, lat: f64, lon: f64) -> MemberReport {
        MemberReport {
            member_id: id.to_string(),
            name: None,
            latitude: Some(lat),
            longitude: Some(lon),
            eta_minutes: None,
            distance_meters: None,
            rank: None,
        }
    }

    fn test_route() -> Route {
        Route::new(
            vec![Coordinate::new(32.0, 34.8), Coordinate::new(32.02, 34.8)],
            vec![
                ManeuverStep::new(Coordinate::new(32.0, 34.8), "Head north", ""),
                ManeuverStep::new(Coordinate::new(32.01, 34.8), "Turn right", "right"),
                ManeuverStep::new(Coordinate::new(32.02, 34.8), "Arrive", ""),
            ],
            930.0,
        )
        .unwrap()
    }

    struct Wire {
        inbound: mpsc::Sender<InboundFrame>,
        outbound: mpsc::Receiver<String>,
    }

    fn joined_session() -> (Session, Wire) {
        let mut session = Session::new(SessionConfig::default()).unwrap();
        let (inbound_tx, inbound_rx) = mpsc::channel(16);
        let (outbound_tx, outbound_rx) = mpsc::channel(16);
        session.attach(Connection::from_frames("c1", inbound_rx, outbound_tx, 16), "tok");
        (
            session,
            Wire {
                inbound: inbound_tx,
                outbound: outbound_rx,
            },
        )
    }

    fn frame(text: &str) -> serde_json::Value {
        serde_json::from_str(text).unwrap()
    }

    #[tokio::test]
    async fn test_location_published_with_eta() {
        let (mut session, mut wire) = joined_session();

        // about 111 m short of the first maneuver point
        session.handle_location(sample(31.999, 34.8));
        let first = frame(&wire.outbound.recv().await.unwrap());
        assert_eq!(first["latitude"], 31.999);
        assert!(first["etaMinutes"].is_null());

        assert_eq!(session.apply_route(Ok(test_route())).unwrap().step_index, 0);
        let update = session.handle_location(sample(31.999 + FIFTY_METERS_LAT, 34.8));
        assert_eq!(update.progress.unwrap().step_index, 0);
        assert_eq!(update.next_instruction.as_deref(), Some("Head north"));
        let second = frame(&wire.outbound.recv().await.unwrap());
        assert_eq!(second["etaMinutes"], 16);
    }

    #[tokio::test]
    async fn test_route_requested_once() {
        let (mut session, _wire) = joined_session();
        assert!(session.take_route_request().is_none());

        session.handle_location(sample(32.0, 34.8));
        let request = session.take_route_request().unwrap();
        assert_eq!(request.convoy_id, "c1");
        assert_eq!(request.token, "tok");
        assert_eq!(request.from, Coordinate::new(32.0, 34.8));

        session.handle_location(sample(32.0 + FIFTY_METERS_LAT, 34.8));
        assert!(session.take_route_request().is_none());
    }

    #[tokio::test]
    async fn test_failed_route_keeps_no_route_until_retry() {
        let (mut session, _wire) = joined_session();
        session.handle_location(sample(32.0, 34.8));
        session.take_route_request().unwrap();

        assert!(session.apply_route(Err(RouteFetchError::Empty)).is_none());
        assert_eq!(session.navigation_state(), NavigationState::NoRoute);
        assert!(session.take_route_request().is_none());

        session.retry_route();
        assert!(session.take_route_request().is_some());
    }

    #[tokio::test]
    async fn test_route_applies_current_position() {
        let (mut session, _wire) = joined_session();
        // standing on the first maneuver point
        session.handle_location(sample(32.0, 34.8));
        let progress = session.apply_route(Ok(test_route())).unwrap();
        assert_eq!(progress.step_index, 1);
        assert_eq!(session.current_step().unwrap().instruction, "Turn right");
    }

    #[tokio::test]
    async fn test_roster_full_replace() {
        let (mut session, _wire) = joined_session();
        session.handle_channel_event(ChannelEvent::Roster(vec![
            member("a", 1.0, 1.0),
            member("b", 2.0, 2.0),
        ]));
        session.handle_channel_event(ChannelEvent::Roster(vec![member("a", 1.001, 1.001)]));

        let entries = session.roster().entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].member_id, "a");
        assert_eq!(entries[0].position, Some(Coordinate::new(1.001, 1.001)));
    }

    #[tokio::test]
    async fn test_pan_suppresses_camera_until_recenter() {
        let (mut session, _wire) = joined_session();
        assert!(session.handle_location(sample(32.0, 34.8)).camera.is_some());

        session.on_user_pan();
        assert!(!session.is_following());
        for i in 1..4 {
            let update = session.handle_location(sample(32.0 + f64::from(i) * FIFTY_METERS_LAT, 34.8));
            assert!(update.camera.is_none());
        }

        assert!(session.recenter().is_some());
        assert!(session.handle_location(sample(32.01, 34.8)).camera.is_some());
    }

    #[tokio::test]
    async fn test_leave_tears_everything_down() {
        let (mut session, mut wire) = joined_session();
        let (_feed, subscription) = LocationSubscription::channel(4, FilterConfig::default());
        let handle = subscription.handle();
        session.subscription = Some(handle.clone());
        session.apply_route(Ok(test_route()));
        let mut events = session.subscribe();

        session.leave();

        assert!(handle.is_unsubscribed());
        assert!(!session.is_connected());
        assert!(session.convoy_id().is_none());
        assert_eq!(session.navigation_state(), NavigationState::NoRoute);
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Ended);

        session.handle_location(sample(32.0, 34.8));
        assert!(wire.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_channel_loss_reported() {
        let (mut session, _wire) = joined_session();
        let mut events = session.subscribe();
        session.handle_channel_event(ChannelEvent::StateChanged(ConnectionState::Closed));

        assert!(!session.is_connected());
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::ChannelState(ConnectionState::Closed)
        );
        // still joined; the owner decides whether to reconnect
        assert_eq!(session.convoy_id(), Some("c1"));
    }

    fn frames_connection(convoy_id: &str) -> (Connection, Wire) {
        let (inbound_tx, inbound_rx) = mpsc::channel(16);
        let (outbound_tx, outbound_rx) = mpsc::channel(16);
        (
            Connection::from_frames(convoy_id, inbound_rx, outbound_tx, 16),
            Wire {
                inbound: inbound_tx,
                outbound: outbound_rx,
            },
        )
    }

    #[tokio::test]
    async fn test_reattach_same_convoy_keeps_navigation() {
        let (mut session, _wire) = joined_session();
        session.handle_location(sample(32.0, 34.8));
        assert!(session.take_route_request().is_some());
        session.apply_route(Ok(test_route()));
        session.apply_roster(vec![member("a", 32.005, 34.8)]);
        assert_eq!(
            session.navigation_state(),
            NavigationState::Navigating { step_index: 1 }
        );

        session.handle_channel_event(ChannelEvent::StateChanged(ConnectionState::Closed));
        let (connection, mut wire) = frames_connection("c1");
        session.attach(connection, "tok2");

        assert!(session.is_connected());
        assert_eq!(
            session.navigation_state(),
            NavigationState::Navigating { step_index: 1 }
        );
        assert_eq!(session.roster().len(), 1);
        session.handle_location(sample(32.0 + FIFTY_METERS_LAT, 34.8));
        assert!(session.take_route_request().is_none());
        assert!(!frame(&wire.outbound.recv().await.unwrap())["etaMinutes"].is_null());
    }

    #[tokio::test]
    async fn test_attach_other_convoy_starts_over() {
        let (mut session, _wire) = joined_session();
        session.handle_location(sample(32.0, 34.8));
        assert!(session.take_route_request().is_some());
        session.apply_route(Ok(test_route()));

        let (connection, _other) = frames_connection("c2");
        session.attach(connection, "tok");

        assert_eq!(session.convoy_id(), Some("c2"));
        assert_eq!(session.navigation_state(), NavigationState::NoRoute);
        assert!(session.roster().is_empty());
        let request = session.take_route_request().unwrap();
        assert_eq!(request.convoy_id, "c2");
    }

    #[tokio::test]
    async fn test_run_handles_commands() {
        let (mut session, _wire) = joined_session();
        let (feed, subscription) = LocationSubscription::channel(8, FilterConfig::default());
        let handle = subscription.handle();
        let commands = session.commands();
        let mut events = session.subscribe();

        let driver = async {
            commands.send(SessionCommand::Pan).await.unwrap();
            feed.push(sample(32.0, 34.8)).await;
            let update = loop {
                if let SessionEvent::Location(update) = events.recv().await.unwrap() {
                    break update;
                }
            };

            commands.send(SessionCommand::Recenter).await.unwrap();
            let recentered = loop {
                if let SessionEvent::Camera(mv) = events.recv().await.unwrap() {
                    break mv;
                }
            };

            commands.send(SessionCommand::Leave).await.unwrap();
            (update, recentered)
        };

        let (result, (update, recentered)) = tokio::join!(session.run(subscription), driver);

        assert!(result.is_ok());
        assert!(update.camera.is_none());
        assert_eq!(recentered.center, Coordinate::new(32.0, 34.8));
        assert!(handle.is_unsubscribed());
        assert!(session.convoy_id().is_none());
    }

    #[tokio::test]
    async fn test_reconnect_without_membership_is_noop() {
        let mut session = Session::new(SessionConfig::default()).unwrap();
        assert!(session.reconnect().await.is_ok());
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn test_run_processes_in_order_and_tears_down_on_sensor_error() {
        let (mut session, mut wire) = joined_session();
        session.apply_route(Ok(test_route()));
        let (feed, subscription) = LocationSubscription::channel(8, FilterConfig::default());
        let handle = subscription.handle();

        let producer = async {
            for i in 0..3 {
                feed.push(sample(32.0 + f64::from(i) * FIFTY_METERS_LAT, 34.8)).await;
            }
            let mut latitudes = Vec::new();
            for _ in 0..3 {
                let text = wire.outbound.recv().await.unwrap();
                latitudes.push(frame(&text)["latitude"].as_f64().unwrap());
            }
            feed.fail(LocationError::StreamFailed("gps off".to_string()))
                .await;
            latitudes
        };

        let (result, latitudes) = tokio::join!(session.run(subscription), producer);

        assert!(matches!(
            result,
            Err(SessionError::Location(LocationError::StreamFailed(_)))
        ));
        assert!(latitudes.windows(2).all(|w| w[0] < w[1]));
        assert!(handle.is_unsubscribed());
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn test_run_delivers_roster_from_channel() {
        let (mut session, wire) = joined_session();
        session.apply_route(Ok(test_route()));
        let (feed, subscription) = LocationSubscription::channel(8, FilterConfig::default());
        let mut events = session.subscribe();
        let shutdown = session.shutdown_token();

        let driver = async {
            wire.inbound
                .send(InboundFrame::Text(
                    r#"{"type":"convoy_update","members":[{"user_id":"a","lat":1,"lon":1}]}"#
                        .to_string(),
                ))
                .await
                .unwrap();
            loop {
                if let SessionEvent::RosterReplaced(entries) = events.recv().await.unwrap() {
                    shutdown.cancel();
                    return entries;
                }
            }
        };

        let (result, entries) = tokio::join!(session.run(subscription), driver);
        assert!(result.is_ok());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].display_name, "Driver a");
        assert!(feed.is_cancelled());
    }
}
