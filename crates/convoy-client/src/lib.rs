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

//! Convoy client library for realtime convoy tracking and turn-by-turn
//! guidance.
//!
//! The library is split into layers that can be used on their own or wired
//! together through a [`Session`]:
//!
//! - **Geodesic**: great-circle distance, bearing and path length
//! - **Location layer**: accuracy/movement filtering of platform fixes and
//!   a cancellable subscription
//! - **Protocol layer**: JSON frames of the convoy channel
//! - **Channel layer**: WebSocket connection to a convoy
//! - **Route layer**: route fetch and step-by-step progress tracking
//! - **Roster layer**: membership state for the convoy member list
//! - **Camera**: follow / free-pan policy for a map view
//!
//! # Quick Start
//!
//! ```no_run
//! use convoy_client::{LocationSubscription, Session, SessionConfig, SessionEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SessionConfig::default();
//!     let (feed, locations) = LocationSubscription::channel(64, config.filter.clone());
//!
//!     let mut session = Session::new(config)?;
//!     session.join("convoy-42", "token").await?;
//!
//!     let mut events = session.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             if let SessionEvent::RosterReplaced(members) = event {
//!                 println!("{} members", members.len());
//!             }
//!         }
//!     });
//!
//!     // A platform location source pushes raw fixes into `feed`.
//!     drop(feed);
//!     session.run(locations).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Using Individual Layers
//!
//! ## Location Filtering
//!
//! ```
//! use chrono::Utc;
//! use convoy_client::location::{FilterConfig, LocationFilter, PositionSample};
//!
//! let mut filter = LocationFilter::new(FilterConfig::default());
//! let fix = PositionSample {
//!     latitude: 32.08,
//!     longitude: 34.78,
//!     heading: Some(90.0),
//!     speed: Some(12.0),
//!     accuracy: Some(8.0),
//!     timestamp: Utc::now(),
//! };
//! assert!(filter.accept(fix.clone()).is_some());
//! // unchanged position is rejected
//! assert!(filter.accept(fix).is_none());
//! ```
//!
//! ## Protocol Layer Only
//!
//! ```
//! use convoy_client::protocol::{ConvoyMessage, ConvoyParser, Protocol};
//!
//! let mut parser = ConvoyParser::new();
//! let frame = br#"{"type":"convoy_update","members":[{"user_id":"7","lat":32.1,"lon":34.8}]}"#;
//! if let Ok(Some(ConvoyMessage::RosterUpdate { members })) = parser.parse(frame) {
//!     assert_eq!(members[0].member_id, "7");
//! }
//! ```
//!
//! ## Route Tracking
//!
//! ```
//! use convoy_client::geodesic::Coordinate;
//! use convoy_client::route::{ManeuverStep, Route, RouteTracker, StepTrackerConfig};
//!
//! let start = Coordinate::new(32.0, 34.8);
//! let end = Coordinate::new(32.01, 34.8);
//! let route = Route::new(
//!     vec![start, end],
//!     vec![ManeuverStep::new(start, "Head north", ""), ManeuverStep::new(end, "Arrive", "")],
//!     930.0,
//! )
//! .unwrap();
//!
//! let mut tracker = RouteTracker::new(StepTrackerConfig::default());
//! tracker.set_route(route);
//! let progress = tracker.advance(&start).unwrap();
//! assert_eq!(progress.step_index, 1);
//! assert_eq!(progress.eta_minutes, 16);
//! ```

pub mod camera;
pub mod channel;
pub mod geodesic;
pub mod location;
pub mod protocol;
pub mod roster;
pub mod route;
pub mod session;

pub use camera::{CameraConfig, CameraController, CameraMode, CameraMove};
pub use channel::{ChannelError, ChannelEvent, Connection, ConnectionConfig, ConnectionState};
pub use geodesic::Coordinate;
pub use location::{
    FilterConfig, LocationError, LocationFeed, LocationFilter, LocationProvider,
    LocationSubscription, PositionSample, SubscriptionHandle, WatchRequest,
};
pub use protocol::{ConvoyMessage, ConvoyParser, MemberReport, ParseError, PositionReport, Protocol};
pub use roster::{MemberEta, RosterAggregator, RosterConfig, RosterEntry};
pub use route::fetch::{RouteClient, RouteClientConfig, RouteFetchError};
pub use route::{
    ManeuverStep, NavigationProgress, NavigationState, Route, RouteError, RouteTracker,
    StepTrackerConfig,
};
pub use session::{
    LocationUpdate, RouteRequest, Session, SessionCommand, SessionConfig, SessionError,
    SessionEvent,
};
