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

//! Terminal rendering of session events.

use chrono::{DateTime, Local, Utc};
use convoy_client::{
    ConnectionState, Coordinate, MemberEta, NavigationProgress, RosterAggregator, RosterConfig,
    RosterEntry, SessionEvent,
};

/// Turns session events into status lines.
#[derive(Debug, Default)]
pub struct Renderer {
    roster: RosterAggregator,
    here: Option<Coordinate>,
}

impl Renderer {
    #[must_use]
    pub fn new(config: RosterConfig) -> Self {
        Self {
            roster: RosterAggregator::new(config),
            here: None,
        }
    }

    pub fn render(&mut self, event: &SessionEvent) -> Vec<String> {
        match event {
            SessionEvent::Location(update) => {
                self.here = Some(update.sample.coordinate());
                let mut line = format!(
                    "pos {:.5},{:.5}",
                    update.sample.latitude, update.sample.longitude
                );
                if let Some(heading) = update.sample.heading {
                    line.push_str(&format!(" hdg {heading:.0}"));
                }
                if let Some(progress) = &update.progress {
                    line.push_str(" | ");
                    line.push_str(&step_line(progress, update.next_instruction.as_deref()));
                    line.push_str(" | ");
                    line.push_str(&eta_line(progress));
                }
                vec![line]
            }
            SessionEvent::RosterReplaced(entries) => {
                let mut lines = vec![format!("convoy: {} members", entries.len())];
                lines.extend(entries.iter().map(|e| self.member_line(e)));
                lines
            }
            SessionEvent::RouteLoaded(progress) => {
                vec![format!("route loaded: {}", eta_line(progress))]
            }
            SessionEvent::RouteFailed(reason) => vec![format!("route unavailable: {reason}")],
            SessionEvent::ChannelState(state) => vec![match state {
                ConnectionState::Connected => "channel: connected".to_string(),
                ConnectionState::Closed => "channel: closed".to_string(),
                ConnectionState::Error(e) => format!("channel: error: {e}"),
            }],
            SessionEvent::Camera(_) => Vec::new(),
            SessionEvent::Ended => vec!["session ended".to_string()],
        }
    }

    fn member_line(&self, entry: &RosterEntry) -> String {
        let rank = entry
            .rank
            .map_or_else(|| "  -".to_string(), |r| format!("#{r:>2}"));
        let distance = entry
            .distance_from(self.here.as_ref())
            .map_or_else(|| "?".to_string(), format_distance);
        let eta = match self.roster.eta_for(entry, self.here.as_ref()) {
            MemberEta::Reported(m) => format!("{m} min"),
            MemberEta::Estimated(m) => format!("~{m} min"),
            MemberEta::Unknown => "--".to_string(),
        };
        format!(
            "  {rank} {} [{}] {distance}, ETA {eta}",
            entry.display_name,
            entry.color()
        )
    }
}

fn step_line(progress: &NavigationProgress, instruction: Option<&str>) -> String {
    let instruction = instruction.unwrap_or("continue");
    match progress.distance_to_next_step {
        Some(d) => format!("{instruction} in {}", format_distance(d)),
        None => instruction.to_string(),
    }
}

fn eta_line(progress: &NavigationProgress) -> String {
    format!(
        "{} to go, ETA {} min ({})",
        format_distance(progress.distance_to_destination),
        progress.eta_minutes,
        clock(progress.arrival_time)
    )
}

fn clock(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%H:%M").to_string()
}

/// Meters below one kilometre, kilometres with one decimal above.
#[must_use]
pub fn format_distance(meters: f64) -> String {
    if meters < 1000.0 {
        format!("{meters:.0} m")
    } else {
        format!("{:.1} km", meters / 1000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_client::{LocationUpdate, PositionSample};

    fn entry(id: &str, name: &str, distance: Option<f64>, eta: Option<f64>) -> RosterEntry {
        RosterEntry {
            member_id: id.to_string(),
            display_name: name.to_string(),
            position: None,
            rank: None,
            reported_eta_minutes: eta,
            reported_distance_meters: distance,
        }
    }

    fn progress() -> NavigationProgress {
        NavigationProgress {
            step_index: 1,
            distance_to_next_step: Some(120.4),
            distance_to_destination: 3240.0,
            eta_minutes: 16,
            arrival_time: Utc::now(),
        }
    }

    #[test]
    fn test_format_distance() {
        assert_eq!(format_distance(42.4), "42 m");
        assert_eq!(format_distance(999.0), "999 m");
        assert_eq!(format_distance(3240.0), "3.2 km");
    }

    #[test]
    fn test_roster_lines() {
        let mut renderer = Renderer::new(RosterConfig::default());
        let lines = renderer.render(&SessionEvent::RosterReplaced(vec![
            entry("1", "Dana", Some(1000.0), None),
            entry("2", "Driver 2", None, Some(4.2)),
            entry("3", "Driver 3", None, None),
        ]));

        assert_eq!(lines[0], "convoy: 3 members");
        assert!(lines[1].contains("Dana"));
        assert!(lines[1].contains("1.0 km, ETA ~2 min"));
        assert!(lines[2].ends_with("?, ETA 5 min"));
        assert!(lines[3].ends_with("ETA --"));
    }

    #[test]
    fn test_location_line_with_progress() {
        let mut renderer = Renderer::new(RosterConfig::default());
        let lines = renderer.render(&SessionEvent::Location(LocationUpdate {
            sample: PositionSample {
                latitude: 32.08,
                longitude: 34.78,
                heading: Some(90.0),
                speed: Some(10.0),
                accuracy: Some(5.0),
                timestamp: Utc::now(),
            },
            progress: Some(progress()),
            next_instruction: Some("Turn right".to_string()),
            camera: None,
        }));

        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("pos 32.08000,34.78000 hdg 90"));
        assert!(lines[0].contains("Turn right in 120 m"));
        assert!(lines[0].contains("3.2 km to go, ETA 16 min"));
    }

    #[test]
    fn test_channel_and_end_lines() {
        let mut renderer = Renderer::default();
        assert_eq!(
            renderer.render(&SessionEvent::ChannelState(ConnectionState::Error(
                "reset".to_string()
            ))),
            vec!["channel: error: reset".to_string()]
        );
        assert_eq!(
            renderer.render(&SessionEvent::Ended),
            vec!["session ended".to_string()]
        );
    }
}
