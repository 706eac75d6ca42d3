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

//! Convoy roster state.
//!
//! Every inbound roster message replaces the whole member set; nothing is
//! merged across messages. Within one message, duplicate member ids resolve
//! last-write-wins while keeping the position of the first occurrence.

use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use log::debug;

use crate::geodesic::{distance_meters, Coordinate};
use crate::protocol::MemberReport;

/// Marker palette shared by every client so a member keeps one colour.
pub const MEMBER_COLORS: [&str; 8] = [
    "#FF3B30", "#FF9500", "#FFCC00", "#4CD964", "#5AC8FA", "#007AFF", "#5856D6", "#FF2D55",
];

/// Configuration for the roster aggregator.
#[derive(Debug, Clone)]
pub struct RosterConfig {
    /// Assumed cruising speed for members that report no ETA, in m/s.
    pub cruising_speed_mps: f64,
}

impl Default for RosterConfig {
    fn default() -> Self {
        Self {
            cruising_speed_mps: 13.8,
        }
    }
}

/// A member's ETA as shown next to their marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberEta {
    /// Minutes as reported by the server.
    Reported(u32),
    /// Minutes estimated locally from distance at cruising speed.
    Estimated(u32),
    /// Neither an ETA nor a distance is known.
    Unknown,
}

impl MemberEta {
    #[must_use]
    pub fn minutes(&self) -> Option<u32> {
        match self {
            Self::Reported(m) | Self::Estimated(m) => Some(*m),
            Self::Unknown => None,
        }
    }
}

/// One convoy member as seen by the local client.
#[derive(Debug, Clone, PartialEq)]
pub struct RosterEntry {
    pub member_id: String,
    pub display_name: String,
    pub position: Option<Coordinate>,
    pub rank: Option<u32>,
    /// Server-reported ETA in minutes.
    pub reported_eta_minutes: Option<f64>,
    /// Server-reported remaining distance in meters.
    pub reported_distance_meters: Option<f64>,
}

impl RosterEntry {
    /// Build an entry from a validated wire report.
    #[must_use]
    pub fn from_report(report: MemberReport) -> Self {
        let display_name = report
            .name
            .unwrap_or_else(|| format!("Driver {}", report.member_id));
        let position = match (report.latitude, report.longitude) {
            (Some(lat), Some(lon)) => Some(Coordinate::new(lat, lon)),
            _ => None,
        };

        Self {
            member_id: report.member_id,
            display_name,
            position,
            rank: report.rank,
            reported_eta_minutes: report.eta_minutes,
            reported_distance_meters: report.distance_meters,
        }
    }

    /// Distance used for ranking: reported if present, else measured from `from`.
    #[must_use]
    pub fn distance_from(&self, from: Option<&Coordinate>) -> Option<f64> {
        self.reported_distance_meters.or_else(|| {
            let from = from?;
            self.position.map(|p| distance_meters(from, &p))
        })
    }

    /// Marker colour for this member.
    #[must_use]
    pub fn color(&self) -> &'static str {
        member_color(&self.member_id)
    }
}

/// Colour for members without an id.
pub const UNKNOWN_MEMBER_COLOR: &str = "#999";

/// Deterministic palette colour for a member id.
///
/// Every client must paint a member the same colour, so this follows the
/// web client's arithmetic exactly: the accumulator is wide and only the
/// `<< 5` term is truncated to 32 bits.
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    reason = "the truncating casts reproduce 32-bit shift semantics and a palette index below 8"
)]
pub fn member_color(member_id: &str) -> &'static str {
    if member_id.is_empty() {
        return UNKNOWN_MEMBER_COLOR;
    }

    let mut hash: i64 = 0;
    for unit in member_id.encode_utf16() {
        let shifted = i64::from((hash as i32).wrapping_shl(5));
        hash = i64::from(unit) + shifted - hash;
    }
    MEMBER_COLORS[(hash.unsigned_abs() % MEMBER_COLORS.len() as u64) as usize]
}

/// Holds the current roster and answers display queries.
#[derive(Debug, Clone, Default)]
pub struct RosterAggregator {
    config: RosterConfig,
    entries: Vec<RosterEntry>,
    updated_at: Option<DateTime<Utc>>,
}

impl RosterAggregator {
    #[must_use]
    pub fn new(config: RosterConfig) -> Self {
        Self {
            config,
            entries: Vec::new(),
            updated_at: None,
        }
    }

    /// Replace the roster with `members`.
    pub fn update(&mut self, members: Vec<MemberReport>) -> Vec<RosterEntry> {
        let mut index: HashMap<String, usize> = HashMap::with_capacity(members.len());
        let mut entries: Vec<RosterEntry> = Vec::with_capacity(members.len());

        for report in members {
            let entry = RosterEntry::from_report(report);
            if let Some(&slot) = index.get(&entry.member_id) {
                debug!("Duplicate roster entry for {}, keeping later", entry.member_id);
                entries[slot] = entry;
            } else {
                index.insert(entry.member_id.clone(), entries.len());
                entries.push(entry);
            }
        }

        self.entries = entries;
        self.updated_at = Some(Utc::now());
        self.entries.clone()
    }

    /// Entries ordered by ascending distance; unknown distances sort last.
    #[must_use]
    pub fn sorted_by_proximity(&self, self_location: Option<&Coordinate>) -> Vec<RosterEntry> {
        let mut keyed: Vec<(f64, &RosterEntry)> = self
            .entries
            .iter()
            .map(|e| (e.distance_from(self_location).unwrap_or(f64::INFINITY), e))
            .collect();
        keyed.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));
        keyed.into_iter().map(|(_, e)| e.clone()).collect()
    }

    /// ETA to show for `entry`.
    #[must_use]
    pub fn eta_for(&self, entry: &RosterEntry, self_location: Option<&Coordinate>) -> MemberEta {
        if let Some(eta) = entry.reported_eta_minutes {
            return MemberEta::Reported(minutes_from_f64(eta));
        }
        match entry.distance_from(self_location) {
            Some(distance) => MemberEta::Estimated(minutes_from_f64(
                distance / self.config.cruising_speed_mps / 60.0,
            )),
            None => MemberEta::Unknown,
        }
    }

    #[must_use]
    pub fn get(&self, member_id: &str) -> Option<&RosterEntry> {
        self.entries.iter().find(|e| e.member_id == member_id)
    }

    #[must_use]
    pub fn entries(&self) -> &[RosterEntry] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// When the roster was last replaced.
    #[must_use]
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.updated_at = None;
    }
}

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    reason = "minutes are non-negative and clamped to u32"
)]
fn minutes_from_f64(value: f64) -> u32 {
    value.ceil().clamp(0.0, f64::from(u32::MAX)) as u32
}
