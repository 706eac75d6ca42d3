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

//! Wire format of the convoy channel.
//!
//! Frames are JSON text. Outbound there is a single message kind, the
//! [`PositionReport`]; inbound the server pushes full roster replacements
//! (`convoy_update`) and, for convoys without a destination, single-member
//! `location_update` frames.

mod convoy;

pub use convoy::ConvoyParser;

use serde::Serialize;
use thiserror::Error;

/// Errors that can occur while decoding inbound payloads.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid message format: {0}")]
    InvalidFormat(String),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid value for field '{field}': {value}")]
    InvalidValue { field: &'static str, value: String },
}

/// One member as reported by the server inside a roster update.
#[derive(Debug, Clone, PartialEq)]
pub struct MemberReport {
    /// Non-empty member identifier.
    pub member_id: String,
    /// Display name, if the server sent one.
    pub name: Option<String>,
    /// Last known latitude in degrees.
    pub latitude: Option<f64>,
    /// Last known longitude in degrees.
    pub longitude: Option<f64>,
    /// ETA to the destination in minutes, as computed by the server.
    pub eta_minutes: Option<f64>,
    /// Remaining driving distance to the destination in meters.
    pub distance_meters: Option<f64>,
    /// Server-side rank (1 = closest to destination).
    pub rank: Option<u32>,
}

/// Decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum ConvoyMessage {
    /// Full roster replacement.
    RosterUpdate {
        members: Vec<MemberReport>,
    },

    /// Single-member position echo, sent while the convoy has no destination.
    LocationUpdate {
        member_id: String,
        latitude: f64,
        longitude: f64,
    },
}

/// The local driver's position as published to the convoy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionReport {
    pub latitude: f64,
    pub longitude: f64,
    pub eta_minutes: Option<u32>,
}

impl PositionReport {
    /// Encode as a JSON text frame.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Trait for inbound frame parsers.
pub trait Protocol {
    /// The message type produced by this parser.
    type Message;
    /// The error type for parsing failures.
    type Error;

    /// Parse input bytes into a message.
    ///
    /// Returns `Ok(Some(message))` if parsing succeeded,
    /// `Ok(None)` if the input is valid but doesn't produce a message,
    /// or `Err(error)` if parsing failed.
    fn parse(&mut self, input: &[u8]) -> Result<Option<Self::Message>, Self::Error>;
}
