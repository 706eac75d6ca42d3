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

//! JSON parser for inbound convoy frames.
//!
//! Message format:
//! ```text
//! {"type":"convoy_update","members":[{"user_id":"a","lat":1.0,"lon":1.0,"rank":1,"distance":812.0}]}
//! {"type":"location_update","user_id":"a","lat":1.0,"lon":1.0}
//! ```

use serde::{Deserialize, Deserializer};

use super::{ConvoyMessage, MemberReport, ParseError, Protocol};

/// Parser for convoy channel frames.
#[derive(Debug, Default)]
pub struct ConvoyParser;

impl ConvoyParser {
    /// Create a new convoy frame parser.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Protocol for ConvoyParser {
    type Message = ConvoyMessage;
    type Error = ParseError;

    fn parse(&mut self, input: &[u8]) -> Result<Option<ConvoyMessage>, ParseError> {
        let frame: WireFrame =
            serde_json::from_slice(input).map_err(|e| ParseError::InvalidFormat(e.to_string()))?;

        match frame {
            WireFrame::ConvoyUpdate { members } => {
                let members = members
                    .into_iter()
                    .map(WireMember::validate)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Some(ConvoyMessage::RosterUpdate { members }))
            }
            WireFrame::LocationUpdate { user_id, lat, lon } => {
                let member_id = require_id(user_id)?;
                check_latitude(lat)?;
                check_longitude(lon)?;
                Ok(Some(ConvoyMessage::LocationUpdate {
                    member_id,
                    latitude: lat,
                    longitude: lon,
                }))
            }
            WireFrame::Unknown => Ok(None),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum WireFrame {
    #[serde(rename = "convoy_update")]
    ConvoyUpdate {
        #[serde(default)]
        members: Vec<WireMember>,
    },

    #[serde(rename = "location_update")]
    LocationUpdate {
        #[serde(deserialize_with = "member_id")]
        user_id: String,
        #[serde(alias = "latitude")]
        lat: f64,
        #[serde(alias = "longitude", alias = "lng")]
        lon: f64,
    },

    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct WireMember {
    #[serde(deserialize_with = "member_id", alias = "id")]
    user_id: String,
    #[serde(default, alias = "username", alias = "display_name")]
    name: Option<String>,
    #[serde(default, alias = "latitude")]
    lat: Option<f64>,
    #[serde(default, alias = "longitude", alias = "lng")]
    lon: Option<f64>,
    #[serde(default)]
    eta: Option<f64>,
    #[serde(default)]
    distance: Option<f64>,
    #[serde(default)]
    rank: Option<u32>,
}

impl WireMember {
    fn validate(self) -> Result<MemberReport, ParseError> {
        let member_id = require_id(self.user_id)?;

        if let Some(lat) = self.lat {
            check_latitude(lat)?;
        }
        if let Some(lon) = self.lon {
            check_longitude(lon)?;
        }
        // A half-present coordinate is as good as none.
        let (latitude, longitude) = match (self.lat, self.lon) {
            (Some(lat), Some(lon)) => (Some(lat), Some(lon)),
            _ => (None, None),
        };

        if let Some(eta) = self.eta {
            if !eta.is_finite() || eta < 0.0 {
                return Err(ParseError::InvalidValue {
                    field: "eta",
                    value: eta.to_string(),
                });
            }
        }
        if let Some(distance) = self.distance {
            if !distance.is_finite() || distance < 0.0 {
                return Err(ParseError::InvalidValue {
                    field: "distance",
                    value: distance.to_string(),
                });
            }
        }

        Ok(MemberReport {
            member_id,
            name: self.name.filter(|n| !n.trim().is_empty()),
            latitude,
            longitude,
            eta_minutes: self.eta,
            distance_meters: self.distance,
            rank: self.rank,
        })
    }
}

/// Member ids arrive as strings or as integer primary keys.
fn member_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Number(i64),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Text(text) => text,
        RawId::Number(number) => number.to_string(),
    })
}

fn require_id(id: String) -> Result<String, ParseError> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        return Err(ParseError::MissingField("user_id"));
    }
    Ok(trimmed.to_string())
}

fn check_latitude(lat: f64) -> Result<(), ParseError> {
    if lat.is_finite() && (-90.0..=90.0).contains(&lat) {
        Ok(())
    } else {
        Err(ParseError::InvalidValue {
            field: "lat",
            value: lat.to_string(),
        })
    }
}

fn check_longitude(lon: f64) -> Result<(), ParseError> {
    if lon.is_finite() && (-180.0..=180.0).contains(&lon) {
        Ok(())
    } else {
        Err(ParseError::InvalidValue {
            field: "lon",
            value: lon.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(frame: &str) -> Result<Option<ConvoyMessage>, ParseError> {
        ConvoyParser::new().parse(frame.as_bytes())
    }

    #[test]
    fn test_parse_roster_update() {
        let msg = parse(
            r#"{"type":"convoy_update","members":[
                {"user_id":"a","lat":1,"lon":1,"rank":1,"distance":120.5},
                {"user_id":"b","lat":2,"lon":2,"eta":7,"name":"Dana"}
            ]}"#,
        )
        .unwrap()
        .unwrap();

        let ConvoyMessage::RosterUpdate { members } = msg else {
            panic!("expected roster update");
        };
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].member_id, "a");
        assert_eq!(members[0].latitude, Some(1.0));
        assert_eq!(members[0].rank, Some(1));
        assert_eq!(members[0].distance_meters, Some(120.5));
        assert_eq!(members[1].name.as_deref(), Some("Dana"));
        assert_eq!(members[1].eta_minutes, Some(7.0));
    }

    #[test]
    fn test_numeric_member_id() {
        let msg = parse(r#"{"type":"convoy_update","members":[{"user_id":42,"lat":1,"lon":1}]}"#)
            .unwrap()
            .unwrap();
        let ConvoyMessage::RosterUpdate { members } = msg else {
            panic!("expected roster update");
        };
        assert_eq!(members[0].member_id, "42");
    }

    #[test]
    fn test_long_field_names_accepted() {
        let msg = parse(
            r#"{"type":"convoy_update","members":[{"user_id":"a","latitude":3.5,"longitude":4.5}]}"#,
        )
        .unwrap()
        .unwrap();
        let ConvoyMessage::RosterUpdate { members } = msg else {
            panic!("expected roster update");
        };
        assert_eq!(members[0].latitude, Some(3.5));
        assert_eq!(members[0].longitude, Some(4.5));
    }

    #[test]
    fn test_location_update() {
        let msg = parse(r#"{"type":"location_update","user_id":"a","lat":1.5,"lon":2.5}"#)
            .unwrap()
            .unwrap();
        assert_eq!(
            msg,
            ConvoyMessage::LocationUpdate {
                member_id: "a".to_string(),
                latitude: 1.5,
                longitude: 2.5,
            }
        );
    }

    #[test]
    fn test_unknown_type_ignored() {
        assert!(parse(r#"{"type":"ping"}"#).unwrap().is_none());
    }

    #[test]
    fn test_malformed_frames_rejected() {
        assert!(matches!(parse("not json"), Err(ParseError::InvalidFormat(_))));
        assert!(matches!(parse(r#"{"members":[]}"#), Err(ParseError::InvalidFormat(_))));
        assert!(matches!(
            parse(r#"{"type":"convoy_update","members":[{"lat":1,"lon":1}]}"#),
            Err(ParseError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_empty_member_id_rejected() {
        assert!(matches!(
            parse(r#"{"type":"convoy_update","members":[{"user_id":"  ","lat":1,"lon":1}]}"#),
            Err(ParseError::MissingField("user_id"))
        ));
    }

    #[test]
    fn test_out_of_range_coordinate_rejected() {
        assert!(matches!(
            parse(r#"{"type":"convoy_update","members":[{"user_id":"a","lat":91,"lon":1}]}"#),
            Err(ParseError::InvalidValue { field: "lat", .. })
        ));
    }

    #[test]
    fn test_half_coordinate_dropped() {
        let msg = parse(r#"{"type":"convoy_update","members":[{"user_id":"a","lat":1}]}"#)
            .unwrap()
            .unwrap();
        let ConvoyMessage::RosterUpdate { members } = msg else {
            panic!("expected roster update");
        };
        assert_eq!(members[0].latitude, None);
        assert_eq!(members[0].longitude, None);
    }
}
