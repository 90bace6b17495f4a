//! JSON framing for presence traffic between clients and a hub.
//!
//! Hub → client messages wrap a [`PresenceEvent`] in a versioned envelope:
//! `{"v":1,"type":"sync","members":[...]}`. Client → hub bodies are plain
//! request structs.

use serde::{Deserialize, Serialize};

use crate::error::WireError;
use crate::presence::{PresenceEvent, PresenceRecord};

pub const WIRE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    v: u32,
    #[serde(flatten)]
    event: PresenceEvent,
}

pub fn encode_event(event: &PresenceEvent) -> Result<String, WireError> {
    let envelope = Envelope {
        v: WIRE_VERSION,
        event: event.clone(),
    };
    Ok(serde_json::to_string(&envelope)?)
}

pub fn decode_event(json: &str) -> Result<PresenceEvent, WireError> {
    let envelope: Envelope = serde_json::from_str(json)?;
    if envelope.v != WIRE_VERSION {
        return Err(WireError::UnsupportedVersion(envelope.v));
    }
    Ok(envelope.event)
}

/// Publish (or refresh) the sender's own record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackRequest {
    pub client_id: String,
    pub record: PresenceRecord,
}

/// Withdraw the sender's record while staying subscribed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UntrackRequest {
    pub client_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinate::Coordinate;

    fn record() -> PresenceRecord {
        let mut r = PresenceRecord::new("alice");
        r.display_position = Some(Coordinate {
            latitude: 40.0,
            longitude: -73.0,
        });
        r.published_at = 1_700_000_000_000;
        r
    }

    #[test]
    fn test_envelope_shape() {
        let json = encode_event(&PresenceEvent::Leave {
            user_ids: vec!["bob".into()],
        })
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["v"], 1);
        assert_eq!(value["type"], "leave");
        assert_eq!(value["user_ids"][0], "bob");
    }

    #[test]
    fn test_sync_survives_encoding() {
        let event = PresenceEvent::Sync {
            members: vec![record()],
        };
        let decoded = decode_event(&encode_event(&event).unwrap()).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_rejects_future_version() {
        let json = r#"{"v":2,"type":"leave","user_ids":[]}"#;
        assert!(matches!(decode_event(json), Err(WireError::UnsupportedVersion(2))));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(decode_event("not json"), Err(WireError::Json(_))));
        assert!(decode_event(r#"{"v":1,"type":"teleport"}"#).is_err());
    }

    #[test]
    fn test_record_missing_status_defaults() {
        let json = r#"{"v":1,"type":"join","members":[
            {"user_id":"x","display_position":null,"snapped_venue_id":null,"published_at":5}
        ]}"#;
        let PresenceEvent::Join { members } = decode_event(json).unwrap() else {
            panic!("expected join");
        };
        assert!(members[0].status.is_empty());
        assert_eq!(members[0].published_at, 5);
    }
}
