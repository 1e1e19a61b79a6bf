//! Device profile document polled from the server.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Deserializer};

use crate::error::ProfileError;
use crate::track_id::TrackId;

/// Desired device state as reported by one profile poll.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceProfileSnapshot {
    pub id: String,
    pub name: String,
    #[serde(deserialize_with = "flag")]
    pub mute: bool,
    #[serde(deserialize_with = "flag")]
    pub player_active: bool,
    #[serde(rename = "radioActive", deserialize_with = "flag")]
    pub recorder_active: bool,
    #[serde(rename = "soundCnt", deserialize_with = "count")]
    pub track_count: u32,
    pub volume: f32,
    #[serde(
        rename = "currentVoiceCommandId",
        default,
        deserialize_with = "track_id"
    )]
    pub track_id: TrackId,
}

// Flags arrive as JSON booleans or as 0/1.
#[derive(Deserialize)]
#[serde(untagged)]
enum Flag {
    Bool(bool),
    Int(i64),
    Float(f64),
}

fn flag<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
    Ok(match Flag::deserialize(d)? {
        Flag::Bool(b) => b,
        Flag::Int(i) => i != 0,
        Flag::Float(f) => f != 0.0,
    })
}

fn count<'de, D: Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
    let n = f64::deserialize(d)?;
    Ok(if n.is_finite() && n > 0.0 {
        n.min(f64::from(u32::MAX)) as u32
    } else {
        0
    })
}

// A missing, null or unparsable id means "no track".
fn track_id<'de, D: Deserializer<'de>>(d: D) -> Result<TrackId, D::Error> {
    let raw = Option::<serde_json::Value>::deserialize(d)?;
    Ok(raw
        .as_ref()
        .and_then(serde_json::Value::as_str)
        .and_then(|s| s.parse().ok())
        .unwrap_or_default())
}

static FIRST_PROFILE: AtomicBool = AtomicBool::new(true);

impl DeviceProfileSnapshot {
    pub fn parse(text: &str) -> Result<Self, ProfileError> {
        let profile: Self =
            serde_json::from_str(text).map_err(|e| ProfileError::Malformed(e.to_string()))?;
        profile.log();
        Ok(profile)
    }

    fn log(&self) {
        let tid = if self.track_id.is_nil() {
            String::new()
        } else {
            self.track_id.to_string()
        };
        if FIRST_PROFILE.swap(false, Ordering::Relaxed) {
            log::info!(
                "current device profile: device_id={}; device_name={}; mute_state={}; player_state={}; vol_level={:.0}; sampler_state={}; track_cnt={}; track_id={}",
                self.id,
                self.name,
                self.mute,
                self.player_active,
                self.volume,
                self.recorder_active,
                self.track_count,
                tid,
            );
        } else {
            log::debug!(
                "profile: m={} p={} v={:.0} s={} tcnt={} tid={}",
                u8::from(self.mute),
                u8::from(self.player_active),
                self.volume,
                u8::from(self.recorder_active),
                self.track_count,
                tid,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"{
        "id": "dev-1",
        "name": "Kitchen",
        "mute": 0,
        "playerActive": true,
        "radioActive": 1,
        "soundCnt": 2,
        "volume": 80,
        "currentVoiceCommandId": "6f1c2a9e-0b7d-4c1e-9a3f-2d4b5c6e7f80"
    }"#;

    #[test]
    fn test_parse_mixed_flag_encodings() {
        let p = DeviceProfileSnapshot::parse(FULL).unwrap();
        assert_eq!(p.id, "dev-1");
        assert!(!p.mute);
        assert!(p.player_active);
        assert!(p.recorder_active);
        assert_eq!(p.track_count, 2);
        assert_eq!(p.volume, 80.0);
        assert_eq!(p.track_id.to_string(), "6f1c2a9e-0b7d-4c1e-9a3f-2d4b5c6e7f80");
    }

    #[test]
    fn test_missing_or_bad_track_id_is_nil() {
        let without = FULL.replace(
            r#""currentVoiceCommandId": "6f1c2a9e-0b7d-4c1e-9a3f-2d4b5c6e7f80""#,
            r#""currentVoiceCommandId": null"#,
        );
        assert!(DeviceProfileSnapshot::parse(&without).unwrap().track_id.is_nil());

        let garbled = FULL.replace("6f1c2a9e-0b7d", "6f1c2a9e_0b7d");
        assert!(DeviceProfileSnapshot::parse(&garbled).unwrap().track_id.is_nil());
    }

    #[test]
    fn test_missing_required_field_is_malformed() {
        let broken = FULL.replace(r#""soundCnt": 2,"#, "");
        assert!(matches!(
            DeviceProfileSnapshot::parse(&broken),
            Err(ProfileError::Malformed(_))
        ));
        assert!(matches!(
            DeviceProfileSnapshot::parse("<html>"),
            Err(ProfileError::Malformed(_))
        ));
    }

    #[test]
    fn test_fractional_count() {
        let p = DeviceProfileSnapshot::parse(&FULL.replace(r#""soundCnt": 2"#, r#""soundCnt": 3.0"#))
            .unwrap();
        assert_eq!(p.track_count, 3);
    }
}
