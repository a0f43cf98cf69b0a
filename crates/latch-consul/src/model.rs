//! Wire models for the Consul session and KV APIs

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A KV entry as returned by `GET /v1/kv/{key}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KvPair {
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "CreateIndex", default)]
    pub create_index: u64,
    #[serde(rename = "ModifyIndex", default)]
    pub modify_index: u64,
    /// Incremented each time a session acquires the entry.
    #[serde(rename = "LockIndex", default)]
    pub lock_index: u64,
    /// Type tag guarding against unrelated keys colliding with lock use.
    #[serde(rename = "Flags", default)]
    pub flags: u64,
    #[serde(rename = "Value", default, with = "base64_opt")]
    pub value: Option<Vec<u8>>,
    /// Session currently holding the entry, if any.
    #[serde(rename = "Session", default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
}

/// Body for `PUT /v1/session/create`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SessionCreateRequest {
    #[serde(rename = "Name", default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(rename = "TTL", default, skip_serializing_if = "String::is_empty")]
    pub ttl: String,
    #[serde(
        rename = "LockDelay",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub lock_delay: String,
    #[serde(rename = "Behavior", default, skip_serializing_if = "String::is_empty")]
    pub behavior: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionCreateResponse {
    #[serde(rename = "ID")]
    pub id: String,
}

/// Session info as returned by the renew/info endpoints.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "TTL", default)]
    pub ttl: String,
    #[serde(rename = "Behavior", default)]
    pub behavior: String,
}

/// Options for a (possibly blocking) KV read.
#[derive(Clone, Debug, Default)]
pub struct ReadOptions {
    /// Change index to long-poll against; `0` reads immediately.
    pub index: u64,
    /// Server-side maximum blocking time for a long-poll read.
    pub wait: Option<Duration>,
    /// Require a consistent (leader-verified) read.
    pub consistent: bool,
}

/// Result of a KV read: the entry (if present) and the change index to
/// long-poll against next.
#[derive(Clone, Debug)]
pub struct ReadResult {
    pub pair: Option<KvPair>,
    pub index: u64,
}

/// Formats a duration the way the Consul API expects ("10s", "250ms").
pub fn go_duration(d: Duration) -> String {
    if d.subsec_millis() != 0 || d.as_secs() == 0 {
        format!("{}ms", d.as_millis())
    } else {
        format!("{}s", d.as_secs())
    }
}

mod base64_opt {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(bytes) => s.serialize_some(&STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(d)?;
        match encoded {
            Some(text) => STANDARD
                .decode(text.as_bytes())
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kv_pair_value_decoding() {
        let json = r#"{
            "Key": "service/jobs/leadership",
            "CreateIndex": 10,
            "ModifyIndex": 25,
            "LockIndex": 3,
            "Flags": 42,
            "Value": "eyJuYW1lIjoidGVzdCJ9",
            "Session": "adf4238a-882b-9ddc-4a9d-5b6758e4159e"
        }"#;
        let pair: KvPair = serde_json::from_str(json).unwrap();
        assert_eq!(pair.key, "service/jobs/leadership");
        assert_eq!(pair.modify_index, 25);
        assert_eq!(pair.flags, 42);
        assert_eq!(pair.value.as_deref(), Some(br#"{"name":"test"}"#.as_ref()));
        assert_eq!(
            pair.session.as_deref(),
            Some("adf4238a-882b-9ddc-4a9d-5b6758e4159e")
        );
    }

    #[test]
    fn test_kv_pair_null_value() {
        let json = r#"{"Key": "k", "Value": null}"#;
        let pair: KvPair = serde_json::from_str(json).unwrap();
        assert!(pair.value.is_none());
        assert!(pair.session.is_none());
        assert_eq!(pair.lock_index, 0);
    }

    #[test]
    fn test_session_request_body() {
        let req = SessionCreateRequest {
            name: "scheduler".to_string(),
            ttl: "10s".to_string(),
            lock_delay: "2s".to_string(),
            behavior: "delete".to_string(),
        };
        let body = serde_json::to_value(&req).unwrap();
        assert_eq!(body["Name"], "scheduler");
        assert_eq!(body["TTL"], "10s");
        assert_eq!(body["LockDelay"], "2s");
        assert_eq!(body["Behavior"], "delete");
    }

    #[test]
    fn test_go_duration() {
        assert_eq!(go_duration(Duration::from_secs(10)), "10s");
        assert_eq!(go_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(go_duration(Duration::from_millis(1500)), "1500ms");
    }
}
