//! Immutable snapshots of one HTTP exchange.
//!
//! A [`LogEntry`] is what the recorder persists: one row per exchange, with
//! the request and response serialized as JSON documents.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

// ── HeaderMultimap ────────────────────────────────────────────

/// Case-insensitive header multimap with ordered values per name.
///
/// Serialized as `{"content-type": ["application/json"], ...}`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeaderMultimap(HeaderMap);

impl HeaderMultimap {
    pub fn new() -> Self {
        Self(HeaderMap::new())
    }

    /// All values for `name`, in the order they were received.
    pub fn get_all(&self, name: &str) -> Vec<String> {
        self.0
            .get_all(name)
            .iter()
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .collect()
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<String> {
        self.0
            .get(name)
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_header_map(&self) -> &HeaderMap {
        &self.0
    }

    pub fn into_header_map(self) -> HeaderMap {
        self.0
    }
}

impl From<HeaderMap> for HeaderMultimap {
    fn from(map: HeaderMap) -> Self {
        Self(map)
    }
}

impl From<&HeaderMap> for HeaderMultimap {
    fn from(map: &HeaderMap) -> Self {
        Self(map.clone())
    }
}

impl Serialize for HeaderMultimap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.keys_len()))?;
        for name in self.0.keys() {
            let values: Vec<String> = self
                .0
                .get_all(name)
                .iter()
                .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
                .collect();
            map.serialize_entry(name.as_str(), &values)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for HeaderMultimap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct MultimapVisitor;

        impl<'de> Visitor<'de> for MultimapVisitor {
            type Value = HeaderMultimap;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of header names to lists of values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut headers = HeaderMap::new();
                while let Some((name, values)) = access.next_entry::<String, Vec<String>>()? {
                    let name = HeaderName::from_bytes(name.as_bytes())
                        .map_err(serde::de::Error::custom)?;
                    for value in values {
                        let value =
                            HeaderValue::from_str(&value).map_err(serde::de::Error::custom)?;
                        headers.append(name.clone(), value);
                    }
                }
                Ok(HeaderMultimap(headers))
            }
        }

        deserializer.deserialize_map(MultimapVisitor)
    }
}

// ── Body encoding ─────────────────────────────────────────────

/// Bodies are stored as JSON strings; invalid UTF-8 is replaced with U+FFFD.
mod body_string {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&String::from_utf8_lossy(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Bytes::from(s))
    }
}

// ── Snapshots ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSnapshot {
    pub method: String,
    pub host: String,
    /// Request target exactly as received (path + query, or absolute-form).
    pub uri: String,
    pub header: HeaderMultimap,
    #[serde(with = "body_string")]
    pub body: Bytes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseSnapshot {
    pub status: u16,
    /// Headers as finalized on the first write.
    pub header: HeaderMultimap,
    #[serde(with = "body_string")]
    pub body: Bytes,
}

/// One recorded exchange. Built once, then owned by the recorder pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub request: RequestSnapshot,
    pub response: ResponseSnapshot,
    /// Capture start.
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(
        request: RequestSnapshot,
        response: ResponseSnapshot,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            request,
            response,
            timestamp,
        }
    }

    /// Request document as stored in the `request` column.
    pub fn request_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.request).unwrap_or(serde_json::Value::Null)
    }

    /// Response document as stored in the `response` column.
    pub fn response_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.response).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMultimap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.append(
                HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        map.into()
    }

    fn sample_request() -> RequestSnapshot {
        RequestSnapshot {
            method: "POST".into(),
            host: "api.example.com".into(),
            uri: "/v1/orders?dry_run=1".into(),
            header: headers(&[("Content-Type", "application/json"), ("Accept", "*/*")]),
            body: Bytes::from_static(b"{\"qty\":3}"),
        }
    }

    #[test]
    fn header_names_are_case_insensitive() {
        let h = headers(&[("X-Trace", "a"), ("x-trace", "b")]);
        assert_eq!(h.get_all("X-TRACE"), vec!["a", "b"]);
        assert_eq!(h.get("x-trace").as_deref(), Some("a"));
        assert_eq!(h.len(), 2);
    }

    #[test]
    fn header_multimap_serializes_as_name_to_value_list() {
        let h = headers(&[("Set-Cookie", "a=1"), ("Set-Cookie", "b=2"), ("Vary", "Accept")]);
        let v = serde_json::to_value(&h).unwrap();
        assert_eq!(v, json!({ "set-cookie": ["a=1", "b=2"], "vary": ["Accept"] }));
    }

    #[test]
    fn header_multimap_preserves_value_order_through_json() {
        let h = headers(&[("via", "1.1 a"), ("via", "1.1 b"), ("via", "1.1 c")]);
        let text = serde_json::to_string(&h).unwrap();
        let back: HeaderMultimap = serde_json::from_str(&text).unwrap();
        assert_eq!(back.get_all("via"), vec!["1.1 a", "1.1 b", "1.1 c"]);
        assert_eq!(back, h);
    }

    #[test]
    fn header_multimap_rejects_invalid_names() {
        let err = serde_json::from_value::<HeaderMultimap>(json!({ "bad name": ["x"] }));
        assert!(err.is_err());
    }

    #[test]
    fn request_snapshot_json_shape() {
        let v = serde_json::to_value(sample_request()).unwrap();
        assert_eq!(v["method"], "POST");
        assert_eq!(v["host"], "api.example.com");
        assert_eq!(v["uri"], "/v1/orders?dry_run=1");
        assert_eq!(v["header"]["content-type"], json!(["application/json"]));
        assert_eq!(v["body"], "{\"qty\":3}");
    }

    #[test]
    fn non_utf8_body_is_stored_lossily() {
        let resp = ResponseSnapshot {
            status: 200,
            header: HeaderMultimap::new(),
            body: Bytes::from_static(&[b'o', b'k', 0xff]),
        };
        let v = serde_json::to_value(&resp).unwrap();
        assert_eq!(v["body"], "ok\u{fffd}");
    }

    #[test]
    fn log_entry_exposes_column_documents() {
        let entry = LogEntry::new(
            sample_request(),
            ResponseSnapshot {
                status: 201,
                header: headers(&[("Location", "/v1/orders/9")]),
                body: Bytes::new(),
            },
            Utc::now(),
        );
        assert_eq!(entry.request_json()["method"], "POST");
        assert_eq!(entry.response_json()["status"], 201);
        assert_eq!(entry.response_json()["header"]["location"], json!(["/v1/orders/9"]));
    }
}
