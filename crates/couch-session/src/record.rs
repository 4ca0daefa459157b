//! Session records and their stored encoding.
//!
//! A record is stored as a single JSON document:
//! ```json
//! {"cookie":{"maxAge":2000},"name":"cm","lastModified":1718000000000}
//! ```
//! `cookie` and `lastModified` are known to the store; every other field
//! belongs to the application and is carried through untouched.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Session cookie settings. Only `maxAge` is interpreted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cookie {
    /// Cookie lifetime in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age: Option<i64>,

    /// Remaining cookie fields (`expires`, `httpOnly`, `path`, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Cookie {
    /// Create a cookie with the given lifetime in milliseconds.
    pub fn with_max_age(max_age_ms: i64) -> Self {
        Self {
            max_age: Some(max_age_ms),
            extra: Map::new(),
        }
    }
}

/// A session record as exchanged with the host framework.
///
/// `D` is the application data flattened next to `cookie`. It defaults to a
/// free-form JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord<D = Map<String, Value>> {
    pub cookie: Cookie,

    /// When the store last rewrote this record. Owned by the store.
    #[serde(
        rename = "lastModified",
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_milliseconds_option"
    )]
    pub last_modified: Option<DateTime<Utc>>,

    #[serde(flatten)]
    pub data: D,
}

impl<D> SessionRecord<D> {
    /// Create a record with no `lastModified` stamp.
    pub fn new(cookie: Cookie, data: D) -> Self {
        Self {
            cookie,
            last_modified: None,
            data,
        }
    }
}

impl SessionRecord {
    /// Build a record from a JSON object such as
    /// `{"cookie": {"maxAge": 2000}, "name": "cm"}`.
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|source| Error::Deserialization {
            key: String::new(),
            source,
        })
    }
}

/// Encode `record` for storage with `lastModified` set to `stamp`.
///
/// Fails with [`Error::Serialization`] when the application data cannot be
/// represented as a JSON object.
pub fn encode<D: Serialize>(record: &SessionRecord<D>, stamp: DateTime<Utc>) -> Result<String> {
    let mut doc = serde_json::to_value(record).map_err(Error::Serialization)?;
    match &mut doc {
        Value::Object(fields) => {
            fields.insert(
                "lastModified".to_string(),
                Value::from(stamp.timestamp_millis()),
            );
        }
        _ => {
            return Err(Error::Serialization(serde::ser::Error::custom(
                "session record must serialize to a JSON object",
            )));
        }
    }
    serde_json::to_string(&doc).map_err(Error::Serialization)
}

/// Decode the document stored under `key`.
pub fn decode<D: DeserializeOwned>(key: &str, raw: &str) -> Result<SessionRecord<D>> {
    serde_json::from_str(raw).map_err(|source| Error::Deserialization {
        key: key.to_string(),
        source,
    })
}
