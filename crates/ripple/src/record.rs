//! Stream records and the decoded view handed to handlers.

use crate::codec::{unmarshall, AttributeMap};
use crate::diff::{diff_attributes, AttributeDiff};
use crate::error::RouterError;
use crate::value::Value;
use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

/// Kind of mutation carried by a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventName {
    Insert,
    Modify,
    Remove,
}

impl EventName {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::Insert => "INSERT",
            EventName::Modify => "MODIFY",
            EventName::Remove => "REMOVE",
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A batch of records as delivered by the stream source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(rename = "Records", default)]
    pub records: Vec<StreamRecord>,
}

impl StreamEvent {
    pub fn new(records: Vec<StreamRecord>) -> Self {
        Self { records }
    }
}

/// One mutation from the replicated log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamRecord {
    #[serde(rename = "eventID", default)]
    pub event_id: String,
    #[serde(rename = "eventName")]
    pub event_name: EventName,
    #[serde(rename = "eventSource", default, skip_serializing_if = "Option::is_none")]
    pub event_source: Option<String>,
    #[serde(rename = "eventSourceARN", default, skip_serializing_if = "Option::is_none")]
    pub event_source_arn: Option<String>,
    #[serde(rename = "awsRegion", default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(rename = "dynamodb")]
    pub change: StreamPayload,
}

/// Keys, images and ordering metadata of a record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StreamPayload {
    #[serde(default)]
    pub keys: AttributeMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_image: Option<AttributeMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_image: Option<AttributeMap>,
    #[serde(default)]
    pub sequence_number: String,
    /// Seconds since the epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approximate_creation_date_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

impl StreamRecord {
    pub fn sequence_number(&self) -> &str {
        &self.change.sequence_number
    }

    pub fn approximate_creation_time(&self) -> Option<DateTime<Utc>> {
        let seconds = self.change.approximate_creation_date_time?;
        let millis = (seconds * 1000.0).round() as i64;
        Utc.timestamp_millis_opt(millis).single()
    }

    /// Whether the record was written in `region`. Records that do not carry
    /// a region are treated as local.
    pub fn is_from_region(&self, region: &str) -> bool {
        self.region.as_deref().map_or(true, |r| r == region)
    }
}

/// A decoded record: keys and images as [`Value`] trees.
///
/// The diff is computed up front for `MODIFY` records only. Inserts and
/// removes have one side and get their diff computed on demand, when a
/// handler filter asks for it.
#[derive(Debug, Clone)]
pub struct RecordChange {
    pub record: StreamRecord,
    pub keys: Value,
    pub old: Option<Value>,
    pub new: Option<Value>,
    diff: Option<AttributeDiff>,
}

impl RecordChange {
    pub fn decode(record: StreamRecord) -> Result<Self, RouterError> {
        let decode = |image: &AttributeMap| {
            unmarshall(image).map_err(|source| RouterError::Decode {
                sequence_number: record.sequence_number().to_string(),
                source,
            })
        };

        let keys = decode(&record.change.keys)?;
        let old = record.change.old_image.as_ref().map(decode).transpose()?;
        let new = record.change.new_image.as_ref().map(decode).transpose()?;

        let diff = (record.event_name == EventName::Modify)
            .then(|| diff_attributes(old.as_ref(), new.as_ref()));

        Ok(Self {
            record,
            keys,
            old,
            new,
            diff,
        })
    }

    pub fn event_name(&self) -> EventName {
        self.record.event_name
    }

    pub fn sequence_number(&self) -> &str {
        self.record.sequence_number()
    }

    /// The diff between the two images.
    pub fn diff(&self) -> Cow<'_, AttributeDiff> {
        match &self.diff {
            Some(diff) => Cow::Borrowed(diff),
            None => Cow::Owned(diff_attributes(self.old.as_ref(), self.new.as_ref())),
        }
    }

    /// The image a type matcher is applied to: the new image, or the old one
    /// for removes.
    pub fn subject(&self) -> Option<&Value> {
        match self.record.event_name {
            EventName::Insert | EventName::Modify => self.new.as_ref(),
            EventName::Remove => self.old.as_ref(),
        }
    }

    pub fn new_as<T: DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
        self.new.as_ref().map(|v| serde_json::from_value(v.to_json())).transpose()
    }

    pub fn old_as<T: DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
        self.old.as_ref().map(|v| serde_json::from_value(v.to_json())).transpose()
    }

    pub fn keys_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.keys.to_json())
    }
}
