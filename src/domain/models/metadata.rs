use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const MESSAGE_ID: &str = "message_id";
const CORRELATION_ID: &str = "correlation_id";
const CAUSATION_ID: &str = "causation_id";
const EXPIRES_AT: &str = "expires_at";

/// Headers carried with a message (correlation, causation, expiry, ...).
///
/// Stored as JSON text next to the payload and handed to the dispatcher
/// untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetaData(BTreeMap<String, String>);

impl MetaData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(raw)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn message_id(&self) -> Option<&str> {
        self.get(MESSAGE_ID)
    }

    pub fn set_message_id(&mut self, id: impl Into<String>) {
        self.set(MESSAGE_ID, id);
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.get(CORRELATION_ID)
    }

    pub fn set_correlation_id(&mut self, id: impl Into<String>) {
        self.set(CORRELATION_ID, id);
    }

    pub fn causation_id(&self) -> Option<&str> {
        self.get(CAUSATION_ID)
    }

    pub fn set_causation_id(&mut self, id: impl Into<String>) {
        self.set(CAUSATION_ID, id);
    }

    /// Expiry header, if present and parseable as RFC 3339.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.get(EXPIRES_AT)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|ts| ts.with_timezone(&Utc))
    }

    pub fn set_expires_at(&mut self, expires_at: DateTime<Utc>) {
        self.set(EXPIRES_AT, expires_at.to_rfc3339());
    }
}
