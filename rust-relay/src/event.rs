//! Canonical subscriber event produced by the normalizer.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::RelayError;

/// Free-form metadata attached to an event.
pub type Metadata = Map<String, Value>;

/// Subscriber status as understood by SparkLoop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriberStatus {
    Confirmed,
    Unconfirmed,
    Unsubscribed,
    Bounced,
}

impl SubscriberStatus {
    pub const ALL: [SubscriberStatus; 4] = [
        SubscriberStatus::Confirmed,
        SubscriberStatus::Unconfirmed,
        SubscriberStatus::Unsubscribed,
        SubscriberStatus::Bounced,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriberStatus::Confirmed => "confirmed",
            SubscriberStatus::Unconfirmed => "unconfirmed",
            SubscriberStatus::Unsubscribed => "unsubscribed",
            SubscriberStatus::Bounced => "bounced",
        }
    }
}

impl fmt::Display for SubscriberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriberStatus {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SubscriberStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(invalid_status)
    }
}

/// Validation error listing the accepted statuses.
pub(crate) fn invalid_status() -> RelayError {
    let valid: Vec<&str> = SubscriberStatus::ALL.iter().map(|s| s.as_str()).collect();
    RelayError::validation(format!(
        "Invalid status. Must be one of: {}",
        valid.join(", ")
    ))
}

/// A validated subscriber state change.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriberEvent {
    email: String,
    status: SubscriberStatus,
    metadata: Metadata,
}

impl SubscriberEvent {
    pub(crate) fn new(email: String, status: SubscriberStatus, metadata: Metadata) -> Self {
        Self {
            email,
            status,
            metadata,
        }
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn status(&self) -> SubscriberStatus {
        self.status
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Label used in notifications: the `source` tag, else the Ghost event name.
    pub fn source_label(&self) -> &str {
        ["source", "ghost_event"]
            .iter()
            .filter_map(|key| self.metadata.get(*key).and_then(Value::as_str))
            .find(|s| !s.is_empty())
            .unwrap_or("Unknown")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_from_str() {
        assert_eq!("confirmed".parse::<SubscriberStatus>().unwrap(), SubscriberStatus::Confirmed);
        assert_eq!("bounced".parse::<SubscriberStatus>().unwrap(), SubscriberStatus::Bounced);
    }

    #[test]
    fn test_status_from_str_rejects_unknown() {
        let err = "Confirmed".parse::<SubscriberStatus>().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid status. Must be one of: confirmed, unconfirmed, unsubscribed, bounced"
        );
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(SubscriberStatus::Unsubscribed).unwrap(),
            json!("unsubscribed")
        );
    }

    #[test]
    fn test_source_label() {
        let mut metadata = Metadata::new();
        let event = SubscriberEvent::new("a@b.com".into(), SubscriberStatus::Confirmed, metadata.clone());
        assert_eq!(event.source_label(), "Unknown");

        metadata.insert("ghost_event".into(), json!("member.added"));
        let event = SubscriberEvent::new("a@b.com".into(), SubscriberStatus::Confirmed, metadata.clone());
        assert_eq!(event.source_label(), "member.added");

        metadata.insert("source".into(), json!("ghost-webhook"));
        let event = SubscriberEvent::new("a@b.com".into(), SubscriberStatus::Confirmed, metadata);
        assert_eq!(event.source_label(), "ghost-webhook");
    }
}
