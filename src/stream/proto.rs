//! Stream wire envelope and typed event payloads.

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Classification the service assigns to a domain or URL.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Safe,
    Phishing,
    Malware,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Safe => "safe",
            Self::Phishing => "phishing",
            Self::Malware => "malware",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "safe" => Ok(Self::Safe),
            "phishing" => Ok(Self::Phishing),
            "malware" => Ok(Self::Malware),
            other => Err(format!("unknown category {other:?}")),
        }
    }
}

/// Wire tag of a stream event.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    UrlCreate,
    UrlUpdate,
    UrlDelete,
    DomainCreate,
    DomainUpdate,
    DomainDelete,
}

impl EventType {
    pub const ALL: [EventType; 6] = [
        Self::UrlCreate,
        Self::UrlUpdate,
        Self::UrlDelete,
        Self::DomainCreate,
        Self::DomainUpdate,
        Self::DomainDelete,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::UrlCreate => "url_create",
            Self::UrlUpdate => "url_update",
            Self::UrlDelete => "url_delete",
            Self::DomainCreate => "domain_create",
            Self::DomainUpdate => "domain_update",
            Self::DomainDelete => "domain_delete",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = EventError;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|event_type| event_type.as_str() == tag)
            .ok_or_else(|| EventError::UnknownEventType(tag.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DomainDelete {
    pub domain: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DomainCreate {
    pub domain: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DomainUpdate {
    pub domain: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Epoch seconds of the last check.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checked: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UrlDelete {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UrlCreate {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UrlUpdate {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Epoch seconds of the last check.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checked: Option<u64>,
}

/// Decoded stream event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    UrlCreate(UrlCreate),
    UrlUpdate(UrlUpdate),
    UrlDelete(UrlDelete),
    DomainCreate(DomainCreate),
    DomainUpdate(DomainUpdate),
    DomainDelete(DomainDelete),
}

impl StreamEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::UrlCreate(_) => EventType::UrlCreate,
            Self::UrlUpdate(_) => EventType::UrlUpdate,
            Self::UrlDelete(_) => EventType::UrlDelete,
            Self::DomainCreate(_) => EventType::DomainCreate,
            Self::DomainUpdate(_) => EventType::DomainUpdate,
            Self::DomainDelete(_) => EventType::DomainDelete,
        }
    }

    /// The domain or URL the event is about.
    pub fn subject(&self) -> &str {
        match self {
            Self::UrlCreate(event) => &event.url,
            Self::UrlUpdate(event) => &event.url,
            Self::UrlDelete(event) => &event.url,
            Self::DomainCreate(event) => &event.domain,
            Self::DomainUpdate(event) => &event.domain,
            Self::DomainDelete(event) => &event.domain,
        }
    }
}

/// Raw `{type, data}` frame as sent by the stream service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
}

impl EventEnvelope {
    pub fn from_value(value: Value) -> Result<Self, EventError> {
        serde_json::from_value(value).map_err(EventError::MalformedEnvelope)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(self) -> Result<StreamEvent, EventError> {
        decode_event(&self.event_type, self.data)
    }
}

#[derive(Debug, Error)]
pub enum EventError {
    #[error("unknown event type {0:?}")]
    UnknownEventType(String),

    #[error("malformed {event_type} event: {source}")]
    MalformedEvent {
        event_type: EventType,
        #[source]
        source: serde_json::Error,
    },

    #[error("malformed event envelope: {0}")]
    MalformedEnvelope(#[source] serde_json::Error),
}

/// Decodes an event payload for the given wire tag.
pub fn decode_event(tag: &str, data: Value) -> Result<StreamEvent, EventError> {
    let event_type: EventType = tag.parse()?;
    let event = match event_type {
        EventType::UrlCreate => StreamEvent::UrlCreate(payload(event_type, data)?),
        EventType::UrlUpdate => StreamEvent::UrlUpdate(payload(event_type, data)?),
        EventType::UrlDelete => StreamEvent::UrlDelete(payload(event_type, data)?),
        EventType::DomainCreate => StreamEvent::DomainCreate(payload(event_type, data)?),
        EventType::DomainUpdate => StreamEvent::DomainUpdate(payload(event_type, data)?),
        EventType::DomainDelete => StreamEvent::DomainDelete(payload(event_type, data)?),
    };
    Ok(event)
}

fn payload<T: DeserializeOwned>(event_type: EventType, data: Value) -> Result<T, EventError> {
    serde_json::from_value(data).map_err(|source| EventError::MalformedEvent { event_type, source })
}
