//! Inbound event records and their validation.
//!
//! Records arrive as loosely-typed JSON from the protocol layer. Every field
//! is optional on the wire; [`RawTurnEvent::validate`] and
//! [`RawFeedbackEvent::validate`] turn them into the strongly typed events
//! the aggregation code works with, failing fast with
//! [`Error::MalformedEvent`].

use crate::error::{Error, Result};
use crate::types::{Device, FeedbackEvent, Intent, TurnEvent};
use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Browser recorded when the client did not report one
pub const UNKNOWN_BROWSER: &str = "unknown";

/// Intent as it appears on the wire
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawIntent {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, alias = "displayName")]
    pub name: Option<String>,
}

/// Device descriptors as they appear on the wire
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawDevice {
    #[serde(default)]
    pub browser: Option<String>,
    #[serde(default)]
    pub is_mobile: Option<bool>,
}

/// Per-turn event record before validation
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTurnEvent {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default, alias = "responseId")]
    pub event_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub subject_area: Option<String>,
    #[serde(default)]
    pub intent: Option<RawIntent>,
    #[serde(default)]
    pub query_text: Option<String>,
    #[serde(default)]
    pub language_code: Option<String>,
    #[serde(default, alias = "intentDetectionConfidence")]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub device: Option<RawDevice>,
}

impl RawTurnEvent {
    /// Validate into a [`TurnEvent`].
    pub fn validate(self) -> Result<TurnEvent> {
        let session_id = required_id(self.session_id, "sessionId")?;
        let subject_area = required_text(self.subject_area, "subjectArea")?;
        let timestamp = self
            .timestamp
            .ok_or_else(|| Error::MalformedEvent("missing timestamp".to_string()))?;

        let raw_intent = self
            .intent
            .ok_or_else(|| Error::MalformedEvent("missing intent".to_string()))?;
        let intent = Intent {
            id: required_id(raw_intent.id, "intent.id")?,
            name: required_text(raw_intent.name, "intent.name")?,
        };

        if let Some(confidence) = self.confidence {
            if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
                return Err(Error::MalformedEvent(format!(
                    "confidence out of range: {}",
                    confidence
                )));
            }
        }

        let device = self.device.unwrap_or_default();
        let browser = device
            .browser
            .map(|b| b.trim().to_string())
            .filter(|b| !b.is_empty())
            .unwrap_or_else(|| UNKNOWN_BROWSER.to_string());

        Ok(TurnEvent {
            session_id,
            event_id: self.event_id.filter(|id| !id.trim().is_empty()),
            timestamp,
            subject_area,
            intent,
            query_text: self.query_text.unwrap_or_default(),
            language_code: self.language_code.filter(|l| !l.is_empty()),
            confidence: self.confidence,
            device: Device {
                browser,
                is_mobile: device.is_mobile.unwrap_or(false),
            },
        })
    }
}

/// End-of-conversation feedback record before validation
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawFeedbackEvent {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub subject_area: Option<String>,
    pub helpful: bool,
    #[serde(default)]
    pub options: Vec<String>,
}

impl RawFeedbackEvent {
    /// Validate into a [`FeedbackEvent`]. Blank options are dropped.
    pub fn validate(self) -> Result<FeedbackEvent> {
        Ok(FeedbackEvent {
            session_id: required_id(self.session_id, "sessionId")?,
            timestamp: self
                .timestamp
                .ok_or_else(|| Error::MalformedEvent("missing timestamp".to_string()))?,
            subject_area: required_text(self.subject_area, "subjectArea")?,
            helpful: self.helpful,
            options: self
                .options
                .into_iter()
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect(),
        })
    }
}

/// One line of an ingest stream.
///
/// Feedback records are recognised by their `helpful` flag; everything else
/// is treated as a turn.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum InboundRecord {
    Feedback(RawFeedbackEvent),
    Turn(RawTurnEvent),
}

/// A validated inbound record
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Turn(TurnEvent),
    Feedback(FeedbackEvent),
}

impl InboundRecord {
    /// Parse a single JSON document
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::MalformedEvent(e.to_string()))
    }

    pub fn validate(self) -> Result<Inbound> {
        match self {
            InboundRecord::Turn(raw) => raw.validate().map(Inbound::Turn),
            InboundRecord::Feedback(raw) => raw.validate().map(Inbound::Feedback),
        }
    }
}

/// Last segment of a resource path (`projects/p/sessions/abc` -> `abc`).
pub fn last_path_segment(value: &str) -> &str {
    value
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(value)
}

fn required_text(value: Option<String>, field: &str) -> Result<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::MalformedEvent(format!("missing {}", field)))
}

fn required_id(value: Option<String>, field: &str) -> Result<String> {
    let text = required_text(value, field)?;
    let id = last_path_segment(&text);
    if id.is_empty() {
        return Err(Error::MalformedEvent(format!("empty {}", field)));
    }
    Ok(id.to_string())
}
