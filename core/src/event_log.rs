//! Append-only audit log of processed events.

use crate::envelope::{EventHeader, EventType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One audit record. Written once per processed message and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    /// Record id
    pub id: Uuid,
    /// Event type
    pub event_type: EventType,
    /// Human readable summary
    pub description: String,
    /// Payload as received, JSON text
    pub payload: String,
    /// Channel from the envelope
    pub channel: String,
    /// Source from the envelope
    pub source: String,
    /// Transaction id from the envelope
    pub transaction_id: Option<Uuid>,
    /// When the event happened, from the envelope
    pub event_date: DateTime<Utc>,
    /// When it was processed
    pub processed_at: DateTime<Utc>,
    /// Case concerned
    pub case_id: Option<Uuid>,
    /// Link concerned
    pub uac_qid_link_id: Option<Uuid>,
}

impl AuditEvent {
    /// Record for an inbound event, attached to nothing yet.
    #[must_use]
    pub fn new(
        header: &EventHeader,
        event_type: EventType,
        description: impl Into<String>,
        payload: &serde_json::Value,
        processed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            description: description.into(),
            payload: payload.to_string(),
            channel: header.channel.clone(),
            source: header.source.clone(),
            transaction_id: header.transaction_id,
            event_date: header.date_time,
            processed_at,
            case_id: None,
            uac_qid_link_id: None,
        }
    }

    /// Attach to a case.
    #[must_use]
    pub const fn for_case(mut self, case_id: Uuid) -> Self {
        self.case_id = Some(case_id);
        self
    }

    /// Attach to a UAC/QID link.
    #[must_use]
    pub const fn for_link(mut self, link_id: Uuid) -> Self {
        self.uac_qid_link_id = Some(link_id);
        self
    }
}
