//! Error taxonomy.
//!
//! Each layer has its own `thiserror` enum. [`ProcessingError`] is what the
//! consistency engine returns for a message; everything below it converts into
//! one of its variants.

use crate::case_ref::CaseRefError;
use crate::envelope::EventType;
use crate::model::{AddressLevel, CaseType};
use crate::questionnaire::{FormType, QuestionnaireError};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Errors from case, link, audit and outbox persistence.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// Database connection or query failed
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// A row expected to exist was not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// A row could not be encoded or decoded
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// A uniqueness constraint rejected the write
    #[error("Conflict: {0}")]
    Conflict(String),
}

/// Errors from the message broker.
#[derive(Error, Debug, Clone)]
pub enum BusError {
    /// Failed to connect to the broker
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish a record to a topic
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe to topics
    #[error("Subscription failed for topics {topics:?}: {reason}")]
    SubscriptionFailed {
        /// The topics that failed to subscribe
        topics: Vec<String>,
        /// The reason for failure
        reason: String,
    },

    /// Network or transport error
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// Errors from remote collaborators reached over HTTP.
#[derive(Error, Debug, Clone)]
pub enum CollaboratorError {
    /// Request could not be sent or no response arrived
    #[error("Transport error: {0}")]
    Transport(String),

    /// Collaborator answered with a non-success status
    #[error("Unexpected status {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body, possibly truncated
        body: String,
    },

    /// Response body could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),
}

impl CollaboratorError {
    /// Client errors other than timeouts and throttling will fail again.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Status { status, .. } => !(*status >= 400 && *status < 500) || matches!(*status, 408 | 429),
            Self::Decode(_) => false,
        }
    }
}

/// Errors from the UAC/QID supply cache.
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    /// No pair became available in time
    #[error("Timed out after {waited:?} waiting for a UAC/QID pair of type {questionnaire_type}")]
    Timeout {
        /// Questionnaire type requested
        questionnaire_type: u8,
        /// How long the caller waited
        waited: Duration,
    },

    /// The generator failed
    #[error("UAC/QID generation failed: {0}")]
    Generator(#[from] CollaboratorError),
}

impl CacheError {
    /// All cache failures clear up once the generator recovers.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        true
    }
}

/// Why an inbound message could not be applied.
#[derive(Error, Debug)]
pub enum ProcessingError {
    /// Body is not a valid envelope or payload
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// Event type does not belong to the consuming topic's family
    #[error("Unexpected event type {event_type:?} on the {family} topic")]
    UnexpectedEventType {
        /// Type found in the envelope
        event_type: EventType,
        /// Family the consumer handles
        family: &'static str,
    },

    /// Referenced case does not exist
    #[error("Case not found: {0}")]
    CaseNotFound(String),

    /// Referenced questionnaire does not exist
    #[error("QID not found: {0}")]
    QidNotFound(String),

    /// A field required for this event is missing
    #[error("Missing mandatory field: {0}")]
    MissingMandatoryField(&'static str),

    /// Retyping the case is not allowed
    #[error("Invalid case type change for case {case_id}: {reason}")]
    InvalidCaseTypeChange {
        /// Case being retyped
        case_id: Uuid,
        /// Why the change was rejected
        reason: String,
    },

    /// The event does not apply to this kind of case
    #[error("{event_type} does not apply to {case_type} case {case_id}")]
    UnsupportedCaseType {
        /// Case concerned
        case_id: Uuid,
        /// Its type
        case_type: CaseType,
        /// Event received
        event_type: EventType,
    },

    /// No rule covers this blank questionnaire
    #[error(
        "No blank questionnaire rule for case type {case_type}, level {address_level}, \
         form {form_type:?}, has other valid receipt {has_other_valid_receipt}"
    )]
    UnmappedBlankQuestionnaireRule {
        /// Case type
        case_type: CaseType,
        /// Address level
        address_level: AddressLevel,
        /// Form type of the blank questionnaire
        form_type: FormType,
        /// Whether another valid receipt exists for the same form
        has_other_valid_receipt: bool,
    },

    /// Questionnaire type could not be determined
    #[error(transparent)]
    InvalidQuestionnaireType(#[from] QuestionnaireError),

    /// Address type transition is not in the allowed table
    #[error("Invalid address type change from {from} to {to}")]
    InvalidAddressTypeChange {
        /// Current case type
        from: CaseType,
        /// Requested case type
        to: String,
    },

    /// No UAC/QID pair could be drawn
    #[error("UAC/QID supply exhausted: {0}")]
    SupplyExhausted(#[from] CacheError),

    /// Case reference could not be generated
    #[error("Case reference error: {0}")]
    CaseRef(#[from] CaseRefError),

    /// Persistence failed
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl ProcessingError {
    /// Failures that may succeed if the same message is tried again later.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::SupplyExhausted(_) | Self::Store(_))
    }

    /// Failures caused by the message contradicting the current case state.
    #[must_use]
    pub const fn is_domain_violation(&self) -> bool {
        matches!(
            self,
            Self::UnexpectedEventType { .. }
                | Self::CaseNotFound(_)
                | Self::QidNotFound(_)
                | Self::MissingMandatoryField(_)
                | Self::InvalidCaseTypeChange { .. }
                | Self::UnsupportedCaseType { .. }
                | Self::UnmappedBlankQuestionnaireRule { .. }
                | Self::InvalidQuestionnaireType(_)
                | Self::InvalidAddressTypeChange { .. }
        )
    }

    /// Short label used for metrics and exception reports.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed",
            Self::UnexpectedEventType { .. } => "unexpected_event_type",
            Self::CaseNotFound(_) => "case_not_found",
            Self::QidNotFound(_) => "qid_not_found",
            Self::MissingMandatoryField(_) => "missing_mandatory_field",
            Self::InvalidCaseTypeChange { .. } => "invalid_case_type_change",
            Self::UnsupportedCaseType { .. } => "unsupported_case_type",
            Self::UnmappedBlankQuestionnaireRule { .. } => "unmapped_blank_questionnaire_rule",
            Self::InvalidQuestionnaireType(_) => "invalid_questionnaire_type",
            Self::InvalidAddressTypeChange { .. } => "invalid_address_type_change",
            Self::SupplyExhausted(_) => "supply_exhausted",
            Self::CaseRef(_) => "case_ref",
            Self::Store(_) => "store",
        }
    }
}
