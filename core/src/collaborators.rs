//! Remote services the processor depends on.
//!
//! - [`UacQidGenerator`]: issues new UAC/QID pairs
//! - [`ExceptionManager`]: triages failing messages and archives skipped ones
//! - [`AddressIndex`]: receives newly reported addresses
//!
//! HTTP adapters live in the service binary; tests use the mocks in
//! `census-rm-testing`.

use crate::error::CollaboratorError;
use crate::model::{Address, AddressLevel, CaseType, UacQidPair};
use crate::questionnaire::QuestionnaireType;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Issues UAC/QID pairs.
#[async_trait]
pub trait UacQidGenerator: Send + Sync {
    /// Generate `count` new pairs of the given questionnaire type.
    ///
    /// # Errors
    ///
    /// Returns [`CollaboratorError`] if the service is unreachable or fails.
    async fn generate(
        &self,
        questionnaire_type: QuestionnaireType,
        count: usize,
    ) -> Result<Vec<UacQidPair>, CollaboratorError>;
}

/// A processing failure reported for triage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionReport {
    /// SHA-256 hex of the raw message body
    pub message_hash: String,
    /// Reporting service
    pub service: String,
    /// Topic the message was consumed from
    pub queue: String,
    /// Error classification
    pub exception_class: String,
    /// Error message
    pub exception_message: String,
}

/// What to do with a failing message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionAdvice {
    /// Archive and remove from the topic
    pub skip_it: bool,
    /// Log the failure
    pub log_it: bool,
    /// Send the raw body back for inspection
    pub peek: bool,
}

impl ExceptionAdvice {
    /// Advice used when the triage service cannot be reached.
    #[must_use]
    pub const fn log_only() -> Self {
        Self {
            skip_it: false,
            log_it: true,
            peek: false,
        }
    }
}

/// A verbatim copy of a message being skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedMessage {
    /// SHA-256 hex of the raw message body
    pub message_hash: String,
    /// Raw body
    pub message_payload: Vec<u8>,
    /// Reporting service
    pub service: String,
    /// Topic the message was consumed from
    pub queue: String,
    /// Content type header
    pub content_type: Option<String>,
    /// All headers
    pub headers: BTreeMap<String, String>,
    /// Message key
    pub routing_key: Option<String>,
}

/// Triage service for failing messages.
#[async_trait]
pub trait ExceptionManager: Send + Sync {
    /// Report a failure and receive advice.
    ///
    /// # Errors
    ///
    /// Returns [`CollaboratorError`] if the service cannot be reached.
    async fn report_exception(
        &self,
        report: ExceptionReport,
    ) -> Result<ExceptionAdvice, CollaboratorError>;

    /// Archive a message that is about to be skipped.
    ///
    /// # Errors
    ///
    /// Returns [`CollaboratorError`] if the copy was not stored.
    async fn store_skipped_message(&self, message: SkippedMessage) -> Result<(), CollaboratorError>;

    /// Send the raw body of a message under investigation.
    ///
    /// # Errors
    ///
    /// Returns [`CollaboratorError`] if the service cannot be reached.
    async fn respond_to_peek(
        &self,
        message_hash: &str,
        payload: &[u8],
    ) -> Result<(), CollaboratorError>;
}

/// A new address forwarded to the address index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAddressEnhanced {
    /// Case created for the address
    pub case_id: Uuid,
    /// Case reference
    pub case_ref: i64,
    /// Case type
    pub case_type: CaseType,
    /// Address level
    pub address_level: AddressLevel,
    /// Region
    pub region: String,
    /// Address; `uprn` holds a dummy value when none was reported
    pub address: Address,
}

/// Receives addresses that were not in the sample.
#[async_trait]
pub trait AddressIndex: Send + Sync {
    /// Publish a new address.
    ///
    /// # Errors
    ///
    /// Returns [`CollaboratorError`] if the address was not accepted.
    async fn publish(&self, address: NewAddressEnhanced) -> Result<(), CollaboratorError>;
}
