//! # Census RM Core
//!
//! Domain model, wire formats and interfaces for the census case processor.
//!
//! The processor consumes at-least-once delivered events about addresses,
//! questionnaires, receipts, refusals and field work, applies them to cases and
//! UAC/QID links under strict consistency rules, and emits derived events.
//!
//! ## Modules
//!
//! - [`model`]: cases and UAC/QID links
//! - [`case_ref`]: keyed case reference generation
//! - [`questionnaire`]: questionnaire and form types
//! - [`envelope`]: inbound envelope parsing into a closed [`envelope::InboundEvent`]
//! - [`outbound`]: outbound event shapes and routing
//! - [`event_log`]: audit records
//! - [`store`], [`bus`], [`collaborators`]: interfaces implemented elsewhere
//! - [`error`]: error taxonomy

pub mod bus;
pub mod case_ref;
pub mod collaborators;
pub mod environment;
pub mod envelope;
pub mod error;
pub mod event_log;
pub mod hashing;
pub mod model;
pub mod outbound;
pub mod patch;
pub mod questionnaire;
pub mod store;

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use uuid::Uuid;

pub use error::{BusError, CacheError, CollaboratorError, ProcessingError, StoreError};
pub use model::{Address, AddressLevel, Case, CaseType, RefusalType, UacQidLink, UacQidPair};
