//! Append-only audit log for Flotilla deployment runs.
//!
//! Every orchestrator state transition, rollback decision and per-server
//! step is written as one JSON object to each configured backend whose
//! severity floor it meets:
//!
//! - [`TracingBackend`] - emits events through `tracing`
//! - [`InMemoryBackend`] - keeps events in memory (tests)
//! - [`FileBackend`] - appends JSON lines to a file
//!
//! # Example
//!
//! ```rust
//! use flotilla_audit::{AuditLogger, InMemoryBackend, TransitionEvent};
//! use flotilla_core::RunState;
//! use std::sync::Arc;
//! use uuid::Uuid;
//!
//! let backend = Arc::new(InMemoryBackend::new());
//! let logger = AuditLogger::builder()
//!     .with_backend(backend.clone())
//!     .build();
//!
//! let event = TransitionEvent::new(
//!     "production",
//!     Uuid::now_v7(),
//!     RunState::Idle,
//!     RunState::Planning,
//!     "deploy 2.4.1",
//! );
//! logger.log(&event).unwrap();
//! assert_eq!(backend.events().len(), 1);
//! ```

mod event;
mod logger;

pub use event::{
    AuditEvent, DecisionEvent, EventOutcome, EventSeverity, ServerAction, ServerEvent,
    TransitionEvent,
};
pub use logger::{
    AuditLine, AuditLogger, AuditLoggerBuilder, FileBackend, InMemoryBackend, LoggerBackend,
    LoggerError, TracingBackend,
};
