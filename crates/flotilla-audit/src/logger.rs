//! Audit logger and its backends.
//!
//! An event is serialized once and handed to every backend whose severity
//! floor it meets. A deployment keeps going when one backend fails; it
//! only sees an error when no backend accepted the event.

use std::fmt::Debug;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::event::{AuditEvent, EventSeverity};

/// One serialized audit event as handed to a backend.
#[derive(Debug, Clone, Copy)]
pub struct AuditLine<'a> {
    /// Event type identifier, e.g. `state_transition`.
    pub event_type: &'static str,
    /// Event severity.
    pub severity: EventSeverity,
    /// The event as a single-line JSON object.
    pub json: &'a str,
}

/// Destination for audit lines.
pub trait LoggerBackend: Send + Sync + Debug {
    /// Writes one line.
    fn write(&self, line: AuditLine<'_>) -> Result<(), LoggerError>;

    /// Forces buffered lines to durable storage.
    fn sync(&self) -> Result<(), LoggerError> {
        Ok(())
    }

    /// Short name used in diagnostics.
    fn name(&self) -> &'static str;
}

/// Errors that can occur while writing audit events.
#[derive(Debug, thiserror::Error)]
pub enum LoggerError {
    /// The event could not be encoded.
    #[error("cannot encode audit event: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The backend's storage failed.
    #[error("audit storage error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other backend failure.
    #[error("audit backend error: {0}")]
    Backend(String),
}

#[derive(Debug)]
struct Route {
    backend: Arc<dyn LoggerBackend>,
    floor: EventSeverity,
}

/// Fans audit events out to its backends.
#[derive(Debug)]
pub struct AuditLogger {
    routes: Vec<Route>,
}

impl AuditLogger {
    /// Creates a builder.
    #[must_use]
    pub fn builder() -> AuditLoggerBuilder {
        AuditLoggerBuilder { routes: Vec::new() }
    }

    /// Writes `event` to every backend whose floor it meets.
    ///
    /// # Errors
    ///
    /// Returns an error if the event cannot be serialized, or if every
    /// backend it was routed to rejected it.
    pub fn log<E: AuditEvent>(&self, event: &E) -> Result<(), LoggerError> {
        let severity = event.severity();
        let json = serde_json::to_string(event)?;
        let line = AuditLine {
            event_type: event.event_type(),
            severity,
            json: &json,
        };

        let mut routed = 0usize;
        let mut failures = Vec::new();
        for route in self.routes.iter().filter(|r| severity >= r.floor) {
            routed += 1;
            if let Err(e) = route.backend.write(line) {
                error!(
                    backend = route.backend.name(),
                    event_type = line.event_type,
                    error = %e,
                    "audit backend rejected event"
                );
                failures.push(e);
            }
        }

        if routed > 0 && failures.len() == routed {
            return Err(failures.swap_remove(0));
        }
        Ok(())
    }

    /// Syncs every backend.
    ///
    /// # Errors
    ///
    /// Returns the first backend sync failure.
    pub fn sync(&self) -> Result<(), LoggerError> {
        self.routes.iter().try_for_each(|r| r.backend.sync())
    }

    /// Names of the configured backends, in routing order.
    #[must_use]
    pub fn backend_names(&self) -> Vec<&'static str> {
        self.routes.iter().map(|r| r.backend.name()).collect()
    }
}

/// Builder for [`AuditLogger`].
#[derive(Debug)]
pub struct AuditLoggerBuilder {
    routes: Vec<Route>,
}

impl AuditLoggerBuilder {
    /// Routes every event to `backend`.
    #[must_use]
    pub fn with_backend(self, backend: Arc<dyn LoggerBackend>) -> Self {
        self.with_backend_at(backend, EventSeverity::Info)
    }

    /// Routes events of at least `floor` severity to `backend`.
    #[must_use]
    pub fn with_backend_at(mut self, backend: Arc<dyn LoggerBackend>, floor: EventSeverity) -> Self {
        self.routes.push(Route { backend, floor });
        self
    }

    /// Builds the logger.
    #[must_use]
    pub fn build(self) -> AuditLogger {
        AuditLogger {
            routes: self.routes,
        }
    }
}

/// Emits audit lines as `tracing` events on the `flotilla::audit` target.
#[derive(Debug, Default)]
pub struct TracingBackend;

impl TracingBackend {
    /// Creates a tracing backend.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl LoggerBackend for TracingBackend {
    fn write(&self, line: AuditLine<'_>) -> Result<(), LoggerError> {
        match line.severity {
            EventSeverity::Critical | EventSeverity::Error => {
                error!(target: "flotilla::audit", event_type = line.event_type, audit = %line.json, "audit");
            }
            EventSeverity::Warning => {
                warn!(target: "flotilla::audit", event_type = line.event_type, audit = %line.json, "audit");
            }
            EventSeverity::Info => {
                info!(target: "flotilla::audit", event_type = line.event_type, audit = %line.json, "audit");
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "tracing"
    }
}

/// Keeps audit lines in memory.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    lines: Mutex<Vec<String>>,
}

impl InMemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw JSON lines, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    /// Lines parsed back into JSON values.
    #[must_use]
    pub fn json_events(&self) -> Vec<serde_json::Value> {
        self.lines
            .lock()
            .iter()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }
}

impl LoggerBackend for InMemoryBackend {
    fn write(&self, line: AuditLine<'_>) -> Result<(), LoggerError> {
        self.lines.lock().push(line.json.to_owned());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Appends one JSON object per line to a file.
///
/// Opening never truncates, so one file accumulates the audit trail of
/// every run against an environment.
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileBackend {
    /// Opens `path` for appending, creating it and its parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or the file cannot be created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LoggerError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Path of the audit file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LoggerBackend for FileBackend {
    fn write(&self, line: AuditLine<'_>) -> Result<(), LoggerError> {
        writeln!(self.file.lock(), "{}", line.json)?;
        Ok(())
    }

    fn sync(&self) -> Result<(), LoggerError> {
        self.file.lock().sync_data()?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventOutcome, ServerAction, ServerEvent, TransitionEvent};
    use flotilla_core::RunState;
    use uuid::Uuid;

    fn transition(to: RunState) -> TransitionEvent {
        TransitionEvent::new("staging", Uuid::now_v7(), RunState::Idle, to, "deploy 1.2.0")
    }

    #[derive(Debug)]
    struct Unavailable;

    impl LoggerBackend for Unavailable {
        fn write(&self, _line: AuditLine<'_>) -> Result<(), LoggerError> {
            Err(LoggerError::Backend("sink unavailable".to_string()))
        }

        fn name(&self) -> &'static str {
            "unavailable"
        }
    }

    #[test]
    fn test_log_writes_json_line() {
        let memory = Arc::new(InMemoryBackend::new());
        let logger = AuditLogger::builder().with_backend(memory.clone()).build();

        logger.log(&transition(RunState::Planning)).unwrap();

        let events = memory.json_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["toState"], "Planning");
        assert!(!memory.events()[0].contains('\n'));
    }

    #[test]
    fn test_severity_floor_per_backend() {
        let everything = Arc::new(InMemoryBackend::new());
        let alerts = Arc::new(InMemoryBackend::new());
        let logger = AuditLogger::builder()
            .with_backend(everything.clone())
            .with_backend_at(alerts.clone(), EventSeverity::Warning)
            .build();

        logger.log(&transition(RunState::Planning)).unwrap();
        logger
            .log(&ServerEvent::new(
                "staging",
                Uuid::now_v7(),
                "web-1",
                ServerAction::Deployed,
                EventOutcome::Failure,
            ))
            .unwrap();

        assert_eq!(everything.events().len(), 2);
        let alerts = alerts.events();
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].contains("\"outcome\":\"failure\""));
    }

    #[test]
    fn test_event_below_every_floor_is_not_an_error() {
        let logger = AuditLogger::builder()
            .with_backend_at(Arc::new(Unavailable), EventSeverity::Critical)
            .build();
        assert!(logger.log(&transition(RunState::Planning)).is_ok());
    }

    #[test]
    fn test_one_failing_backend_is_tolerated() {
        let memory = Arc::new(InMemoryBackend::new());
        let logger = AuditLogger::builder()
            .with_backend(Arc::new(Unavailable))
            .with_backend(memory.clone())
            .build();

        logger.log(&transition(RunState::Planning)).unwrap();
        assert_eq!(memory.events().len(), 1);
        assert_eq!(logger.backend_names(), vec!["unavailable", "memory"]);
    }

    #[test]
    fn test_every_backend_failing_is_an_error() {
        let logger = AuditLogger::builder()
            .with_backend(Arc::new(Unavailable))
            .with_backend(Arc::new(Unavailable))
            .build();

        let err = logger.log(&transition(RunState::Failed)).unwrap_err();
        assert!(matches!(err, LoggerError::Backend(_)));
    }

    #[test]
    fn test_tracing_backend_accepts_every_severity() {
        let logger = AuditLogger::builder()
            .with_backend(Arc::new(TracingBackend::new()))
            .build();
        for to in [RunState::Planning, RunState::RollingBack, RunState::Failed] {
            logger.log(&transition(to)).unwrap();
        }
    }

    #[test]
    fn test_file_backend_appends_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit").join("staging.jsonl");

        for _ in 0..2 {
            let backend = FileBackend::open(&path).unwrap();
            assert_eq!(backend.path(), path.as_path());
            let logger = AuditLogger::builder().with_backend(Arc::new(backend)).build();
            logger.log(&transition(RunState::Planning)).unwrap();
            logger.sync().unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            assert_eq!(value["environment"], "staging");
        }
    }
}
