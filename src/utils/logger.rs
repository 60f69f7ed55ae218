//! Structured run events and the `tracing` backend that records them.
//!
//! The pipeline never formats log lines itself. Each phase emits a
//! [`LogEvent`] `(phase, path, outcome, detail)` into a [`Logger`] handle
//! supplied at construction; [`TracingLogger`] forwards those to `tracing`.

use std::path::{Path, PathBuf};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Run,
    Enumerate,
    Upload,
    Verify,
    Delete,
    Manifest,
    Summary,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Run => "run",
            Phase::Enumerate => "enumerate",
            Phase::Upload => "upload",
            Phase::Verify => "verify",
            Phase::Delete => "delete",
            Phase::Manifest => "manifest",
            Phase::Summary => "summary",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Started,
    Succeeded,
    Skipped,
    Retrying,
    Failed,
    Denied,
    Retained,
    Info,
}

impl EventOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            EventOutcome::Started => "started",
            EventOutcome::Succeeded => "succeeded",
            EventOutcome::Skipped => "skipped",
            EventOutcome::Retrying => "retrying",
            EventOutcome::Failed => "failed",
            EventOutcome::Denied => "denied",
            EventOutcome::Retained => "retained",
            EventOutcome::Info => "info",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    pub phase: Phase,
    pub path: Option<PathBuf>,
    pub outcome: EventOutcome,
    pub detail: Option<String>,
}

impl LogEvent {
    pub fn new(phase: Phase, outcome: EventOutcome) -> Self {
        LogEvent {
            phase,
            path: None,
            outcome,
            detail: None,
        }
    }

    pub fn path(mut self, path: &Path) -> Self {
        self.path = Some(path.to_path_buf());
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Sink for structured run events. Must be usable from concurrent workers.
pub trait Logger: Send + Sync {
    fn event(&self, event: LogEvent);
}

/// Forwards events to `tracing`, picking the level from the outcome.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn event(&self, event: LogEvent) {
        let phase = event.phase.as_str();
        let outcome = event.outcome.as_str();
        let path = event
            .path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        let detail = event.detail.as_deref().unwrap_or("");

        match event.outcome {
            EventOutcome::Failed => {
                tracing::error!(phase, path = %path, outcome, detail, "backup event")
            }
            EventOutcome::Retrying | EventOutcome::Denied | EventOutcome::Retained => {
                tracing::warn!(phase, path = %path, outcome, detail, "backup event")
            }
            EventOutcome::Skipped => {
                tracing::debug!(phase, path = %path, outcome, detail, "backup event")
            }
            _ => tracing::info!(phase, path = %path, outcome, detail, "backup event"),
        }
    }
}

/// Initialize logging with the specified level. `RUST_LOG` wins when set.
pub fn init(level: &str, json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()?;
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()?;
    }

    Ok(())
}

/// Keeps every event in memory so tests can assert on them.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct RecordingLogger {
    events: std::sync::Mutex<Vec<LogEvent>>,
}

#[cfg(test)]
impl RecordingLogger {
    pub fn events(&self) -> Vec<LogEvent> {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn count(&self, phase: Phase, outcome: EventOutcome) -> usize {
        self.events()
            .iter()
            .filter(|e| e.phase == phase && e.outcome == outcome)
            .count()
    }
}

#[cfg(test)]
impl Logger for RecordingLogger {
    fn event(&self, event: LogEvent) {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(event);
    }
}
