use std::fmt;
use std::sync::Mutex;

use serde::Serialize;

use crate::error::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Stage {
    Discover,
    Fetch,
    Parse,
    Store,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Discover => "discover",
            Self::Fetch => "fetch",
            Self::Parse => "parse",
            Self::Store => "store",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Outcome {
    Success,
    /// Failed attempt that will be retried
    Retry,
    Skipped,
    /// Entry-level problem inside an otherwise usable payload
    Warning,
    Failed,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::Retry => "retry",
            Self::Skipped => "skipped",
            Self::Warning => "warning",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub stage: Stage,
    pub descriptor_id: String,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Event {
    pub fn new(stage: Stage, descriptor_id: impl Into<String>, outcome: Outcome) -> Self {
        Self {
            stage,
            descriptor_id: descriptor_id.into(),
            outcome,
            error_kind: None,
            attempt: None,
            detail: None,
        }
    }

    pub fn attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn error(mut self, kind: ErrorKind, detail: impl fmt::Display) -> Self {
        self.error_kind = Some(kind);
        self.detail = Some(detail.to_string());
        self
    }

    pub fn detail(mut self, detail: impl fmt::Display) -> Self {
        self.detail = Some(detail.to_string());
        self
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "stage={} id={} outcome={}",
            self.stage, self.descriptor_id, self.outcome
        )?;
        if let Some(attempt) = self.attempt {
            write!(f, " attempt={attempt}")?;
        }
        if let Some(kind) = self.error_kind {
            write!(f, " error_kind={kind}")?;
        }
        if let Some(detail) = &self.detail {
            write!(f, " detail={detail:?}")?;
        }
        Ok(())
    }
}

/// Receives pipeline events. Implementations must not panic; whatever
/// happens in a sink never affects the pipeline.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &Event);
}

/// Forwards events to the `log` facade.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: &Event) {
        match event.outcome {
            Outcome::Success | Outcome::Skipped => log::info!("{event}"),
            Outcome::Retry | Outcome::Warning => log::warn!("{event}"),
            Outcome::Failed => log::error!("{event}"),
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<Event>>,
}

impl MemorySink {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: &Event) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
    }
}
