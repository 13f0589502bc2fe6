use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};

use crate::config::DiagnosticsConfig;

/// Structured trace event from the lock manager's internals
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub component: String,
    pub message: String,
    /// Id of the dispatched call the event belongs to
    pub trace_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

impl LogLevel {
    pub fn parse(s: &str) -> Option<LogLevel> {
        match s.to_ascii_lowercase().as_str() {
            "debug" | "trace" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }

    fn as_log_level(self) -> log::Level {
        match self {
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Info => log::Level::Info,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Error => log::Level::Error,
        }
    }
}

impl LogEvent {
    pub fn new(component: impl Into<String>, level: LogLevel, message: impl Into<String>) -> Self {
        LogEvent {
            timestamp: Utc::now(),
            level,
            component: component.into(),
            message: message.into(),
            trace_id: None,
        }
    }

    /// Tie the event to one dispatched call
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }
}

impl std::fmt::Display for LogEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] {} {}: {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            self.level,
            self.component,
            self.message
        )?;
        if let Some(trace_id) = &self.trace_id {
            write!(f, " [trace_id:{}]", trace_id)?;
        }
        Ok(())
    }
}

/// Bounded buffer of trace events, oldest dropped first
struct EventLog {
    events: Vec<LogEvent>,
    max_size: usize,
    min_level: LogLevel,
}

impl EventLog {
    fn new(max_size: usize, min_level: LogLevel) -> Self {
        EventLog {
            events: Vec::new(),
            max_size,
            min_level,
        }
    }

    fn log(&mut self, event: LogEvent) {
        if event.level >= self.min_level {
            self.events.push(event);
            if self.events.len() > self.max_size {
                self.events.remove(0);
            }
        }
    }
}

/// Sink for per-registry tracing.
///
/// Each `FileRegistry` owns one, so tests can turn tracing on for a single
/// instance instead of flipping process-wide flags.
pub trait DiagnosticsHook: Send + Sync {
    /// Cheap check so callers can skip formatting.
    fn enabled(&self) -> bool {
        true
    }

    fn record(&self, event: LogEvent);
}

/// Build and record an event only when the hook is listening.
pub fn trace<F>(hook: &dyn DiagnosticsHook, component: &str, level: LogLevel, message: F)
where
    F: FnOnce() -> String,
{
    if hook.enabled() {
        hook.record(LogEvent::new(component, level, message()));
    }
}

/// Like `trace`, for events that belong to one dispatched call.
pub fn trace_call<F>(hook: &dyn DiagnosticsHook, component: &str, level: LogLevel, trace_id: &str, message: F)
where
    F: FnOnce() -> String,
{
    if hook.enabled() {
        hook.record(LogEvent::new(component, level, message()).with_trace_id(trace_id));
    }
}

pub struct NullDiagnostics;

impl DiagnosticsHook for NullDiagnostics {
    fn enabled(&self) -> bool {
        false
    }

    fn record(&self, _event: LogEvent) {}
}

/// Forwards events to the `log` facade.
pub struct LogDiagnostics {
    min_level: LogLevel,
}

impl LogDiagnostics {
    pub fn new(min_level: LogLevel) -> Self {
        LogDiagnostics { min_level }
    }
}

impl DiagnosticsHook for LogDiagnostics {
    fn enabled(&self) -> bool {
        log::log_enabled!(self.min_level.as_log_level())
    }

    fn record(&self, event: LogEvent) {
        if event.level < self.min_level {
            return;
        }
        match &event.trace_id {
            Some(id) => log::log!(
                target: "nlm_lockd",
                event.level.as_log_level(),
                "[{}] {}: {}",
                id,
                event.component,
                event.message
            ),
            None => log::log!(target: "nlm_lockd", event.level.as_log_level(), "{}: {}", event.component, event.message),
        }
    }
}

/// Collects events in memory; used by tests and the simulator. Can also
/// forward what it keeps to the `log` facade.
pub struct MemoryDiagnostics {
    log: Mutex<EventLog>,
    forward: Option<LogDiagnostics>,
}

impl MemoryDiagnostics {
    /// Keep everything, forward nothing.
    pub fn new(max_events: usize) -> Arc<Self> {
        Arc::new(MemoryDiagnostics {
            log: Mutex::new(EventLog::new(max_events, LogLevel::Debug)),
            forward: None,
        })
    }

    /// Keep events at `log_level` and above; with `trace_registries` set
    /// they also go to the `log` facade.
    pub fn from_config(config: &DiagnosticsConfig) -> Arc<Self> {
        let level = LogLevel::parse(&config.log_level).unwrap_or(LogLevel::Info);
        Arc::new(MemoryDiagnostics {
            log: Mutex::new(EventLog::new(config.max_log_events, level)),
            forward: config.trace_registries.then(|| LogDiagnostics::new(level)),
        })
    }

    pub fn events(&self) -> Vec<LogEvent> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner).events.clone()
    }
}

impl DiagnosticsHook for MemoryDiagnostics {
    fn record(&self, event: LogEvent) {
        if let Some(forward) = &self.forward {
            forward.record(event.clone());
        }
        self.log.lock().unwrap_or_else(PoisonError::into_inner).log(event);
    }
}
