// Call profiles: client timing with the server's spans nested inside.

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// Timing of one call, with the server's own spans nested underneath.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileSpan {
    pub name: String,
    pub started_at: Option<DateTime<Utc>>,
    pub duration: Duration,
    /// Seconds the server spent importing code for this call.
    pub import_duration: Option<f64>,
    pub children: Vec<ProfileSpan>,
}

impl ProfileSpan {
    pub fn new(name: impl Into<String>, started_at: DateTime<Utc>, duration: Duration) -> Self {
        Self {
            name: name.into(),
            started_at: Some(started_at),
            duration,
            import_duration: None,
            children: Vec::new(),
        }
    }

    /// Parse a server profile `{description, start_time, end_time, children}`.
    /// Times are Unix seconds.
    pub fn from_server(value: &JsonValue) -> Option<Self> {
        let obj = value.as_object()?;
        let name = obj
            .get("description")
            .and_then(JsonValue::as_str)
            .unwrap_or("server")
            .to_string();
        let start = obj.get("start_time").and_then(JsonValue::as_f64);
        let end = obj.get("end_time").and_then(JsonValue::as_f64);

        let duration = match (start, end) {
            (Some(start), Some(end)) => Duration::try_from_secs_f64(end - start).unwrap_or_else(|e| {
                debug!("Ignoring server span duration {} - {}: {}", end, start, e);
                Duration::ZERO
            }),
            _ => Duration::ZERO,
        };
        let started_at = start.and_then(timestamp);
        let children = obj
            .get("children")
            .and_then(JsonValue::as_array)
            .map(|children| children.iter().filter_map(Self::from_server).collect())
            .unwrap_or_default();

        Some(Self {
            name,
            started_at,
            duration,
            import_duration: None,
            children,
        })
    }

    /// Number of spans in this tree, including this one.
    pub fn span_count(&self) -> usize {
        1 + self.children.iter().map(Self::span_count).sum::<usize>()
    }
}

/// Unix seconds to a timestamp; `None` outside the representable range.
fn timestamp(seconds: f64) -> Option<DateTime<Utc>> {
    if !seconds.is_finite() || seconds < i64::MIN as f64 || seconds >= i64::MAX as f64 {
        return None;
    }
    let whole = seconds.floor();
    let nanos = ((seconds - whole) * 1e9).min(999_999_999.0) as u32;
    DateTime::from_timestamp(whole as i64, nanos)
}

impl fmt::Display for ProfileSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn write_span(f: &mut fmt::Formatter<'_>, span: &ProfileSpan, depth: usize) -> fmt::Result {
            write!(
                f,
                "{:indent$}{} {:.3}ms",
                "",
                span.name,
                span.duration.as_secs_f64() * 1000.0,
                indent = depth * 2
            )?;
            if let Some(import) = span.import_duration {
                write!(f, " (import {:.3}ms)", import * 1000.0)?;
            }
            for child in &span.children {
                writeln!(f)?;
                write_span(f, child, depth + 1)?;
            }
            Ok(())
        }
        write_span(f, self, 0)
    }
}

/// Receives the profile of every completed call.
pub trait ProfileSink: Send + Sync {
    fn record(&self, span: ProfileSpan);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProfileSink;

impl ProfileSink for TracingProfileSink {
    fn record(&self, span: ProfileSpan) {
        debug!(target: "portrpc_client::profile", "Call profile:\n{}", span);
    }
}
