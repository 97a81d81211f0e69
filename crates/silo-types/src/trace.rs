//! W3C trace context carried on every envelope, plus the shared secret
//! redaction helper used by the flight recorder and audit sinks.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// Replacement text substituted for secret-bearing values.
pub const REDACTED: &str = "[REDACTED]";

/// Field-name fragments that mark a value as secret-bearing.
const SENSITIVE_MARKERS: &[&str] = &["password", "secret", "token", "credential", "apikey"];

//─────────────────────────────
//  Trace context
//─────────────────────────────

/// W3C trace context: 128-bit trace id, 64-bit span id and the sampled flag.
///
/// Rendered and parsed in the `traceparent` header format so dispatch traces
/// correlate with whatever collector sits outside the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    /// 128-bit trace identifier shared by every span in the trace.
    pub trace_id: u128,
    /// 64-bit identifier of the current span.
    pub span_id: u64,
    /// Whether the trace is sampled for export.
    pub sampled: bool,
}

impl TraceContext {
    /// Create a fresh root context from the given identifiers.
    pub fn new(trace_id: u128, span_id: u64, sampled: bool) -> Self {
        Self {
            trace_id,
            span_id,
            sampled,
        }
    }

    /// Derive a child context: same trace id, new span id, inherited flag.
    pub fn child(&self, span_id: u64) -> Self {
        Self {
            trace_id: self.trace_id,
            span_id,
            sampled: self.sampled,
        }
    }

    /// Render as a W3C `traceparent` value, version 00.
    pub fn traceparent(&self) -> String {
        format!(
            "00-{:032x}-{:016x}-{:02x}",
            self.trace_id,
            self.span_id,
            if self.sampled { 1 } else { 0 }
        )
    }

    /// Parse a version-00 `traceparent` value.
    ///
    /// Returns `None` on any structural mismatch; callers fall back to a
    /// fresh root context.
    pub fn parse(header: &str) -> Option<Self> {
        let mut parts = header.split('-');
        let version = parts.next()?;
        if version != "00" {
            return None;
        }
        let trace_id = u128::from_str_radix(parts.next()?, 16).ok()?;
        let span_id = u64::from_str_radix(parts.next()?, 16).ok()?;
        let flags = u8::from_str_radix(parts.next()?, 16).ok()?;
        if parts.next().is_some() || trace_id == 0 || span_id == 0 {
            return None;
        }
        Some(Self {
            trace_id,
            span_id,
            sampled: flags & 0x01 != 0,
        })
    }
}

//─────────────────────────────
//  Redaction
//─────────────────────────────

/// Redact a value when its field name marks it as secret-bearing.
///
/// The check is case-insensitive over the field name only; values are never
/// inspected. Non-sensitive fields borrow the input unchanged.
pub fn redact_value<'a>(field: &str, value: &'a str) -> Cow<'a, str> {
    let lowered = field.to_ascii_lowercase();
    if SENSITIVE_MARKERS.iter().any(|m| lowered.contains(m)) {
        Cow::Borrowed(REDACTED)
    } else {
        Cow::Borrowed(value)
    }
}

/// Redact secret-bearing `key=value` fragments inside a free-form line.
///
/// Used by the flight recorder, where lines are human-readable and may embed
/// connection strings or header dumps.
pub fn redact_line(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    for (i, fragment) in line.split_whitespace().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        match fragment.split_once('=') {
            Some((key, _)) if redact_value(key, "x") == REDACTED => {
                out.push_str(key);
                out.push('=');
                out.push_str(REDACTED);
            }
            _ => out.push_str(fragment),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traceparent_round_trip() {
        let ctx = TraceContext::new(0x4bf92f3577b34da6a3ce929d0e0e4736, 0x00f067aa0ba902b7, true);
        let rendered = ctx.traceparent();
        assert_eq!(
            rendered,
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01"
        );
        assert_eq!(TraceContext::parse(&rendered), Some(ctx));
    }

    #[test]
    fn parse_rejects_malformed_headers() {
        assert!(TraceContext::parse("").is_none());
        assert!(TraceContext::parse("01-abc-def-00").is_none());
        assert!(TraceContext::parse("00-zz-def-00").is_none());
        // All-zero trace id is invalid per the W3C spec.
        let zeros = format!("00-{:032x}-{:016x}-01", 0u128, 5u64);
        assert!(TraceContext::parse(&zeros).is_none());
    }

    #[test]
    fn sensitive_fields_are_redacted() {
        assert_eq!(redact_value("password", "hunter2"), REDACTED);
        assert_eq!(redact_value("ApiKey", "abc"), REDACTED);
        assert_eq!(redact_value("connection_secret", "dsn"), REDACTED);
        assert_eq!(redact_value("culture", "en-GB"), "en-GB");
    }

    #[test]
    fn lines_redact_key_value_pairs() {
        let line = "dialing backend password=hunter2 host=db1";
        assert_eq!(redact_line(line), "dialing backend password=[REDACTED] host=db1");
    }
}
