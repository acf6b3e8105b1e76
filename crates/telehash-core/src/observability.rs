//! Thin observability facade.
//!
//! The switch does not own a metrics or tracing backend (out of scope per
//! the project's Non-goals); it only needs a stable place to hang `tracing`
//! spans so a host application can wire up whatever subscriber it wants.
//! This mirrors the teacher's `observability::facade` module, minus the
//! OpenTelemetry resource/exporter plumbing that has no counterpart here.

/// Span name used for the lifetime of one switch's run loop.
pub const SPAN_RUN_LOOP: &str = "telehash.switch.run_loop";

/// Span name used for a single line's lifetime (open through close).
pub const SPAN_LINE: &str = "telehash.switch.line";

/// Span name used for a single channel's lifetime (open through close).
pub const SPAN_CHANNEL: &str = "telehash.switch.channel";
