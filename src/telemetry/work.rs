//! Work execution span helpers.

use tracing::Span;

/// Start a span covering one pulled work item.
///
/// `work.exit_code` is declared empty and filled by [`record_exit`].
pub fn start_work_span(worker_id: &str) -> Span {
    tracing::info_span!(
        "work.execute",
        "worker.id" = worker_id,
        "work.command" = tracing::field::Empty,
        "work.correlation_id" = tracing::field::Empty,
        "work.exit_code" = tracing::field::Empty,
    )
}

/// Attach the decoded item's identity to the span.
pub fn record_item(span: &Span, command: &str, correlation_id: Option<&str>) {
    span.record("work.command", command);
    if let Some(id) = correlation_id {
        span.record("work.correlation_id", id);
    }
}

pub fn record_exit(span: &Span, exit_code: i32) {
    span.record("work.exit_code", exit_code);
}
