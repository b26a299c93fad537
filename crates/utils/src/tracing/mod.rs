use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// Re-export tracing macros for convenience
pub use tracing::{debug, error, info, instrument, span, trace, warn, Level, Span};

/// Initialize the tracing system
///
/// Honors `RUST_LOG` when set and falls back to `info`. Output goes to stderr
/// so stdout stays free for the usage text. ANSI colors are only used when
/// stderr is a terminal.
pub fn init() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(is_tty())
        .compact()
        .with_target(false)
        .with_thread_names(true)
        .with_level(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()?;

    Ok(())
}

/// Check if we're running in a TTY environment
fn is_tty() -> bool {
    std::io::IsTerminal::is_terminal(&std::io::stderr())
}

/// Create a span covering one request as seen by a worker
pub fn request_span(worker: usize, request_id: u64, path: &str) -> Span {
    span!(Level::DEBUG, "request", worker = worker, request_id = request_id, path = %path)
}

/// Emit a structured event for a finished request
pub fn request_completed(request_id: u64, path: &str, outcome: &str, bytes: u64, chunks: u64) {
    debug!(
        request_id = request_id,
        path = %path,
        outcome = %outcome,
        bytes = bytes,
        chunks = chunks,
        "request_completed"
    );
}
