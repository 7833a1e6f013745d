//! The work handler seam.
//!
//! The coordinator owns exactly one handler: a synchronous function taking a
//! task string and returning a result string. It runs on tokio's blocking
//! pool, so it may block freely, but it can be invoked from several
//! connections at once and must therefore be `Send + Sync`.

use crate::error::HandlerError;

pub type HandlerResult = Result<String, HandlerError>;

/// Task-in/task-out work handler.
pub trait WorkHandler: Send + Sync + 'static {
    fn handle(&self, request: &str) -> HandlerResult;
}

impl<F> WorkHandler for F
where
    F: Fn(&str) -> HandlerResult + Send + Sync + 'static,
{
    fn handle(&self, request: &str) -> HandlerResult {
        self(request)
    }
}

/// Handler that answers every request with its own payload.
///
/// Used by the `coordinator` and `host` binaries for smoke testing.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoHandler;

impl WorkHandler for EchoHandler {
    fn handle(&self, request: &str) -> HandlerResult {
        Ok(request.to_string())
    }
}

/// Run a handler on the blocking pool, folding panics into a `HandlerError`.
pub(crate) async fn invoke_blocking(
    handler: std::sync::Arc<dyn WorkHandler>,
    request: String,
) -> HandlerResult {
    match tokio::task::spawn_blocking(move || handler.handle(&request)).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => {
            tracing::error!(target: "taskbridge::handler", "Work handler panicked");
            Err(HandlerError::new("Handler panicked"))
        }
        Err(e) => Err(HandlerError::new(format!("Handler task failed: {}", e))),
    }
}
