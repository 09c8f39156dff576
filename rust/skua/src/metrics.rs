//! Latency observation contract for server bindings.

use std::time::Duration;

use skua_wire::Cmd;

/// Receives one observation per completed request.
///
/// A binding may carry one of these; the server reports every handler
/// completion to it, tagged with the command and, when the handler
/// panicked, the panic message. Implementations are typically thin
/// adapters over a metrics registry and must be thread-safe: observations
/// for concurrent non-blocking requests arrive from different tasks.
pub trait LatencyObserver: Send + Sync {
    /// Record one request. `error` is `Some` when the handler panicked.
    fn observe(&self, cmd: Cmd, error: Option<&str>, elapsed: Duration);
}
