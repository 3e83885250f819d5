// =============================================================================
// Engine error types
// =============================================================================

use thiserror::Error;

/// Errors surfaced by the strategy execution core.
///
/// Broker-facing operations deliberately return booleans instead (a false
/// return leaves trade state untouched); this enum covers configuration and
/// worker lifecycle faults.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("timeframe chain is invalid: {0}")]
    TimeframeChain(String),

    #[error("worker {0} already started")]
    AlreadyStarted(String),

    #[error("worker {0} failed to start: {1}")]
    Startup(String, String),
}
