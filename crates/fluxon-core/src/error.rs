//! Error taxonomy shared by every pipeline stage.

use thiserror::Error;

/// Unified result type for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from pipeline components, tagged by origin.
///
/// Workers do not retry: the first error is recorded in the worker's
/// [`Stats`](crate::convert::Stats), the shutdown flag is raised, and the
/// driver reports the first non-OK status it collects.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Bad CLI option or option combination.
    #[error("configuration error: {0}")]
    Config(String),

    /// Ingress client failure (connection, framing).
    #[error("ingress error: {0}")]
    Ingress(String),

    /// Malformed JSON or parser-backend rejection.
    #[error("parse error: {0}")]
    Parse(String),

    /// Device init, MMIO, or huge-page allocator failure.
    #[error("accelerator error: {0}")]
    Accelerator(String),

    /// Serialization failure or message-size ceiling exceeded.
    #[error("encode error: {0}")]
    Encode(String),

    /// Publisher send failure.
    #[error("bus error: {0}")]
    Bus(String),

    /// Invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_kind_prefix() {
        let e = Error::Encode("message too large".into());
        assert_eq!(e.to_string(), "encode error: message too large");
    }
}
