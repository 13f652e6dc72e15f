//! Error taxonomy for the load pipeline.

use thiserror::Error;

use crate::codec::DecodeError;
use crate::net::NetworkError;

/// Why a load produced no bitmap.
///
/// This never crosses the public delivery boundary: every failure collapses
/// to a `None` delivery, and whether to show a placeholder is the caller's
/// decision. The variants exist for logging and control flow inside the
/// engine.
#[derive(Debug, Error)]
pub enum LoadError {
    /// The fetch failed at the transport or HTTP layer.
    #[error("network failure: {0}")]
    Network(#[from] NetworkError),

    /// The fetched bytes could not be decoded.
    #[error("decode failure: {0}")]
    Decode(#[from] DecodeError),

    /// The caller cancelled the last waiting request.
    #[error("cancelled by caller")]
    Cancelled,
}
