//! # Error Module
//!
//! Every fallible operation in the crate returns [`FollowError`]. Detectors
//! never use it for "nothing heard": silence, short windows and missing lags
//! are `None`, not errors.

use std::time::Duration;
use thiserror::Error;

/// Errors raised by configuration, score parsing and the pipeline threads.
#[derive(Debug, Error)]
pub enum FollowError {
    /// A threshold, size or tolerance was out of range at construction.
    #[error("invalid configuration `{field}`: {msg}")]
    Config {
        /// The offending field.
        field: &'static str,
        /// What was wrong with it.
        msg: String,
    },

    /// A note name could not be parsed (e.g. `H4`, `C#`, `Q9`).
    #[error("unparseable note name `{0}`")]
    InvalidNoteName(String),

    /// A score entry was malformed.
    #[error("invalid score entry {index}: {msg}")]
    InvalidScore {
        /// Position of the entry in the definition.
        index: usize,
        /// Description of the problem.
        msg: String,
    },

    /// A bounded operation (offline analysis) did not finish in time.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The remote detector could not be reached or dropped the session.
    #[error("remote detector unavailable: {0}")]
    Transport(String),

    /// The audio source failed to open or stopped unexpectedly.
    #[error("audio source error: {0}")]
    Audio(String),

    /// A worker hung up before delivering its result.
    #[error("worker channel closed")]
    ChannelClosed,

    /// Reading or writing a config / score file failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A config / score file was not valid JSON for its schema.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, FollowError>;

impl FollowError {
    pub(crate) fn config(field: &'static str, msg: impl Into<String>) -> Self {
        FollowError::Config {
            field,
            msg: msg.into(),
        }
    }
}

/// Fails with a `Config` error unless `value` is finite and strictly positive.
pub(crate) fn ensure_positive(field: &'static str, value: f32) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(FollowError::config(field, format!("must be > 0, got {value}")))
    }
}

/// Fails with a `Config` error unless `value` lies in `[lo, hi]`.
pub(crate) fn ensure_range(field: &'static str, value: f32, lo: f32, hi: f32) -> Result<()> {
    if value.is_finite() && value >= lo && value <= hi {
        Ok(())
    } else {
        Err(FollowError::config(
            field,
            format!("must be within [{lo}, {hi}], got {value}"),
        ))
    }
}
