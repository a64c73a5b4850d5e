use thiserror::Error;

/// Rejected store operations. A rejection never changes state.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("input is empty")]
    EmptyInput,

    #[error("no session at index {index} ({len} sessions)")]
    SessionIndexOutOfRange { index: usize, len: usize },

    #[error("no message at index {index} ({len} messages)")]
    MessageIndexOutOfRange { index: usize, len: usize },

    #[error("no user message at or before index {0}")]
    NoUserMessage(usize),
}
