#![warn(
    clippy::all,
    clippy::nursery,
    clippy::pedantic,
    clippy::style,
    clippy::complexity,
    clippy::perf,
    clippy::correctness,
    clippy::suspicious,
    clippy::unwrap_used,
    clippy::expect_used
)]
#![allow(
    clippy::similar_names,
    clippy::missing_safety_doc,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc
)]

//! Memory compression for long conversations.
//!
//! Older turns of a session are folded into a running summary (the memory
//! prompt) so the context sent to the model stays bounded. Compression is
//! best-effort: a failed summarization leaves the session as it was.

mod compressor;
mod prompt;

pub use compressor::{CompressionError, CompressionPlan, MemoryCompressor, MemoryUpdate};
pub use prompt::build_summary_context;
