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

//! Session state for chatloom.
//!
//! The [`SessionStore`] owns every session, drives streaming replies into
//! their placeholder messages and keeps the collection persisted.
//!
//! # Key Features
//! - Identity-keyed cancellation of in-flight replies
//! - Background topic derivation and memory compression
//! - Revision-ordered snapshots through a pluggable [`SnapshotStore`]
//! - Change notification and a hydration signal for front-ends

mod collection;
mod error;
pub mod persist;
mod store;
pub mod topic;

pub use collection::{SessionCollection, Snapshot};
pub use error::StoreError;
pub use persist::{JsonFileStore, MemorySnapshotStore, SnapshotStore};
pub use store::{MemoryView, SessionStore, StoreConfig, StoreEvent, SubmitOutcome};
