//! On-disk configuration for chatloom.

mod schema;

pub use schema::{ChatConfig, Config, MemoryConfig, ProviderConfig};
