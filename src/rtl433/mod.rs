//! rtl_433 decoder integration: subprocess supervision and raw ingest.

pub mod decoder;
pub mod sink;

pub use decoder::{RawStore, StoreError};
pub use sink::SqlStore;
