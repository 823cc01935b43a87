//! Arbor Store
//!
//! The persistence seam for the branch-graph engine.
//!
//! # Overview
//!
//! The store layer provides:
//! - **KvStore**: async key-value trait with set membership, prefix scans and
//!   versioned compare-and-swap
//! - **MemoryStore**: concurrent in-process backend with JSON snapshots
//! - **Records**: typed JSON documents with optimistic read-modify-write loops
//!
//! # Example
//!
//! ```rust
//! use arbor_store::{MemoryStore, Records};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), arbor_store::StoreError> {
//! let records = Records::new(Arc::new(MemoryStore::new()));
//!
//! records.save("counter", &1u32).await?;
//! records.update("counter", |n: &mut u32| -> Result<(), arbor_store::StoreError> {
//!     *n += 1;
//!     Ok(())
//! }).await?;
//!
//! assert_eq!(records.load::<u32>("counter").await?, Some(2));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod error;
pub mod memory;
pub mod records;
pub mod store;

// Re-exports
pub use error::StoreError;
pub use memory::{MemoryStore, StoreSnapshot};
pub use records::{Records, DEFAULT_CAS_ATTEMPTS};
pub use store::{KvStore, Version, Versioned};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
