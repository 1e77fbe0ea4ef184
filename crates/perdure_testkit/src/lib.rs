//! # Perdure Testkit
//!
//! Test utilities for Perdure.
//!
//! This crate provides:
//! - Item types and a database harness for engine tests
//! - Fault-injecting accessor wrappers (stalls, targeted failures)
//!
//! ## Usage
//!
//! ```rust
//! use perdure_testkit::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let harness = TestHarness::open("main")?;
//! let things = harness.db.collection::<TestItem>("things")?;
//! let batch = harness.batch();
//! things.create(&batch, TestItem::new(7, "seven")).await?;
//! assert!(batch.commit().await?.is_fully_committed());
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod accessors;
pub mod fixtures;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::accessors::*;
    pub use crate::fixtures::*;
}

pub use accessors::*;
pub use fixtures::*;
