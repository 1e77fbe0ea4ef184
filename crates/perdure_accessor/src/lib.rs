//! # Perdure Accessor
//!
//! Storage boundary for the Perdure persistence engine.
//!
//! This crate provides:
//! - The [`Accessor`] trait: durable read/write/scan of opaque records
//!   addressed by collection name and entity id
//! - [`AccessorError`] with its recoverable/unrecoverable classification
//! - [`MemoryAccessor`]: an instrumented in-memory accessor for tests and
//!   ephemeral databases
//!
//! Accessors are **opaque record stores**. Perdure owns all record format
//! interpretation; accessors never look inside the payload bytes.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod accessor;
mod error;
mod memory;

pub use accessor::Accessor;
pub use error::{AccessorError, AccessorResult, ErrorClass};
pub use memory::{CallCounts, MemoryAccessor};
