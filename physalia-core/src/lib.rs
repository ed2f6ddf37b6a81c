//! Shared primitives for the Physalia phylogenetics workspace.
//!
//! `physalia-core` provides the foundation the engine crates build on:
//!
//! - **Error types** — [`PhysaliaError`] and [`Result`] for structured error handling
//! - **Traits** — [`Summarizable`] for one-line diagnostics

pub mod error;
pub mod traits;

pub use error::{PhysaliaError, Result};
pub use traits::Summarizable;
