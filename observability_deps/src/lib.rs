//! This crate exists to coordinate versions of `tracing` and friends across the workspace.
//!
//! Crates log via `use observability_deps::tracing::{debug, info, warn};` instead of depending on
//! `tracing` directly, so there is exactly one place to bump the version or flip level features.
#![warn(missing_docs)]

pub use tracing;
