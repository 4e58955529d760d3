//! Shared utility functions for envforge.
//!
//! This module provides helpers used across multiple modules: YAML deep
//! merging and first-match pattern rules over package names.

pub mod merge;
pub mod patterns;

pub use merge::deep_merge;
pub use patterns::{first_match, matches_any, prefix_regex};
