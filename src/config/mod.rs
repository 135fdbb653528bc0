//! # Configuration Module
//!
//! Central home for Arbor's constants. Values that derive from one another
//! live together in [`constants`] with compile-time assertions guarding the
//! derivations, so a change to the page size or header layout fails the
//! build instead of corrupting files.

pub mod constants;

pub use constants::*;
