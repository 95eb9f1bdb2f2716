//! # openstudio-common
//!
//! Shared ids, configuration manifest loading, and error handling used
//! across every OpenStudio crate. Foundation layer only — no business logic.

pub mod config;
pub mod error;
pub mod ids;
