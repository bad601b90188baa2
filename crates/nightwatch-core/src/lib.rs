//! Core domain model for the nightwatch portfolio monitor.
//!
//! Everything in this crate is pure: data types, the statistical kernel,
//! the alert/digest model and the consolidation policy. I/O (blob store,
//! SMTP, CLI) lives in the sibling crates.

pub mod alert;
pub mod clock;
pub mod config;
pub mod dataset;
pub mod digest;
pub mod error;
pub mod registry;
pub mod stats;

pub use error::CoreError;
