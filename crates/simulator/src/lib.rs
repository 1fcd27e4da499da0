//! Fork-based simulation and pre-flight validation
//!
//! This crate dry-runs single calls and ordered call sequences against
//! disposable forks of chain state, and attaches pre-flight warnings to
//! planned items before they are signed.

pub mod engine;
pub mod traits;
pub mod validation;

pub use engine::*;
pub use traits::*;
pub use validation::*;
