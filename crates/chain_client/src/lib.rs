//! Chain client capabilities for the Plan Executor
//!
//! This crate defines the narrow capabilities the engine consumes from the
//! outside world (submission, fork sessions, signing) and ships an in-memory
//! development chain plus dev and HTTP signers implementing them.

pub mod local;
pub mod signer;
pub mod traits;

pub use local::*;
pub use signer::*;
pub use traits::*;
