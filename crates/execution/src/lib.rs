//! Plan execution
//!
//! This crate seeds agent plans into observable execution arrays and drives
//! them through approval, signing, broadcast and finality.

pub mod approval;
pub mod array;
pub mod executioner;
pub mod options;
pub mod plan;

pub use approval::*;
pub use array::*;
pub use executioner::*;
pub use options::*;
pub use plan::*;
