//! Execution state broadcast
//!
//! The hub fans execution array mutations out to rooms of subscribed
//! connections. The client keeps a durable subscription set and replays it
//! on every reconnect.

pub mod client;
pub mod connector;
pub mod hub;

pub use client::*;
pub use connector::*;
pub use hub::*;
