//! HTTP and WebSocket API

pub mod handlers;
pub mod routes;
pub mod server;
pub mod ws;

pub use server::ApiServer;
