//! API server implementation
//!
//! Provides REST and WebSocket endpoints for operating the proxy pool.

pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod server;
pub mod websocket;

pub use server::{ApiServer, AppState};
