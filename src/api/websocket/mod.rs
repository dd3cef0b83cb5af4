//! WebSocket handlers
//!
//! Each connection gets a bounded buffer; when a client falls behind, events
//! are dropped rather than queued without limit.

pub mod events;

/// Maximum number of messages to buffer per WebSocket connection
pub const WS_BUFFER_SIZE: usize = 256;
