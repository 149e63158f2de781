//! HTTP and WebSocket request handlers
//!
//! - `api` - Health check endpoint
//! - `realtime` - Client WebSocket relayed to the realtime AI service

pub mod api;
pub mod realtime;

pub use realtime::realtime_handler;
