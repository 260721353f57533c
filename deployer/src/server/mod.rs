//! Local HTTP and WebSocket API

pub mod handlers;
pub mod serve;
pub mod state;
