//! Data models

pub mod progress;
pub mod request;
pub mod server;
