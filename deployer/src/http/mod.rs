//! Record API client

pub mod client;
pub mod servers;
