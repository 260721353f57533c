//! Mineclifford deployer API models
//!
//! Request and response bodies exchanged with the presentation layer,
//! including the progress-event wire contract.

pub mod models;

pub use models::*;
