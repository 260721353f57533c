//! Deployment pipeline

pub mod configure;
pub mod coordinator;
pub mod fsm;
pub mod progress;
pub mod provision;
pub mod registry;
pub mod stage;
