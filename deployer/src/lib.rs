//! Mineclifford Deployer Library
//!
//! Provisions cloud hosts with Terraform, configures them with Ansible and
//! reports ordered progress for each deployment.

pub mod app;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod http;
pub mod logs;
pub mod models;
pub mod server;
pub mod storage;
pub mod store;
pub mod utils;
