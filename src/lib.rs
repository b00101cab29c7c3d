pub mod agent;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod exec;
pub mod providers;
pub mod trace;
pub mod vpp;

pub use client::Client;
pub use error::{ProbeError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
