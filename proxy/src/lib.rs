pub mod config;
pub mod getwork;
pub mod jobs;
pub mod upstream;

/// Version string reported to pools in the `eth_submitLogin` client name.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
