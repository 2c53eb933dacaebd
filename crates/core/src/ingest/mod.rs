pub mod limiter;
pub mod provider;
pub mod runner;
pub mod types;
