pub mod client;
pub mod config;
pub mod filename;
pub mod logger;
