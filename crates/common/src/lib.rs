pub mod config;
pub mod db;
pub mod error;
pub mod store;
pub mod telemetry;
pub mod types;
